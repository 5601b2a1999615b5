#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;

use kinmat::config::RunConfig;
use kinmat::engine::{KinshipRates, compute_kinship_with_progress};
use kinmat::io::{RateFiles, birth_stage_matrix, load_rate_input, write_full, write_summary};
use kinmat::kin_type::KinType;
use kinmat::progress::{ProjectionObserver, ProjectionStage};

#[derive(Parser)]
#[command(name = "kinmat", about = "Matrix kinship models", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute kin tables for a run described by a TOML file
    Run {
        /// Path to the run configuration
        #[arg(value_name = "RUN_CONFIG")]
        config: PathBuf,

        /// Write only the summary table, even if a full table path is configured
        #[arg(long)]
        summary_only: bool,
    },
    /// List the kin codes accepted in run configurations
    Kin {
        /// Use two-sex labels
        #[arg(long)]
        two_sex: bool,
    },
}

/// Drives one progress bar per projection stage.
struct BarObserver {
    bar: Option<ProgressBar>,
}

impl BarObserver {
    fn new() -> Self {
        Self { bar: None }
    }
}

impl ProjectionObserver for BarObserver {
    fn on_stage_start(&mut self, stage: ProjectionStage, total_years: usize) {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let pb = ProgressBar::with_draw_target(Some(total_years as u64), draw_target);
        if let Ok(style) = ProgressStyle::with_template(
            "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} years ({eta}) {msg}",
        ) {
            pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        pb.set_message(stage.to_string());
        self.bar = Some(pb);
    }

    fn on_stage_advance(&mut self, _stage: ProjectionStage, processed_years: usize) {
        if let Some(pb) = &self.bar {
            pb.set_position(processed_years as u64);
        }
    }

    fn on_stage_finish(&mut self, _stage: ProjectionStage) {
        if let Some(pb) = self.bar.take() {
            pb.finish_and_clear();
        }
    }
}

fn run(config_path: PathBuf, summary_only: bool) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = RunConfig::load(&config_path)?;
    if summary_only {
        config.model.summary_only = true;
    }
    if config.outputs.full.is_none() {
        config.model.summary_only = true;
    }

    let birth_stages = match &config.birth_stages {
        Some(rows) => Some(
            birth_stage_matrix(rows)
                .ok_or("birth_stages rows must all have the same length")?,
        ),
        None => None,
    };
    let inputs = &config.inputs;
    let female = load_rate_input(
        RateFiles {
            rates: &inputs.female_rates,
            transitions: inputs.female_transitions.as_deref(),
            causes: inputs.female_causes.as_deref(),
        },
        birth_stages.as_ref(),
    )?;
    let male = match &inputs.male_rates {
        Some(path) => Some(load_rate_input(
            RateFiles {
                rates: path,
                transitions: inputs.male_transitions.as_deref(),
                causes: inputs.male_causes.as_deref(),
            },
            birth_stages.as_ref(),
        )?),
        None => None,
    };
    let rates = KinshipRates { female, male };

    let mut observer = BarObserver::new();
    let output = compute_kinship_with_progress(&rates, &config.model, &mut observer)?;

    write_summary(&config.outputs.summary, &output)?;
    if let (Some(path), Some(rows)) = (&config.outputs.full, &output.full) {
        write_full(path, rows)?;
    }
    Ok(())
}

fn list_kin(two_sex: bool) {
    for kin in KinType::ALL {
        println!("{:<5} {}", kin.code(), kin.label(two_sex));
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Run {
            config,
            summary_only,
        }) => run(config, summary_only),
        Some(Commands::Kin { two_sex }) => {
            list_kin(two_sex);
            Ok(())
        }
        None => {
            if let Err(e) = Cli::command().print_help() {
                eprintln!("Error: {e}");
            }
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
