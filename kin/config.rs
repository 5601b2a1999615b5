//! Run configuration: what to compute and how to model it.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::coupler::{Sex, SexMode};
use crate::kin_type::{KinSelection, UnknownKinCode};
use crate::operators::TerminalAge;
use crate::rates::HorizonPolicy;
use crate::stable::{ParentalAges, StableSettings};

/// Whether rates are constant or change by calendar year.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimeMode {
    #[default]
    Invariant,
    /// Rates per calendar year. Output is selected by calendar year (every
    /// Focal age alive in that year) and by birth cohort (Focal's whole life).
    Varying {
        #[serde(default)]
        output_years: Vec<i32>,
        #[serde(default)]
        output_cohorts: Vec<i32>,
        #[serde(default)]
        horizon: HorizonPolicy,
    },
}

/// Whether kin are classified by a stage besides age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageMode {
    #[default]
    AgeOnly,
    Staged { stages: usize },
}

impl StageMode {
    pub fn stages(&self) -> usize {
        match self {
            Self::AgeOnly => 1,
            Self::Staged { stages } => *stages,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error(transparent)]
    UnknownKin(#[from] UnknownKinCode),
    #[error("output year {year} lies outside the supplied periods {first}..={last}")]
    YearOutOfRange { year: i32, first: i32, last: i32 },
    #[error("output cohort {cohort} lies outside the supplied periods {first}..={last}")]
    CohortOutOfRange { cohort: i32, first: i32, last: i32 },
    #[error("a time-varying run needs at least one output year or cohort")]
    EmptyOutputSelection,
    #[error("two-sex runs need male rates; use the androgynous mode to reuse the female rates")]
    MissingMaleRates,
    #[error("a male Focal needs a two-sex or androgynous run")]
    MaleFocalInOneSexRun,
    #[error("proportion female at birth must lie strictly between 0 and 1, got {0}")]
    InvalidBirthFemale(f64),
    #[error("stage mode expects {expected} stages but the rates have {found}")]
    StageMismatch { expected: usize, found: usize },
    #[error("time-varying runs need rates given per calendar year")]
    RatesNotPeriodic,
    #[error("time-invariant runs need a single set of constant rates")]
    RatesNotConstant,
    #[error("female rates cover {female:?} but male rates cover {male:?}")]
    PeriodSpanMismatch { female: (i32, i32), male: (i32, i32) },
    #[error("stable population settings need a positive tolerance and iteration cap")]
    InvalidStableSettings,
}

/// Everything that selects the model variant and its output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KinshipConfig {
    pub focal_sex: Sex,
    pub sex_mode: SexMode,
    pub time_mode: TimeMode,
    pub stage_mode: StageMode,
    pub output_kin: KinSelection,
    pub summary_only: bool,
    pub parental_ages: ParentalAges,
    pub terminal_age: TerminalAge,
    /// Last modeled age ω; rates are padded or truncated to `ω + 1` ages.
    pub closure_age: Option<usize>,
    pub stable: StableSettings,
}

impl Default for KinshipConfig {
    fn default() -> Self {
        Self {
            focal_sex: Sex::Female,
            sex_mode: SexMode::default(),
            time_mode: TimeMode::default(),
            stage_mode: StageMode::default(),
            output_kin: KinSelection::All,
            summary_only: false,
            parental_ages: ParentalAges::default(),
            terminal_age: TerminalAge::default(),
            closure_age: None,
            stable: StableSettings::default(),
        }
    }
}

impl KinshipConfig {
    /// Checks the settings that do not depend on the rates.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(birth_female) = self.sex_mode.birth_female() {
            if !(birth_female > 0.0 && birth_female < 1.0) {
                return Err(ConfigError::InvalidBirthFemale(birth_female));
            }
        }
        if self.focal_sex == Sex::Male && !self.sex_mode.is_two_sex() {
            return Err(ConfigError::MaleFocalInOneSexRun);
        }
        if let TimeMode::Varying {
            output_years,
            output_cohorts,
            ..
        } = &self.time_mode
        {
            if output_years.is_empty() && output_cohorts.is_empty() {
                return Err(ConfigError::EmptyOutputSelection);
            }
        }
        if !(self.stable.tolerance > 0.0) || self.stable.max_iterations == 0 {
            return Err(ConfigError::InvalidStableSettings);
        }
        Ok(())
    }

    /// Output years and cohorts checked against the supplied span.
    pub(crate) fn checked_selection(
        &self,
        first: i32,
        last: i32,
    ) -> Result<(BTreeSet<i32>, BTreeSet<i32>), ConfigError> {
        let TimeMode::Varying {
            output_years,
            output_cohorts,
            ..
        } = &self.time_mode
        else {
            return Ok(Default::default());
        };
        let in_span = |value: &i32| (first..=last).contains(value);
        if let Some(&year) = output_years.iter().find(|y| !in_span(y)) {
            return Err(ConfigError::YearOutOfRange { year, first, last });
        }
        if let Some(&cohort) = output_cohorts.iter().find(|c| !in_span(c)) {
            return Err(ConfigError::CohortOutOfRange {
                cohort,
                first,
                last,
            });
        }
        Ok((
            output_years.iter().copied().collect(),
            output_cohorts.iter().copied().collect(),
        ))
    }
}

/// File-level description of a command-line run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub model: KinshipConfig,
    pub inputs: InputPaths,
    pub outputs: OutputPaths,
    /// Optional `[stages][stages]` birth-stage matrix, column `j` giving the
    /// newborn stage distribution for a parent in stage `j`.
    #[serde(default)]
    pub birth_stages: Option<Vec<Vec<f64>>>,
    /// Kin codes; empty means all kin.
    #[serde(default)]
    pub kin: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputPaths {
    pub female_rates: PathBuf,
    #[serde(default)]
    pub male_rates: Option<PathBuf>,
    #[serde(default)]
    pub female_transitions: Option<PathBuf>,
    #[serde(default)]
    pub male_transitions: Option<PathBuf>,
    #[serde(default)]
    pub female_causes: Option<PathBuf>,
    #[serde(default)]
    pub male_causes: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputPaths {
    pub summary: PathBuf,
    #[serde(default)]
    pub full: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum RunConfigError {
    #[error("I/O error reading run configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse run configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl RunConfig {
    /// Loads a run configuration from TOML. Relative input and output paths
    /// are resolved against the configuration file's directory.
    pub fn load(path: &Path) -> Result<Self, RunConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&text)?;
        if !config.kin.is_empty() {
            config.model.output_kin =
                KinSelection::from_codes(&config.kin).map_err(ConfigError::from)?;
        }
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        let inputs = &mut self.inputs;
        resolve(&mut inputs.female_rates);
        for path in [
            &mut inputs.male_rates,
            &mut inputs.female_transitions,
            &mut inputs.male_transitions,
            &mut inputs.female_causes,
            &mut inputs.male_causes,
            &mut self.outputs.full,
        ]
        .into_iter()
        .flatten()
        {
            resolve(path);
        }
        resolve(&mut self.outputs.summary);
    }
}
