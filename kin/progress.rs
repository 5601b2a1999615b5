//! Progress reporting hooks for long kinship runs.
//!
//! The engine reports each stage's size up front and then the number of years
//! processed; the command-line binary forwards these to a progress bar.

use std::fmt;

/// Stages reported while computing kinship.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProjectionStage {
    /// Checking that each supplied period's causes of death cover its deaths.
    Rates,
    /// Stepping kin panels through calendar years.
    Projection,
}

impl ProjectionStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Rates => "period rates",
            Self::Projection => "kin projection",
        }
    }
}

impl fmt::Display for ProjectionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting incremental progress during a kinship run.
pub trait ProjectionObserver {
    fn on_stage_start(&mut self, stage: ProjectionStage, total_years: usize) {
        let _ = (stage, total_years);
    }
    fn on_stage_advance(&mut self, stage: ProjectionStage, processed_years: usize) {
        let _ = (stage, processed_years);
    }
    fn on_stage_finish(&mut self, stage: ProjectionStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopProgress;

impl ProjectionObserver for NoopProgress {}
