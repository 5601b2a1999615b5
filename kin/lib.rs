#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
//! Matrix kinship models: expected numbers and age/stage/sex distributions of
//! a Focal individual's relatives, living and dead, under given vital rates.

pub mod causes;
pub mod config;
pub mod coupler;
pub mod engine;
pub mod io;
pub mod kin_type;
mod lineage;
pub mod operators;
pub mod progress;
pub mod rates;
mod rules;
pub mod stable;
pub mod summary;

pub use config::{ConfigError, KinshipConfig, RunConfig, StageMode, TimeMode};
pub use coupler::{DEFAULT_BIRTH_FEMALE, Sex, SexMode};
pub use engine::{
    KinshipError, KinshipOutput, KinshipRates, compute_kinship, compute_kinship_with_progress,
};
pub use kin_type::{KinSelection, KinType};
pub use rates::{CauseHazards, Grid, HorizonPolicy, RateError, RateInput, VitalRates};
pub use summary::{FullRow, SummaryRow};
