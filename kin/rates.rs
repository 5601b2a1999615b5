//! # Rate preprocessing
//!
//! Validates raw vital rates and reshapes them into a uniform, period-indexed
//! schedule. Everything downstream of this module may assume:
//!
//! - every period shares one [`Grid`] (ages and stages),
//! - survival lies in `[0, 1]`, fertility and hazards are finite and non-negative,
//! - stage-transition and birth-stage matrices are square and column-stochastic,
//! - the schedule covers every calendar year the projection will visit.
//!
//! Violations are reported before any projection work starts.

use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

const STOCHASTIC_TOLERANCE: f64 = 1e-8;

/// The shared age (and stage) grid every rate and kin array is indexed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grid {
    pub ages: usize,
    pub stages: usize,
}

impl Grid {
    pub fn new(ages: usize, stages: usize) -> Self {
        Self { ages, stages }
    }

    /// Number of (age, stage) states for one sex.
    #[inline]
    pub fn states(&self) -> usize {
        self.ages * self.stages
    }

    /// Closure age ω.
    #[inline]
    pub fn omega(&self) -> usize {
        self.ages - 1
    }

    #[inline]
    pub fn index(&self, age: usize, stage: usize) -> usize {
        age * self.stages + stage
    }

    #[inline]
    pub fn age_of(&self, state: usize) -> usize {
        state / self.stages
    }

    #[inline]
    pub fn stage_of(&self, state: usize) -> usize {
        state % self.stages
    }

    pub fn is_multistage(&self) -> bool {
        self.stages > 1
    }

    /// Sums a state vector over stages, giving one entry per age.
    pub fn age_marginal(&self, values: &Array1<f64>) -> Array1<f64> {
        Array1::from_shape_fn(self.ages, |age| {
            (0..self.stages)
                .map(|stage| values[self.index(age, stage)])
                .sum()
        })
    }
}

/// Competing-risk hazards for partitioning deaths by cause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CauseHazards {
    pub names: Vec<String>,
    /// Shape `[causes, ages]`.
    pub hazards: Array2<f64>,
}

/// A single calendar-time cross-section of vital rates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VitalRates {
    /// Shape `[ages, stages]`: probability of surviving from age `a` to `a + 1`.
    pub survival: Array2<f64>,
    /// Shape `[ages, stages]`: expected births per individual during the year.
    pub fertility: Array2<f64>,
    /// One `[stages, stages]` matrix per age, column `j` giving the next stage
    /// of a survivor currently in stage `j`.
    pub stage_transitions: Option<Vec<Array2<f64>>>,
    /// Shape `[stages, stages]`: column `j` distributes the newborns of a
    /// parent in stage `j` over initial stages.
    pub birth_stages: Option<Array2<f64>>,
    pub causes: Option<CauseHazards>,
    /// Shape `[ages, stages]`: observed population counts.
    pub population: Option<Array2<f64>>,
}

impl VitalRates {
    /// Age-only rates from plain survival and fertility vectors.
    pub fn age_only(survival: Array1<f64>, fertility: Array1<f64>) -> Self {
        Self {
            survival: Array2::from_shape_fn((survival.len(), 1), |(age, _)| survival[age]),
            fertility: Array2::from_shape_fn((fertility.len(), 1), |(age, _)| fertility[age]),
            stage_transitions: None,
            birth_stages: None,
            causes: None,
            population: None,
        }
    }

    pub fn with_stage_transitions(mut self, transitions: Vec<Array2<f64>>) -> Self {
        self.stage_transitions = Some(transitions);
        self
    }

    pub fn with_birth_stages(mut self, birth_stages: Array2<f64>) -> Self {
        self.birth_stages = Some(birth_stages);
        self
    }

    pub fn with_causes(mut self, causes: CauseHazards) -> Self {
        self.causes = Some(causes);
        self
    }

    pub fn with_population(mut self, population: Array2<f64>) -> Self {
        self.population = Some(population);
        self
    }

    pub fn grid(&self) -> Grid {
        Grid::new(self.survival.nrows(), self.survival.ncols())
    }

    pub fn cause_count(&self) -> usize {
        self.cause_names().len()
    }

    /// Cause labels in hazard-row order; empty without cause data.
    pub fn cause_names(&self) -> &[String] {
        self.causes.as_ref().map_or(&[], |c| c.names.as_slice())
    }

    fn validate(&self, period: PeriodLabel) -> Result<(), RateError> {
        let grid = self.grid();
        if grid.ages == 0 || grid.stages == 0 {
            return Err(RateError::EmptyGrid { period });
        }
        if self.fertility.dim() != self.survival.dim() {
            return Err(RateError::DimensionMismatch {
                period,
                field: "fertility",
                expected: self.survival.dim(),
                found: self.fertility.dim(),
            });
        }
        check_values(self.survival.view(), period, "survival", true)?;
        check_values(self.fertility.view(), period, "fertility", false)?;

        if let Some(transitions) = &self.stage_transitions {
            if transitions.len() != grid.ages {
                return Err(RateError::TransitionCount {
                    period,
                    expected: grid.ages,
                    found: transitions.len(),
                });
            }
            for (age, matrix) in transitions.iter().enumerate() {
                check_stochastic(matrix.view(), grid.stages, period, "stage_transitions", Some(age))?;
            }
        }
        if let Some(birth_stages) = &self.birth_stages {
            check_stochastic(birth_stages.view(), grid.stages, period, "birth_stages", None)?;
        }
        if let Some(causes) = &self.causes {
            let expected = (causes.names.len(), grid.ages);
            if causes.hazards.dim() != expected || causes.names.is_empty() {
                return Err(RateError::DimensionMismatch {
                    period,
                    field: "cause_hazards",
                    expected,
                    found: causes.hazards.dim(),
                });
            }
            for ((cause, age), &value) in causes.hazards.indexed_iter() {
                if !value.is_finite() || value < 0.0 {
                    return Err(RateError::InvalidValue {
                        period,
                        field: "cause_hazards",
                        age,
                        stage: cause,
                        value,
                    });
                }
            }
        }
        if let Some(population) = &self.population {
            if population.dim() != self.survival.dim() {
                return Err(RateError::DimensionMismatch {
                    period,
                    field: "population",
                    expected: self.survival.dim(),
                    found: population.dim(),
                });
            }
            check_values(population.view(), period, "population", false)?;
        }
        Ok(())
    }

    /// Pads with zero survival and fertility, or truncates, to `ages` rows.
    fn resized(&self, ages: usize) -> Self {
        let current = self.survival.nrows();
        if ages == current {
            return self.clone();
        }
        let stages = self.survival.ncols();
        let resize = |matrix: &Array2<f64>| {
            Array2::from_shape_fn((ages, stages), |(age, stage)| {
                if age < current {
                    matrix[[age, stage]]
                } else {
                    0.0
                }
            })
        };
        let stage_transitions = self.stage_transitions.as_ref().map(|blocks| {
            (0..ages)
                .map(|age| {
                    blocks
                        .get(age)
                        .cloned()
                        .unwrap_or_else(|| Array2::eye(stages))
                })
                .collect()
        });
        let causes = self.causes.as_ref().map(|causes| CauseHazards {
            names: causes.names.clone(),
            // Padded ages take the cause mix of the oldest supplied age.
            hazards: Array2::from_shape_fn((causes.names.len(), ages), |(cause, age)| {
                causes.hazards[[cause, age.min(current - 1)]]
            }),
        });
        Self {
            survival: resize(&self.survival),
            fertility: resize(&self.fertility),
            stage_transitions,
            birth_stages: self.birth_stages.clone(),
            causes,
            population: self.population.as_ref().map(resize),
        }
    }
}

fn check_values(
    values: ArrayView2<'_, f64>,
    period: PeriodLabel,
    field: &'static str,
    probability: bool,
) -> Result<(), RateError> {
    for ((age, stage), &value) in values.indexed_iter() {
        let out_of_range = value < 0.0 || (probability && value > 1.0);
        if !value.is_finite() || out_of_range {
            return Err(RateError::InvalidValue {
                period,
                field,
                age,
                stage,
                value,
            });
        }
    }
    Ok(())
}

fn check_stochastic(
    matrix: ArrayView2<'_, f64>,
    stages: usize,
    period: PeriodLabel,
    field: &'static str,
    age: Option<usize>,
) -> Result<(), RateError> {
    if matrix.dim() != (stages, stages) {
        return Err(RateError::DimensionMismatch {
            period,
            field,
            expected: (stages, stages),
            found: matrix.dim(),
        });
    }
    for (column, values) in matrix.columns().into_iter().enumerate() {
        if let Some((row, &value)) = values
            .indexed_iter()
            .find(|&(_, &v)| !v.is_finite() || v < 0.0)
        {
            return Err(RateError::InvalidValue {
                period,
                field,
                age: age.unwrap_or(row),
                stage: column,
                value,
            });
        }
        let total = values.sum();
        if (total - 1.0).abs() > STOCHASTIC_TOLERANCE {
            return Err(RateError::NotStochastic {
                period,
                field,
                age,
                column,
                total,
            });
        }
    }
    Ok(())
}

/// Identifies the period an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodLabel {
    Constant,
    Year(i32),
}

impl std::fmt::Display for PeriodLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Constant => f.write_str("time-invariant rates"),
            Self::Year(year) => write!(f, "period {year}"),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RateError {
    #[error("{period}: the age grid is empty")]
    EmptyGrid { period: PeriodLabel },
    #[error("{period}: {field} has shape {found:?}, expected {expected:?}")]
    DimensionMismatch {
        period: PeriodLabel,
        field: &'static str,
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("{period}: {field} contains invalid value {value} at index ({age}, {stage})")]
    InvalidValue {
        period: PeriodLabel,
        field: &'static str,
        age: usize,
        stage: usize,
        value: f64,
    },
    #[error("{period}: expected {expected} stage-transition matrices (one per age), found {found}")]
    TransitionCount {
        period: PeriodLabel,
        expected: usize,
        found: usize,
    },
    #[error("{period}: column {column} of {field} (age {age:?}) sums to {total}, expected 1")]
    NotStochastic {
        period: PeriodLabel,
        field: &'static str,
        age: Option<usize>,
        column: usize,
        total: f64,
    },
    #[error("{period}: grid {found:?} differs from the run grid {expected:?}")]
    GridMismatch {
        period: PeriodLabel,
        expected: Grid,
        found: Grid,
    },
    #[error("{period}: causes of death {found:?} differ from {expected:?}")]
    CauseMismatch {
        period: PeriodLabel,
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error(
        "{period}: kin at age {age} can die but every cause-of-death hazard is zero there"
    )]
    UncoveredDeaths { period: PeriodLabel, age: usize },
    #[error("a period list must contain at least one period")]
    NoPeriods,
    #[error(
        "rates cover years {first}..={last} but the projection needs year {required}; \
         extend the period list or choose a horizon policy that tolerates it"
    )]
    InsufficientPeriods { first: i32, last: i32, required: i32 },
}

/// Raw rate input: either one bundle reused for every year, or one bundle per
/// consecutive calendar year starting at `first_year`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RateInput {
    Constant(VitalRates),
    Periods {
        first_year: i32,
        periods: Vec<VitalRates>,
    },
}

impl RateInput {
    pub fn grid(&self) -> Option<Grid> {
        match self {
            Self::Constant(rates) => Some(rates.grid()),
            Self::Periods { periods, .. } => periods.first().map(VitalRates::grid),
        }
    }

    /// The calendar years covered by explicit periods.
    pub fn year_span(&self) -> Option<(i32, i32)> {
        match self {
            Self::Constant(_) => None,
            Self::Periods {
                first_year,
                periods,
            } => {
                let last = *first_year + periods.len() as i32 - 1;
                Some((*first_year, last))
            }
        }
    }
}

/// What to do when the projection needs calendar years past the supplied
/// periods.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HorizonPolicy {
    /// Reuse the last supplied period for every later year.
    #[default]
    HoldLast,
    /// Stop reporting once the supplied years run out.
    Truncate,
    /// Reject the run.
    Fail,
}

/// Normalized, validated rates: one bundle per projected year.
#[derive(Debug, Clone)]
pub struct RateSchedule {
    grid: Grid,
    first_year: Option<i32>,
    supplied: usize,
    periods: Vec<Arc<VitalRates>>,
}

impl RateSchedule {
    /// Validates `input` and lays it out over `years` consecutive years
    /// (ignored for constant input beyond sizing the replication).
    ///
    /// `closure_ages` pads or truncates every period to that many ages.
    pub fn prepare(
        input: &RateInput,
        years: usize,
        closure_ages: Option<usize>,
        horizon: HorizonPolicy,
    ) -> Result<Self, RateError> {
        let (first_year, raw): (Option<i32>, Vec<(PeriodLabel, &VitalRates)>) = match input {
            RateInput::Constant(rates) => (None, vec![(PeriodLabel::Constant, rates)]),
            RateInput::Periods {
                first_year,
                periods,
            } => {
                if periods.is_empty() {
                    return Err(RateError::NoPeriods);
                }
                let labelled = periods
                    .iter()
                    .enumerate()
                    .map(|(offset, rates)| (PeriodLabel::Year(*first_year + offset as i32), rates))
                    .collect();
                (Some(*first_year), labelled)
            }
        };

        let reference = raw[0].1.grid();
        let reference_causes = raw[0].1.cause_names();
        for &(label, rates) in &raw {
            rates.validate(label)?;
            let grid = rates.grid();
            if grid != reference {
                return Err(RateError::GridMismatch {
                    period: label,
                    expected: reference,
                    found: grid,
                });
            }
            if rates.cause_names() != reference_causes {
                return Err(RateError::CauseMismatch {
                    period: label,
                    expected: reference_causes.to_vec(),
                    found: rates.cause_names().to_vec(),
                });
            }
        }

        let target_ages = closure_ages.unwrap_or(reference.ages);
        if target_ages == 0 {
            return Err(RateError::EmptyGrid {
                period: raw[0].0,
            });
        }
        if target_ages != reference.ages {
            log::warn!(
                "Resizing rates from {} to {} ages (padding uses zero survival and fertility)",
                reference.ages,
                target_ages
            );
        }
        let grid = Grid::new(target_ages, reference.stages);
        let normalized: Vec<Arc<VitalRates>> = raw
            .iter()
            .map(|(_, rates)| Arc::new(rates.resized(target_ages)))
            .collect();
        let supplied = normalized.len();
        let years = years.max(1);

        let periods = match first_year {
            None => vec![Arc::clone(&normalized[0]); years],
            Some(first) => {
                if years > supplied {
                    let last = first + supplied as i32 - 1;
                    let required = first + years as i32 - 1;
                    match horizon {
                        HorizonPolicy::HoldLast => {
                            log::info!(
                                "Holding {last} rates constant through {required} (last supplied period)"
                            );
                        }
                        HorizonPolicy::Truncate | HorizonPolicy::Fail => {
                            return Err(RateError::InsufficientPeriods {
                                first,
                                last,
                                required,
                            });
                        }
                    }
                }
                (0..years)
                    .map(|offset| Arc::clone(&normalized[offset.min(supplied - 1)]))
                    .collect()
            }
        };

        Ok(Self {
            grid,
            first_year,
            supplied,
            periods,
        })
    }

    pub fn grid(&self) -> Grid {
        self.grid
    }

    pub fn first_year(&self) -> Option<i32> {
        self.first_year
    }

    /// Number of periods supplied by the caller (before replication).
    pub fn supplied(&self) -> usize {
        self.supplied
    }

    pub fn len(&self) -> usize {
        self.periods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.periods.is_empty()
    }

    pub fn cause_names(&self) -> Vec<String> {
        self.periods[0].cause_names().to_vec()
    }

    /// Rates for the `offset`-th projected year.
    pub fn period(&self, offset: usize) -> &VitalRates {
        &self.periods[offset.min(self.periods.len() - 1)]
    }

    pub fn label(&self, offset: usize) -> PeriodLabel {
        match self.first_year {
            Some(first) => PeriodLabel::Year(first + offset as i32),
            None => PeriodLabel::Constant,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn flat_rates(ages: usize) -> VitalRates {
        VitalRates::age_only(Array1::from_elem(ages, 0.9), Array1::from_elem(ages, 0.1))
    }

    #[test]
    fn grid_indexes_stages_within_age() {
        let grid = Grid::new(4, 3);
        assert_eq!(grid.states(), 12);
        assert_eq!(grid.index(2, 1), 7);
        assert_eq!(grid.age_of(7), 2);
        assert_eq!(grid.stage_of(7), 1);
        let marginal = grid.age_marginal(&Array1::ones(12));
        assert_eq!(marginal, array![3.0, 3.0, 3.0, 3.0]);
    }

    #[test]
    fn mismatched_fertility_length_is_rejected() {
        let rates = VitalRates::age_only(Array1::from_elem(5, 0.9), Array1::zeros(4));
        let err = RateSchedule::prepare(&RateInput::Constant(rates), 1, None, HorizonPolicy::Fail)
            .unwrap_err();
        assert!(matches!(
            err,
            RateError::DimensionMismatch {
                field: "fertility",
                ..
            }
        ));
    }

    #[test]
    fn survival_above_one_is_rejected_with_location() {
        let mut rates = flat_rates(5);
        rates.survival[[3, 0]] = 1.2;
        let err = RateSchedule::prepare(&RateInput::Constant(rates), 1, None, HorizonPolicy::Fail)
            .unwrap_err();
        assert_eq!(
            err,
            RateError::InvalidValue {
                period: PeriodLabel::Constant,
                field: "survival",
                age: 3,
                stage: 0,
                value: 1.2,
            }
        );
    }

    #[test]
    fn nan_fertility_is_rejected() {
        let mut rates = flat_rates(5);
        rates.fertility[[2, 0]] = f64::NAN;
        let input = RateInput::Periods {
            first_year: 2000,
            periods: vec![flat_rates(5), rates],
        };
        let err = RateSchedule::prepare(&input, 2, None, HorizonPolicy::Fail).unwrap_err();
        assert!(matches!(
            err,
            RateError::InvalidValue {
                period: PeriodLabel::Year(2001),
                field: "fertility",
                ..
            }
        ));
    }

    #[test]
    fn non_stochastic_transitions_are_rejected() {
        let survival = Array2::from_elem((3, 2), 0.9);
        let fertility = Array2::zeros((3, 2));
        let mut rates = VitalRates {
            survival,
            fertility,
            stage_transitions: Some(vec![Array2::eye(2); 3]),
            birth_stages: None,
            causes: None,
            population: None,
        };
        rates.stage_transitions.as_mut().unwrap()[1][[0, 1]] = 0.5;
        let err = RateSchedule::prepare(&RateInput::Constant(rates), 1, None, HorizonPolicy::Fail)
            .unwrap_err();
        assert!(matches!(
            err,
            RateError::NotStochastic {
                age: Some(1),
                column: 1,
                ..
            }
        ));
    }

    #[test]
    fn periods_must_share_a_grid() {
        let input = RateInput::Periods {
            first_year: 1990,
            periods: vec![flat_rates(5), flat_rates(6)],
        };
        let err = RateSchedule::prepare(&input, 2, None, HorizonPolicy::Fail).unwrap_err();
        assert!(matches!(err, RateError::GridMismatch { .. }));
    }

    #[test]
    fn periods_must_name_the_same_causes() {
        let with_causes = |names: [&str; 2]| {
            flat_rates(3).with_causes(CauseHazards {
                names: names.iter().map(|name| name.to_string()).collect(),
                hazards: Array2::ones((2, 3)),
            })
        };
        let input = RateInput::Periods {
            first_year: 2000,
            periods: vec![
                with_causes(["cancer", "heart"]),
                with_causes(["accident", "cancer"]),
            ],
        };
        let err = RateSchedule::prepare(&input, 2, None, HorizonPolicy::Fail).unwrap_err();
        assert_eq!(
            err,
            RateError::CauseMismatch {
                period: PeriodLabel::Year(2001),
                expected: vec!["cancer".into(), "heart".into()],
                found: vec!["accident".into(), "cancer".into()],
            }
        );
    }

    #[test]
    fn short_period_list_fails_or_holds_last() {
        let input = RateInput::Periods {
            first_year: 2000,
            periods: vec![flat_rates(4), flat_rates(4)],
        };
        let err = RateSchedule::prepare(&input, 5, None, HorizonPolicy::Fail).unwrap_err();
        assert_eq!(
            err,
            RateError::InsufficientPeriods {
                first: 2000,
                last: 2001,
                required: 2004,
            }
        );

        let held = RateSchedule::prepare(&input, 5, None, HorizonPolicy::HoldLast).unwrap();
        assert_eq!(held.len(), 5);
        assert_eq!(held.supplied(), 2);
        assert_eq!(held.period(4), held.period(1));
        assert_eq!(held.label(4), PeriodLabel::Year(2004));
    }

    #[test]
    fn constant_rates_are_replicated() {
        let schedule =
            RateSchedule::prepare(&RateInput::Constant(flat_rates(4)), 3, None, HorizonPolicy::Fail)
                .unwrap();
        assert_eq!(schedule.len(), 3);
        assert_eq!(schedule.first_year(), None);
        assert_eq!(schedule.label(2), PeriodLabel::Constant);
    }

    #[test]
    fn closure_age_pads_with_zeros_and_truncates() {
        let padded = RateSchedule::prepare(
            &RateInput::Constant(flat_rates(4)),
            1,
            Some(6),
            HorizonPolicy::Fail,
        )
        .unwrap();
        assert_eq!(padded.grid(), Grid::new(6, 1));
        assert_eq!(padded.period(0).survival[[5, 0]], 0.0);
        assert_eq!(padded.period(0).fertility[[4, 0]], 0.0);

        let truncated = RateSchedule::prepare(
            &RateInput::Constant(flat_rates(8)),
            1,
            Some(3),
            HorizonPolicy::Fail,
        )
        .unwrap();
        assert_eq!(truncated.period(0).survival.nrows(), 3);
    }
}
