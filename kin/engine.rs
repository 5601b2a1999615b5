//! # Kinship engine
//!
//! Entry point of the library. A run goes through four phases:
//!
//! 1. configuration and rate validation (nothing is computed on bad input),
//! 2. per-year operators and parental age distributions,
//! 3. the lineage recursion, stationary for the first year and then advanced
//!    one calendar year at a time,
//! 4. reduction of the requested panel columns into result tables.
//!
//! At most two consecutive years of operators and panels are held at a time.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::causes::check_coverage;
use crate::config::{ConfigError, KinshipConfig, TimeMode};
use crate::coupler::{CoupledOperators, Sex, SexMode};
use crate::kin_type::KinType;
use crate::lineage::{KinSnapshot, Lineage, PeriodContext};
use crate::operators::PeriodOperators;
use crate::progress::{NoopProgress, ProjectionObserver, ProjectionStage};
use crate::rates::{Grid, HorizonPolicy, PeriodLabel, RateError, RateInput, RateSchedule};
use crate::rules::{Node, RuleBook};
use crate::stable::{ParentalAges, StableError, observed_parents, stable_parents};
use crate::summary::{FullRow, Reducer, RowKey, SexLayout, SummaryRow};

/// Vital rates for a run. Male rates are only read by two-sex runs.
#[derive(Debug, Clone, PartialEq)]
pub struct KinshipRates {
    pub female: RateInput,
    pub male: Option<RateInput>,
}

impl KinshipRates {
    pub fn female_only(female: RateInput) -> Self {
        Self { female, male: None }
    }

    pub fn two_sex(female: RateInput, male: RateInput) -> Self {
        Self {
            female,
            male: Some(male),
        }
    }
}

#[derive(Debug, Error)]
pub enum KinshipError {
    #[error(transparent)]
    Rates(#[from] RateError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{period}: {source}")]
    Stable {
        period: PeriodLabel,
        #[source]
        source: StableError,
    },
}

/// Result tables of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct KinshipOutput {
    pub grid: Grid,
    pub cause_names: Vec<String>,
    /// Per kin state rows; `None` when only the summary was requested.
    pub full: Option<Vec<FullRow>>,
    pub summary: Vec<SummaryRow>,
}

impl KinshipOutput {
    /// Summary rows of one kin type.
    pub fn summary_of(&self, kin: KinType) -> impl Iterator<Item = &SummaryRow> + '_ {
        self.summary.iter().filter(move |row| row.kin == kin)
    }
}

pub fn compute_kinship(
    rates: &KinshipRates,
    config: &KinshipConfig,
) -> Result<KinshipOutput, KinshipError> {
    compute_kinship_with_progress(rates, config, &mut NoopProgress)
}

pub fn compute_kinship_with_progress(
    rates: &KinshipRates,
    config: &KinshipConfig,
    observer: &mut impl ProjectionObserver,
) -> Result<KinshipOutput, KinshipError> {
    config.validate()?;
    let model = Model::prepare(rates, config)?;
    let requested = config.output_kin.resolve();
    let grid = model.female.grid();
    log::info!(
        "Computing {} kin types for a {} Focal over {} ages and {} stage(s) ({} year(s) of rates)",
        requested.len(),
        config.focal_sex,
        grid.ages,
        grid.stages,
        model.female.len()
    );

    model.check_causes(observer)?;

    let maternal_is_focal = !(config.sex_mode.is_two_sex() && config.focal_sex == Sex::Male);
    let lineage = Lineage::new(RuleBook::new(maternal_is_focal), &requested);
    let layout = match config.sex_mode {
        SexMode::OneSex => SexLayout::OneSex,
        SexMode::TwoSex { .. } | SexMode::Androgynous { .. } => SexLayout::TwoSex,
        SexMode::Factors => SexLayout::Factors,
    };
    let mut tables = Tables {
        reducer: Reducer::new(grid, layout, model.causes),
        requested,
        full: (!config.summary_only).then(Vec::new),
        summary: Vec::new(),
    };

    let years = model.female.len();
    observer.on_stage_start(ProjectionStage::Projection, years);
    let mut ctx = model.context(0)?;
    let mut snapshot = lineage.solve_stationary(&ctx);
    match &model.plan {
        None => {
            tables.emit(&snapshot, None, 0..grid.ages);
            observer.on_stage_advance(ProjectionStage::Projection, 1);
        }
        Some(plan) => {
            tables.emit(&snapshot, Some(plan.first), plan.focal_ages(0, grid.ages));
            observer.on_stage_advance(ProjectionStage::Projection, 1);
            for offset in 1..years {
                let next = model.context(offset)?;
                snapshot = lineage.advance(&snapshot, &ctx, &next);
                ctx = next;
                let year = plan.first + offset as i32;
                log::trace!("Projected kin panels to {year}");
                tables.emit(&snapshot, Some(year), plan.focal_ages(offset, grid.ages));
                observer.on_stage_advance(ProjectionStage::Projection, offset + 1);
            }
        }
    }
    observer.on_stage_finish(ProjectionStage::Projection);

    log::info!(
        "Kinship run finished: {} summary rows{}",
        tables.summary.len(),
        tables
            .full
            .as_ref()
            .map(|rows| format!(", {} full rows", rows.len()))
            .unwrap_or_default()
    );
    Ok(KinshipOutput {
        grid,
        cause_names: model.female.cause_names(),
        full: tables.full,
        summary: tables.summary,
    })
}

/// Which calendar years a time-varying run visits and reports.
#[derive(Debug)]
struct YearPlan {
    first: i32,
    years: BTreeSet<i32>,
    cohorts: BTreeSet<i32>,
}

impl YearPlan {
    /// Focal ages to report in the `offset`-th projected year.
    fn focal_ages(&self, offset: usize, ages: usize) -> Vec<usize> {
        let year = self.first + offset as i32;
        if self.years.contains(&year) {
            return (0..ages).collect();
        }
        self.cohorts
            .iter()
            .filter_map(|&cohort| usize::try_from(year - cohort).ok())
            .filter(|&age| age < ages)
            .collect()
    }
}

struct Model<'a> {
    config: &'a KinshipConfig,
    female: RateSchedule,
    male: Option<RateSchedule>,
    causes: usize,
    plan: Option<YearPlan>,
}

impl<'a> Model<'a> {
    fn prepare(rates: &KinshipRates, config: &'a KinshipConfig) -> Result<Self, KinshipError> {
        let male_input = match config.sex_mode {
            SexMode::TwoSex { .. } => Some(rates.male.as_ref().ok_or(ConfigError::MissingMaleRates)?),
            SexMode::Androgynous { .. } => {
                log::warn!("Androgynous run: male kin follow the female rates");
                None
            }
            SexMode::Factors => {
                log::warn!("Factor run: both-sex counts are approximated by GKP multipliers");
                None
            }
            SexMode::OneSex => None,
        };
        if male_input.is_none() && rates.male.is_some() {
            log::warn!("Male rates supplied but not used by a {:?} run", config.sex_mode);
        }

        let raw_grid = rates.female.grid().ok_or(RateError::NoPeriods)?;
        let ages = config.closure_age.map_or(raw_grid.ages, |omega| omega + 1);
        let (plan, years, horizon) = match &config.time_mode {
            TimeMode::Invariant => {
                let constant = |input: &RateInput| matches!(input, RateInput::Constant(_));
                if !constant(&rates.female) || !male_input.is_none_or(constant) {
                    return Err(ConfigError::RatesNotConstant.into());
                }
                (None, 1, HorizonPolicy::Fail)
            }
            TimeMode::Varying { horizon, .. } => {
                let (first, last) = rates
                    .female
                    .year_span()
                    .ok_or(ConfigError::RatesNotPeriodic)?;
                if let Some(male) = male_input {
                    let span = male.year_span().ok_or(ConfigError::RatesNotPeriodic)?;
                    if span != (first, last) {
                        return Err(ConfigError::PeriodSpanMismatch {
                            female: (first, last),
                            male: span,
                        }
                        .into());
                    }
                }
                let (years, cohorts) = config.checked_selection(first, last)?;
                let omega = ages.saturating_sub(1) as i32;
                let needed_last = years
                    .iter()
                    .copied()
                    .chain(cohorts.iter().map(|&cohort| cohort + omega))
                    .max()
                    .unwrap_or(last);
                let needed = (needed_last - first + 1) as usize;
                let supplied = (last - first + 1) as usize;
                let span = if *horizon == HorizonPolicy::Truncate && needed > supplied {
                    log::info!(
                        "Truncating output at {last}; cohort lifetimes reach {needed_last}"
                    );
                    supplied
                } else {
                    needed
                };
                let plan = YearPlan {
                    first,
                    years,
                    cohorts,
                };
                (Some(plan), span, *horizon)
            }
        };

        let closure_ages = config.closure_age.map(|omega| omega + 1);
        let female = RateSchedule::prepare(&rates.female, years, closure_ages, horizon)?;
        let male = male_input
            .map(|input| RateSchedule::prepare(input, years, closure_ages, horizon))
            .transpose()?;

        let grid = female.grid();
        if let Some(male) = &male {
            if male.grid() != grid {
                return Err(RateError::GridMismatch {
                    period: male.label(0),
                    expected: grid,
                    found: male.grid(),
                }
                .into());
            }
            let (expected, found) = (female.period(0).cause_names(), male.period(0).cause_names());
            if expected != found {
                return Err(RateError::CauseMismatch {
                    period: male.label(0),
                    expected: expected.to_vec(),
                    found: found.to_vec(),
                }
                .into());
            }
        }
        let expected = config.stage_mode.stages();
        if grid.stages != expected {
            return Err(ConfigError::StageMismatch {
                expected,
                found: grid.stages,
            }
            .into());
        }

        Ok(Self {
            config,
            causes: female.period(0).cause_count(),
            female,
            male,
            plan,
        })
    }

    fn operators(&self, offset: usize) -> CoupledOperators {
        let terminal = self.config.terminal_age;
        let female = PeriodOperators::build(self.female.period(offset), terminal);
        match (self.config.sex_mode, &self.male) {
            (SexMode::TwoSex { birth_female }, Some(male)) => {
                let male = PeriodOperators::build(male.period(offset), terminal);
                CoupledOperators::two_sex(female, male, birth_female)
            }
            (SexMode::Androgynous { birth_female }, _) => {
                CoupledOperators::two_sex(female.clone(), female, birth_female)
            }
            _ => CoupledOperators::one_sex(female),
        }
    }

    /// Rejects supplied periods whose causes cannot explain their deaths.
    fn check_causes(&self, observer: &mut impl ProjectionObserver) -> Result<(), KinshipError> {
        if self.causes == 0 {
            return Ok(());
        }
        let periods = self.female.supplied().min(self.female.len());
        observer.on_stage_start(ProjectionStage::Rates, periods);
        for offset in 0..periods {
            let ops = self.operators(offset);
            for block in 0..ops.sexes() {
                check_coverage(ops.sex(Sex::from_block(block)), self.female.label(offset))?;
            }
            observer.on_stage_advance(ProjectionStage::Rates, offset + 1);
        }
        observer.on_stage_finish(ProjectionStage::Rates);
        Ok(())
    }

    fn context(&self, offset: usize) -> Result<PeriodContext, KinshipError> {
        let period = self.female.label(offset);
        let ops = self.operators(offset);
        let parents = match self.config.parental_ages {
            ParentalAges::Stable => stable_parents(&ops, &self.config.stable),
            ParentalAges::Observed => observed_parents(
                &ops,
                self.female.period(offset),
                self.male.as_ref().map(|male| male.period(offset)),
            ),
        }
        .map_err(|source| KinshipError::Stable { period, source })?;
        log::debug!(
            "{period}: mean age of mothers at birth {:.2}",
            parents.mean_age_of_mothers()
        );
        Ok(PeriodContext {
            ops,
            parents,
            focal_sex: self.config.focal_sex,
            causes: self.causes,
        })
    }
}

struct Tables {
    reducer: Reducer,
    requested: Vec<KinType>,
    full: Option<Vec<FullRow>>,
    summary: Vec<SummaryRow>,
}

impl Tables {
    fn emit(
        &mut self,
        snapshot: &KinSnapshot,
        year: Option<i32>,
        focal_ages: impl IntoIterator<Item = usize> + Clone,
    ) {
        for &kin in &self.requested {
            let Some(panel) = snapshot.panel(Node::Kin(kin)) else {
                continue;
            };
            for focal_age in focal_ages.clone() {
                let key = RowKey {
                    kin,
                    focal_age,
                    year,
                };
                self.reducer.summary_rows(panel, key, &mut self.summary);
                if let Some(full) = self.full.as_mut() {
                    self.reducer.full_rows(panel, key, full);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rates::{CauseHazards, VitalRates};
    use ndarray::Array1;

    fn flat(ages: usize) -> VitalRates {
        let mut fertility = Array1::zeros(ages);
        fertility[2] = 0.8;
        fertility[3] = 0.4;
        VitalRates::age_only(Array1::from_elem(ages, 0.9), fertility)
    }

    fn periods(first_year: i32, count: usize, ages: usize) -> RateInput {
        RateInput::Periods {
            first_year,
            periods: vec![flat(ages); count],
        }
    }

    fn varying(years: Vec<i32>, cohorts: Vec<i32>, horizon: HorizonPolicy) -> KinshipConfig {
        KinshipConfig {
            time_mode: TimeMode::Varying {
                output_years: years,
                output_cohorts: cohorts,
                horizon,
            },
            ..KinshipConfig::default()
        }
    }

    #[test]
    fn two_sex_without_male_rates_is_a_config_error() {
        let config = KinshipConfig {
            sex_mode: SexMode::TwoSex { birth_female: 0.5 },
            ..KinshipConfig::default()
        };
        let rates = KinshipRates::female_only(RateInput::Constant(flat(6)));
        let err = compute_kinship(&rates, &config).unwrap_err();
        assert!(matches!(err, KinshipError::Config(ConfigError::MissingMaleRates)));
    }

    #[test]
    fn invariant_run_rejects_period_rates() {
        let rates = KinshipRates::female_only(periods(2000, 3, 6));
        let err = compute_kinship(&rates, &KinshipConfig::default()).unwrap_err();
        assert!(matches!(err, KinshipError::Config(ConfigError::RatesNotConstant)));
    }

    #[test]
    fn stage_mode_must_match_the_rates() {
        let config = KinshipConfig {
            stage_mode: crate::config::StageMode::Staged { stages: 2 },
            ..KinshipConfig::default()
        };
        let rates = KinshipRates::female_only(RateInput::Constant(flat(6)));
        let err = compute_kinship(&rates, &config).unwrap_err();
        assert!(matches!(
            err,
            KinshipError::Config(ConfigError::StageMismatch {
                expected: 2,
                found: 1
            })
        ));
    }

    #[test]
    fn cohort_output_follows_focal_through_calendar_time() {
        let rates = KinshipRates::female_only(periods(2000, 10, 6));
        let config = varying(vec![], vec![2001], HorizonPolicy::HoldLast);
        let output = compute_kinship(&rates, &config).unwrap();
        let mothers: Vec<_> = output.summary_of(KinType::M).collect();
        assert_eq!(mothers.len(), 6);
        for (age, row) in mothers.iter().enumerate() {
            assert_eq!(row.focal_age, age);
            assert_eq!(row.cohort, Some(2001));
            assert_eq!(row.year, Some(2001 + age as i32));
        }
    }

    #[test]
    fn truncate_stops_at_the_last_supplied_year() {
        let rates = KinshipRates::female_only(periods(2000, 4, 6));
        let config = varying(vec![], vec![2001], HorizonPolicy::Truncate);
        let output = compute_kinship(&rates, &config).unwrap();
        let last = output.summary_of(KinType::D).map(|row| row.focal_age).max();
        assert_eq!(last, Some(2));
    }

    #[test]
    fn fail_rejects_lifetimes_past_the_supplied_years() {
        let rates = KinshipRates::female_only(periods(2000, 4, 6));
        let config = varying(vec![], vec![2001], HorizonPolicy::Fail);
        let err = compute_kinship(&rates, &config).unwrap_err();
        assert!(matches!(
            err,
            KinshipError::Rates(RateError::InsufficientPeriods {
                first: 2000,
                last: 2003,
                required: 2006
            })
        ));
    }

    #[test]
    fn male_causes_must_carry_the_female_names() {
        let with_causes = |names: [&str; 2]| {
            let mut hazards = ndarray::Array2::zeros((2, 6));
            hazards.row_mut(0).fill(1.0);
            flat(6).with_causes(CauseHazards {
                names: names.iter().map(|name| name.to_string()).collect(),
                hazards,
            })
        };
        let rates = KinshipRates::two_sex(
            RateInput::Constant(with_causes(["cancer", "heart"])),
            RateInput::Constant(with_causes(["accident", "cancer"])),
        );
        let config = KinshipConfig {
            sex_mode: SexMode::TwoSex { birth_female: 0.5 },
            ..KinshipConfig::default()
        };
        let err = compute_kinship(&rates, &config).unwrap_err();
        match err {
            KinshipError::Rates(RateError::CauseMismatch {
                period: PeriodLabel::Constant,
                expected,
                found,
            }) => {
                assert_eq!(expected, ["cancer", "heart"]);
                assert_eq!(found, ["accident", "cancer"]);
            }
            other => panic!("expected CauseMismatch, got {other:?}"),
        }
    }

    #[test]
    fn output_year_rows_cover_every_focal_age_once() {
        let rates = KinshipRates::female_only(periods(2000, 5, 6));
        let config = varying(vec![2002], vec![2002], HorizonPolicy::HoldLast);
        let output = compute_kinship(&rates, &config).unwrap();
        let in_2002: Vec<_> = output
            .summary_of(KinType::Os)
            .filter(|row| row.year == Some(2002))
            .collect();
        assert_eq!(in_2002.len(), 6);
    }
}
