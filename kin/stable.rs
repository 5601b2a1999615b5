//! Distribution of parents' ages (and stages) at the birth of a child.
//!
//! By default this is taken from the stable population implied by a period's
//! rates: the dominant eigenvector `w` of the female-dominant projection matrix
//! `A = U + F`, weighted by fertility, `π ∝ w ∘ f`. The eigenvector comes from
//! power iteration on `A + I`; the shift keeps the iteration convergent for
//! imprimitive (e.g. single-age-of-childbearing) schedules.

use ndarray::{Array1, ArrayView1, s};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::coupler::{CoupledOperators, Fertility, Sex};
use crate::rates::{Grid, VitalRates};

/// Where the parental age distribution comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentalAges {
    /// The stable population implied by each period's rates.
    #[default]
    Stable,
    /// Observed population counts supplied with each period.
    Observed,
}

/// Settings for the power iteration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StableSettings {
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for StableSettings {
    fn default() -> Self {
        Self {
            tolerance: 1e-12,
            max_iterations: 200_000,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum StableError {
    #[error("{sex:?} fertility is zero everywhere, so the age of parents at birth is undefined")]
    ZeroFertility { sex: Sex },
    #[error("stable population did not converge after {iterations} iterations (last change {change:e})")]
    NotConverged { iterations: usize, change: f64 },
    #[error("observed parental ages requested but no population counts were supplied for {sex:?} rates")]
    MissingPopulation { sex: Sex },
}

/// Parents' state distribution at the birth of a child.
#[derive(Debug, Clone, PartialEq)]
pub struct ParentalDistribution {
    grid: Grid,
    mother: Array1<f64>,
    father: Option<Array1<f64>>,
}

impl ParentalDistribution {
    pub fn mother(&self) -> &Array1<f64> {
        &self.mother
    }

    pub fn father(&self) -> Option<&Array1<f64>> {
        self.father.as_ref()
    }

    /// Mother's age distribution with stages summed out.
    pub fn mother_by_age(&self) -> Array1<f64> {
        self.grid.age_marginal(&self.mother)
    }

    pub fn father_by_age(&self) -> Option<Array1<f64>> {
        self.father.as_ref().map(|f| self.grid.age_marginal(f))
    }

    /// Mean age of mothers at childbirth.
    pub fn mean_age_of_mothers(&self) -> f64 {
        self.mother_by_age()
            .iter()
            .enumerate()
            .map(|(age, &p)| age as f64 * p)
            .sum()
    }
}

/// Computes the stable parental distribution for the coupled operators.
pub fn stable_parents(
    ops: &CoupledOperators,
    settings: &StableSettings,
) -> Result<ParentalDistribution, StableError> {
    let grid = ops.grid();
    let n = grid.states();
    for block in 0..ops.sexes() {
        let sex = Sex::from_block(block);
        if ops.sex(sex).fertility_rates().iter().all(|&f| f == 0.0) {
            return Err(StableError::ZeroFertility { sex });
        }
    }

    let mut w = Array1::from_elem(ops.len(), 1.0 / ops.len() as f64);
    let mut previous = weighted_parents(ops, w.view());
    let min_iterations = grid.ages + 1;
    let mut change = f64::INFINITY;

    for iteration in 1..=settings.max_iterations {
        let mut next = ops.survive(w.view());
        next += &ops.reproduce(w.view(), Fertility::MothersOnly);
        next += &w;
        let total = next.sum();
        if total <= 0.0 || !total.is_finite() {
            break;
        }
        next /= total;
        w = next;

        let current = weighted_parents(ops, w.view());
        change = current
            .iter()
            .zip(previous.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);
        previous = current;

        if iteration >= min_iterations && change < settings.tolerance {
            let growth = growth_rate(ops, w.view());
            log::debug!(
                "Stable population converged after {iteration} iterations (lambda = {growth:.6})"
            );
            let mother = previous.slice(s![0..n]).to_owned();
            let father = (ops.sexes() > 1).then(|| previous.slice(s![n..2 * n]).to_owned());
            return Ok(ParentalDistribution {
                grid,
                mother,
                father,
            });
        }
    }

    Err(StableError::NotConverged {
        iterations: settings.max_iterations,
        change,
    })
}

/// Parental distribution from observed population counts: `π ∝ n ∘ f`.
pub fn observed_parents(
    ops: &CoupledOperators,
    female: &VitalRates,
    male: Option<&VitalRates>,
) -> Result<ParentalDistribution, StableError> {
    let grid = ops.grid();
    let flatten = |rates: &VitalRates, sex: Sex| -> Result<Array1<f64>, StableError> {
        let population = rates
            .population
            .as_ref()
            .ok_or(StableError::MissingPopulation { sex })?;
        let counts = Array1::from_shape_fn(grid.states(), |state| {
            population[[grid.age_of(state), grid.stage_of(state)]]
        });
        let weighted = &counts * ops.sex(sex).fertility_rates();
        normalize(weighted, sex)
    };

    let mother = flatten(female, Sex::Female)?;
    let father = match (ops.sexes() > 1, male) {
        (true, Some(rates)) => Some(flatten(rates, Sex::Male)?),
        (true, None) => Some(flatten(female, Sex::Male)?),
        (false, _) => None,
    };
    Ok(ParentalDistribution {
        grid,
        mother,
        father,
    })
}

fn normalize(values: Array1<f64>, sex: Sex) -> Result<Array1<f64>, StableError> {
    let total = values.sum();
    if total > 0.0 {
        Ok(values / total)
    } else {
        Err(StableError::ZeroFertility { sex })
    }
}

/// `w ∘ f` normalized within each sex block.
fn weighted_parents(ops: &CoupledOperators, w: ArrayView1<'_, f64>) -> Array1<f64> {
    let mut out = Array1::zeros(ops.len());
    for block in 0..ops.sexes() {
        let range = ops.block_range(block);
        let sex = Sex::from_block(block);
        let weighted = &w.slice(s![range.clone()]) * ops.sex(sex).fertility_rates();
        let total = weighted.sum();
        if total > 0.0 {
            out.slice_mut(s![range]).assign(&(weighted / total));
        }
    }
    out
}

fn growth_rate(ops: &CoupledOperators, w: ArrayView1<'_, f64>) -> f64 {
    let n = ops.grid().states();
    let female = w.slice(s![0..n]);
    let total = female.sum();
    if total <= 0.0 {
        return 0.0;
    }
    let projected = ops.survive(w).slice(s![0..n]).sum()
        + ops.reproduce(w, Fertility::MothersOnly).slice(s![0..n]).sum();
    projected / total
}
