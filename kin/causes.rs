//! Competing-risk partition of kin deaths.
//!
//! Each age's deaths are split across causes in proportion to the cause
//! hazards at that age, so the cause-specific increments always add back up to
//! the total death increment.

use ndarray::{Array1, Array2, ArrayView1};

use crate::operators::PeriodOperators;
use crate::rates::{Grid, PeriodLabel, RateError};

/// Converts `[causes, ages]` hazards into per-age shares.
///
/// Columns with no hazard at all stay zero; [`check_coverage`] rejects rates
/// where such an age can still produce deaths.
pub(crate) fn shares_from_hazards(hazards: &Array2<f64>) -> Array2<f64> {
    let mut shares = hazards.clone();
    for mut column in shares.columns_mut() {
        let total = column.sum();
        if total > 0.0 {
            column /= total;
        }
    }
    shares
}

/// Fails if some state can die at an age where no cause has positive hazard.
pub fn check_coverage(ops: &PeriodOperators, period: PeriodLabel) -> Result<(), RateError> {
    let Some(shares) = ops.cause_shares() else {
        return Ok(());
    };
    let grid = ops.grid();
    for (state, &survival) in ops.survival_probabilities().iter().enumerate() {
        let age = grid.age_of(state);
        if survival < 1.0 && shares.column(age).sum() == 0.0 {
            return Err(RateError::UncoveredDeaths { period, age });
        }
    }
    Ok(())
}

/// Splits per-state deaths of one sex into per-cause totals.
pub(crate) fn partition_deaths(
    grid: Grid,
    deaths: ArrayView1<'_, f64>,
    shares: &Array2<f64>,
) -> Array1<f64> {
    let mut totals = Array1::zeros(shares.nrows());
    for (state, &dead) in deaths.iter().enumerate() {
        if dead == 0.0 {
            continue;
        }
        totals.scaled_add(dead, &shares.column(grid.age_of(state)));
    }
    totals
}
