use ndarray::{Array1, Array2, ArrayView1, s};
use serde::{Deserialize, Serialize};

use crate::causes::shares_from_hazards;
use crate::rates::{Grid, VitalRates};

/// How the last age class behaves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalAge {
    /// The closure age is an open interval: survivors stay at ω (`U[ω, ω] = s_ω`).
    #[default]
    Open,
    /// Nobody survives past the closure age.
    Closed,
}

/// Dense materialization of one period's projection operators.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseOperators {
    /// `[states, states]` survival and aging operator.
    pub survival: Array2<f64>,
    /// `[states, states]` fertility operator placing births into age class 0.
    pub fertility: Array2<f64>,
    /// `[stages, stages]` birth-stage placement; `None` for age-only grids.
    pub birth_placement: Option<Array2<f64>>,
}

/// Banded projection operators for one sex and one period.
///
/// `U` is stored as one `[stages, stages]` block per age (`U_a = T_a diag(s_a)`,
/// moved from age `a` to `a + 1`), `F` as a per-state birth rate plus the
/// birth-stage placement `H`. Nothing else is materialized.
#[derive(Debug, Clone)]
pub struct PeriodOperators {
    grid: Grid,
    terminal: TerminalAge,
    survival: Array1<f64>,
    aging: Vec<Array2<f64>>,
    transitions: Vec<Array2<f64>>,
    fertility: Array1<f64>,
    birth_placement: Array2<f64>,
    cause_shares: Option<Array2<f64>>,
}

impl PeriodOperators {
    /// Builds the operators for one period. Rates are assumed validated by
    /// [`crate::rates::RateSchedule::prepare`].
    pub fn build(rates: &VitalRates, terminal: TerminalAge) -> Self {
        let grid = rates.grid();
        let stages = grid.stages;
        let omega = grid.omega();

        let survival = Array1::from_shape_fn(grid.states(), |state| {
            let age = grid.age_of(state);
            if age == omega && terminal == TerminalAge::Closed {
                0.0
            } else {
                rates.survival[[age, grid.stage_of(state)]]
            }
        });

        let transitions: Vec<Array2<f64>> = match &rates.stage_transitions {
            Some(blocks) => blocks.clone(),
            None => vec![Array2::eye(stages); grid.ages],
        };

        let aging = transitions
            .iter()
            .enumerate()
            .map(|(age, block)| {
                let base = grid.index(age, 0);
                let rates_at_age = survival.slice(s![base..base + stages]);
                let mut scaled = block.clone();
                for (mut column, &p) in scaled.columns_mut().into_iter().zip(rates_at_age.iter()) {
                    column *= p;
                }
                scaled
            })
            .collect();

        let fertility = Array1::from_shape_fn(grid.states(), |state| {
            rates.fertility[[grid.age_of(state), grid.stage_of(state)]]
        });

        let birth_placement = match &rates.birth_stages {
            Some(placement) => placement.clone(),
            None => {
                let mut placement = Array2::zeros((stages, stages));
                placement.row_mut(0).fill(1.0);
                placement
            }
        };

        let cause_shares = rates
            .causes
            .as_ref()
            .map(|causes| shares_from_hazards(&causes.hazards));

        Self {
            grid,
            terminal,
            survival,
            aging,
            transitions,
            fertility,
            birth_placement,
            cause_shares,
        }
    }

    pub fn grid(&self) -> Grid {
        self.grid
    }

    /// Per-state survival probability, with the terminal policy applied.
    pub fn survival_probabilities(&self) -> &Array1<f64> {
        &self.survival
    }

    pub fn fertility_rates(&self) -> &Array1<f64> {
        &self.fertility
    }

    /// `[causes, ages]` shares of deaths per cause, columns summing to one
    /// wherever any hazard is positive.
    pub fn cause_shares(&self) -> Option<&Array2<f64>> {
        self.cause_shares.as_ref()
    }

    /// `U v`: survivors aged one year (and moved between stages).
    pub fn survive(&self, v: ArrayView1<'_, f64>) -> Array1<f64> {
        self.propagate(v, &self.aging, true)
    }

    /// `T v`: aging and stage movement without any mortality.
    pub fn age_without_death(&self, v: ArrayView1<'_, f64>) -> Array1<f64> {
        self.propagate(v, &self.transitions, self.terminal == TerminalAge::Open)
    }

    fn propagate(
        &self,
        v: ArrayView1<'_, f64>,
        blocks: &[Array2<f64>],
        keep_terminal: bool,
    ) -> Array1<f64> {
        let stages = self.grid.stages;
        let omega = self.grid.omega();
        let mut out = Array1::zeros(self.grid.states());
        for (age, block) in blocks.iter().enumerate() {
            if age == omega && !keep_terminal {
                continue;
            }
            let source = v.slice(s![age * stages..(age + 1) * stages]);
            if source.iter().all(|&x| x == 0.0) {
                continue;
            }
            let target = (age + 1).min(omega);
            let moved = block.dot(&source);
            let mut slot = out.slice_mut(s![target * stages..(target + 1) * stages]);
            slot += &moved;
        }
        out
    }

    /// Expected deaths during the step, by state at the start of the step.
    pub fn deaths(&self, v: ArrayView1<'_, f64>) -> Array1<f64> {
        Array1::from_shape_fn(v.len(), |state| (1.0 - self.survival[state]) * v[state])
    }

    /// Births during the step summed by the parent's stage.
    pub fn births(&self, v: ArrayView1<'_, f64>) -> Array1<f64> {
        let mut by_stage = Array1::zeros(self.grid.stages);
        for (state, (&f, &x)) in self.fertility.iter().zip(v.iter()).enumerate() {
            by_stage[self.grid.stage_of(state)] += f * x;
        }
        by_stage
    }

    /// Places `share` of the given births into age class 0 according to `H`.
    pub fn place_births(&self, births_by_stage: &Array1<f64>, share: f64) -> Array1<f64> {
        let mut out = Array1::zeros(self.grid.states());
        let newborns = self.birth_placement.dot(births_by_stage);
        out.slice_mut(s![0..self.grid.stages])
            .assign(&(newborns * share));
        out
    }

    /// The initial-stage distribution of one newborn whose parent's state is
    /// distributed as `parent`.
    pub fn newborn_distribution(&self, parent: ArrayView1<'_, f64>) -> Array1<f64> {
        let mut by_stage = Array1::zeros(self.grid.stages);
        for (state, &x) in parent.iter().enumerate() {
            by_stage[self.grid.stage_of(state)] += x;
        }
        let total = by_stage.sum();
        if total > 0.0 {
            by_stage /= total;
        } else {
            by_stage[0] = 1.0;
        }
        self.place_births(&by_stage, 1.0)
    }

    /// One step of survival conditional on being alive at the end of it.
    ///
    /// Used for Focal, whose kin are always reported given Focal survives. If
    /// the state cannot survive at all, it ages without mortality instead.
    pub fn advance_conditional(&self, v: ArrayView1<'_, f64>) -> Array1<f64> {
        let survived = self.survive(v);
        let total = survived.sum();
        if total > 0.0 {
            return survived / total;
        }
        let aged = self.age_without_death(v);
        let total = aged.sum();
        if total > 0.0 { aged / total } else { aged }
    }

    pub fn to_dense(&self) -> DenseOperators {
        let n = self.grid.states();
        let stages = self.grid.stages;
        let mut survival = Array2::zeros((n, n));
        let mut fertility = Array2::zeros((n, n));
        for column in 0..n {
            let mut unit = Array1::zeros(n);
            unit[column] = 1.0;
            survival.column_mut(column).assign(&self.survive(unit.view()));
            let births = self.births(unit.view());
            fertility
                .column_mut(column)
                .assign(&self.place_births(&births, 1.0));
        }
        DenseOperators {
            survival,
            fertility,
            birth_placement: (stages > 1).then(|| self.birth_placement.clone()),
        }
    }
}
