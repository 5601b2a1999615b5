//! Two-sex coupling of the per-sex projection operators.
//!
//! Kin vectors are laid out as `[female states | male states]` in two-sex
//! runs and as female states only in one-sex runs. The coupler applies the
//! sex-specific `U` blockwise and routes every birth into both offspring
//! blocks according to the proportion female at birth.

use ndarray::{Array1, Array2, ArrayView1, s};
use serde::{Deserialize, Serialize};

use crate::causes::partition_deaths;
use crate::operators::PeriodOperators;
use crate::rates::Grid;

/// Proportion of births that are female, as used by DemoKin.
pub const DEFAULT_BIRTH_FEMALE: f64 = 1.0 / 2.04;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    Female,
    Male,
}

impl Sex {
    pub fn code(self) -> &'static str {
        match self {
            Self::Female => "f",
            Self::Male => "m",
        }
    }

    pub(crate) fn block(self) -> usize {
        match self {
            Self::Female => 0,
            Self::Male => 1,
        }
    }

    pub(crate) fn from_block(block: usize) -> Self {
        if block == 0 { Self::Female } else { Self::Male }
    }
}

impl std::fmt::Display for Sex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// How the sexes are modeled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SexMode {
    /// Female lineage only; fertility counts daughters.
    OneSex,
    /// Full two-sex model with sex-specific rates; fertility counts births of
    /// both sexes.
    TwoSex { birth_female: f64 },
    /// Two-sex model reusing the female rates for males.
    Androgynous { birth_female: f64 },
    /// One-sex model scaled by the GKP multipliers.
    Factors,
}

impl Default for SexMode {
    fn default() -> Self {
        Self::OneSex
    }
}

impl SexMode {
    pub fn is_two_sex(&self) -> bool {
        matches!(self, Self::TwoSex { .. } | Self::Androgynous { .. })
    }

    pub fn birth_female(&self) -> Option<f64> {
        match self {
            Self::TwoSex { birth_female } | Self::Androgynous { birth_female } => {
                Some(*birth_female)
            }
            Self::OneSex | Self::Factors => None,
        }
    }
}

/// Whose fertility produces a subsidy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fertility {
    /// Births to kin of either sex.
    AllKin,
    /// Births to female kin only. Used when the source kin are parents or
    /// grandparents, whose children would otherwise be counted once per parent.
    MothersOnly,
}

/// Per-sex operators for one period, coupled into a single kin-vector operator.
#[derive(Debug, Clone)]
pub struct CoupledOperators {
    grid: Grid,
    blocks: Vec<PeriodOperators>,
    shares: Vec<f64>,
}

impl CoupledOperators {
    pub fn one_sex(female: PeriodOperators) -> Self {
        Self {
            grid: female.grid(),
            blocks: vec![female],
            shares: vec![1.0],
        }
    }

    pub fn two_sex(female: PeriodOperators, male: PeriodOperators, birth_female: f64) -> Self {
        Self {
            grid: female.grid(),
            blocks: vec![female, male],
            shares: vec![birth_female, 1.0 - birth_female],
        }
    }

    pub fn grid(&self) -> Grid {
        self.grid
    }

    pub fn sexes(&self) -> usize {
        self.blocks.len()
    }

    /// Length of a kin vector.
    pub fn len(&self) -> usize {
        self.grid.states() * self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sex(&self, sex: Sex) -> &PeriodOperators {
        &self.blocks[sex.block().min(self.blocks.len() - 1)]
    }

    pub(crate) fn block_range(&self, block: usize) -> std::ops::Range<usize> {
        let n = self.grid.states();
        block * n..(block + 1) * n
    }

    fn map_blocks(
        &self,
        v: ArrayView1<'_, f64>,
        op: impl Fn(&PeriodOperators, ArrayView1<'_, f64>) -> Array1<f64>,
    ) -> Array1<f64> {
        let mut out = Array1::zeros(self.len());
        for (block, ops) in self.blocks.iter().enumerate() {
            let range = self.block_range(block);
            let result = op(ops, v.slice(s![range.clone()]));
            out.slice_mut(s![range]).assign(&result);
        }
        out
    }

    pub fn survive(&self, v: ArrayView1<'_, f64>) -> Array1<f64> {
        self.map_blocks(v, |ops, part| ops.survive(part))
    }

    pub fn deaths(&self, v: ArrayView1<'_, f64>) -> Array1<f64> {
        self.map_blocks(v, |ops, part| ops.deaths(part))
    }

    pub fn advance_conditional(&self, v: ArrayView1<'_, f64>) -> Array1<f64> {
        let mut out = Array1::zeros(self.len());
        for (block, ops) in self.blocks.iter().enumerate() {
            let range = self.block_range(block);
            let part = v.slice(s![range.clone()]);
            if part.iter().any(|&x| x > 0.0) {
                out.slice_mut(s![range]).assign(&ops.advance_conditional(part));
            }
        }
        out
    }

    /// `F v`: offspring produced by the kin in `v` during one step.
    pub(crate) fn reproduce(&self, v: ArrayView1<'_, f64>, fertility: Fertility) -> Array1<f64> {
        let parents = match fertility {
            Fertility::AllKin => self.blocks.len(),
            Fertility::MothersOnly => 1,
        };
        let mut births = Array1::zeros(self.grid.stages);
        for (block, ops) in self.blocks.iter().enumerate().take(parents) {
            births += &ops.births(v.slice(s![self.block_range(block)]));
        }
        let mut out = Array1::zeros(self.len());
        for (block, ops) in self.blocks.iter().enumerate() {
            let placed = ops.place_births(&births, self.shares[block]);
            out.slice_mut(s![self.block_range(block)]).assign(&placed);
        }
        out
    }

    /// Deaths by cause summed over states: shape `[sexes, causes]`.
    pub fn deaths_by_cause(&self, deaths: ArrayView1<'_, f64>, causes: usize) -> Array2<f64> {
        let mut totals = Array2::zeros((self.blocks.len(), causes));
        if causes == 0 {
            return totals;
        }
        for (block, ops) in self.blocks.iter().enumerate() {
            let Some(shares) = ops.cause_shares() else {
                continue;
            };
            let part = deaths.slice(s![self.block_range(block)]);
            totals
                .row_mut(block)
                .assign(&partition_deaths(self.grid, part, shares));
        }
        totals
    }

    /// Embeds a single-sex vector into the `sex` block of a kin vector.
    pub(crate) fn embed(&self, sex: Sex, part: &Array1<f64>) -> Array1<f64> {
        let mut out = Array1::zeros(self.len());
        let block = sex.block().min(self.blocks.len() - 1);
        out.slice_mut(s![self.block_range(block)]).assign(part);
        out
    }
}
