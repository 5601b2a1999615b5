//! Reduction of kin panels into the full and summary tables.

use ndarray::{ArrayView1, s};

use crate::coupler::Sex;
use crate::kin_type::KinType;
use crate::lineage::KinPanel;
use crate::rates::Grid;

/// One kin state at one Focal age.
#[derive(Debug, Clone, PartialEq)]
pub struct FullRow {
    pub kin: KinType,
    pub focal_age: usize,
    pub kin_age: usize,
    /// 1-based stage; `None` in age-only runs.
    pub stage: Option<usize>,
    /// `None` in one-sex runs.
    pub sex: Option<Sex>,
    pub year: Option<i32>,
    pub cohort: Option<i32>,
    pub living: f64,
    /// Kin who died in this state during the year before `focal_age`.
    pub dead: f64,
    pub cum_dead: f64,
}

/// Kin of one type (and sex) at one Focal age, summed over kin age and stage.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRow {
    pub kin: KinType,
    pub focal_age: usize,
    pub sex: Option<Sex>,
    pub year: Option<i32>,
    pub cohort: Option<i32>,
    pub count_living: f64,
    pub mean_age: Option<f64>,
    pub sd_age: Option<f64>,
    pub count_dead: f64,
    pub count_cum_dead: f64,
    /// Mean age of kin at death over all deaths experienced so far.
    pub mean_age_at_death: Option<f64>,
    /// `count_cum_dead` split by cause, in the order of the cause names.
    pub cum_dead_by_cause: Vec<f64>,
}

/// How panel sex blocks map onto reported rows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum SexLayout {
    /// Single female-lineage block, reported without a sex.
    OneSex,
    /// Female and male blocks.
    TwoSex,
    /// Single block scaled by the kin type's GKP factor and split evenly
    /// into female and male rows.
    Factors,
}

/// Where a panel column sits in calendar time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RowKey {
    pub kin: KinType,
    pub focal_age: usize,
    pub year: Option<i32>,
}

impl RowKey {
    fn cohort(&self) -> Option<i32> {
        self.year.map(|year| year - self.focal_age as i32)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Reducer {
    grid: Grid,
    layout: SexLayout,
    causes: usize,
}

/// A block of one panel column together with the factor applied to it.
struct Slice<'a> {
    sex: Option<Sex>,
    scale: f64,
    living: ArrayView1<'a, f64>,
    dead: ArrayView1<'a, f64>,
    cum_dead: ArrayView1<'a, f64>,
    cum_dead_by_cause: ArrayView1<'a, f64>,
}

impl Reducer {
    pub fn new(grid: Grid, layout: SexLayout, causes: usize) -> Self {
        Self {
            grid,
            layout,
            causes,
        }
    }

    fn slices<'a>(&self, panel: &'a KinPanel, key: &RowKey) -> Vec<Slice<'a>> {
        let n = self.grid.states();
        let x = key.focal_age;
        let block = |index: usize, sex: Option<Sex>, scale: f64| {
            let states = index * n..(index + 1) * n;
            let causes = index * self.causes..(index + 1) * self.causes;
            Slice {
                sex,
                scale,
                living: panel.living.slice(s![states.clone(), x]),
                dead: panel.dead.slice(s![states.clone(), x]),
                cum_dead: panel.cum_dead.slice(s![states, x]),
                cum_dead_by_cause: panel.cum_dead_by_cause.slice(s![causes, x]),
            }
        };
        match self.layout {
            SexLayout::OneSex => vec![block(0, None, 1.0)],
            SexLayout::TwoSex => vec![
                block(0, Some(Sex::Female), 1.0),
                block(1, Some(Sex::Male), 1.0),
            ],
            SexLayout::Factors => {
                let half = key.kin.gkp_factor() / 2.0;
                vec![
                    block(0, Some(Sex::Female), half),
                    block(0, Some(Sex::Male), half),
                ]
            }
        }
    }

    pub fn full_rows(&self, panel: &KinPanel, key: RowKey, out: &mut Vec<FullRow>) {
        let cohort = key.cohort();
        for slice in self.slices(panel, &key) {
            for state in 0..self.grid.states() {
                out.push(FullRow {
                    kin: key.kin,
                    focal_age: key.focal_age,
                    kin_age: self.grid.age_of(state),
                    stage: self
                        .grid
                        .is_multistage()
                        .then(|| self.grid.stage_of(state) + 1),
                    sex: slice.sex,
                    year: key.year,
                    cohort,
                    living: slice.scale * slice.living[state],
                    dead: slice.scale * slice.dead[state],
                    cum_dead: slice.scale * slice.cum_dead[state],
                });
            }
        }
    }

    pub fn summary_rows(&self, panel: &KinPanel, key: RowKey, out: &mut Vec<SummaryRow>) {
        let cohort = key.cohort();
        for slice in self.slices(panel, &key) {
            let living = self.age_moments(slice.living);
            let cumulative = self.age_moments(slice.cum_dead);
            out.push(SummaryRow {
                kin: key.kin,
                focal_age: key.focal_age,
                sex: slice.sex,
                year: key.year,
                cohort,
                count_living: slice.scale * living.total,
                mean_age: living.mean(),
                sd_age: living.sd(),
                count_dead: slice.scale * slice.dead.sum(),
                count_cum_dead: slice.scale * cumulative.total,
                mean_age_at_death: cumulative.mean(),
                cum_dead_by_cause: slice
                    .cum_dead_by_cause
                    .iter()
                    .map(|&v| slice.scale * v)
                    .collect(),
            });
        }
    }

    fn age_moments(&self, values: ArrayView1<'_, f64>) -> AgeMoments {
        let mut moments = AgeMoments::default();
        for (state, &weight) in values.iter().enumerate() {
            let age = self.grid.age_of(state) as f64;
            moments.total += weight;
            moments.first += weight * age;
            moments.second += weight * age * age;
        }
        moments
    }
}

#[derive(Debug, Default)]
struct AgeMoments {
    total: f64,
    first: f64,
    second: f64,
}

impl AgeMoments {
    fn mean(&self) -> Option<f64> {
        (self.total > 0.0).then(|| self.first / self.total)
    }

    fn sd(&self) -> Option<f64> {
        self.mean().map(|mean| {
            let variance = self.second / self.total - mean * mean;
            variance.max(0.0).sqrt()
        })
    }
}
