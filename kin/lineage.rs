//! The kinship recursion over Focal's age and calendar time.
//!
//! Each node keeps a panel with one column per Focal age. A stationary solve
//! fills every column from a single period; [`Lineage::advance`] moves a whole
//! year of panels forward one calendar year, taking column `x` of year `t` to
//! column `x + 1` of year `t + 1` under the rates of `t`, and re-seeding
//! column 0 for the cohort born in `t + 1` from that year's parents. Both go through the same column step, so a constant period
//! sequence reproduces the stationary panels bit for bit.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2, ArrayView1, Axis, concatenate};

use crate::coupler::{CoupledOperators, Sex};
use crate::kin_type::KinType;
use crate::rules::{Advance, Node, Rule, RuleBook, Seed, Via};
use crate::stable::ParentalDistribution;

/// Everything one period contributes to the recursion.
pub(crate) struct PeriodContext {
    pub ops: CoupledOperators,
    pub parents: ParentalDistribution,
    pub focal_sex: Sex,
    pub causes: usize,
}

impl PeriodContext {
    fn newborn(&self, sex: Sex) -> Array1<f64> {
        let placed = self
            .ops
            .sex(sex)
            .newborn_distribution(self.parents.mother().view());
        self.ops.embed(sex, &placed)
    }

    fn parents_vector(&self) -> Array1<f64> {
        match self.parents.father() {
            Some(father) => concatenate![Axis(0), self.parents.mother().view(), father.view()],
            None => self.parents.mother().clone(),
        }
    }

    fn mixing_weights(&self, via: Via) -> Array1<f64> {
        let mut weights = self.parents.mother_by_age();
        if via == Via::BothParents {
            if let Some(father) = self.parents.father_by_age() {
                weights += &father;
            }
        }
        weights
    }

    fn cause_rows(&self) -> usize {
        self.ops.sexes() * self.causes
    }
}

/// All Focal ages of one node: kin vectors as columns.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct KinPanel {
    /// Expected living kin, `[kin states, focal ages]`.
    pub living: Array2<f64>,
    /// Kin deaths during the year leading up to each Focal age, by the state
    /// the kin died in.
    pub dead: Array2<f64>,
    /// Running sum of `dead` over Focal's life.
    pub cum_dead: Array2<f64>,
    /// Running deaths per `(sex, cause)`, `[sexes * causes, focal ages]`.
    pub cum_dead_by_cause: Array2<f64>,
}

impl KinPanel {
    fn zeros(states: usize, cause_rows: usize, ages: usize) -> Self {
        Self {
            living: Array2::zeros((states, ages)),
            dead: Array2::zeros((states, ages)),
            cum_dead: Array2::zeros((states, ages)),
            cum_dead_by_cause: Array2::zeros((cause_rows, ages)),
        }
    }

    fn write(&mut self, focal_age: usize, column: Column) {
        self.living.column_mut(focal_age).assign(&column.living);
        self.dead.column_mut(focal_age).assign(&column.dead);
        self.cum_dead.column_mut(focal_age).assign(&column.cum_dead);
        self.cum_dead_by_cause
            .column_mut(focal_age)
            .assign(&column.cum_dead_by_cause);
    }
}

struct Column {
    living: Array1<f64>,
    dead: Array1<f64>,
    cum_dead: Array1<f64>,
    cum_dead_by_cause: Array1<f64>,
}

/// Panels of every evaluated node for one calendar year.
#[derive(Debug, Clone, Default)]
pub(crate) struct KinSnapshot {
    panels: BTreeMap<Node, KinPanel>,
}

impl KinSnapshot {
    pub fn panel(&self, node: Node) -> Option<&KinPanel> {
        self.panels.get(&node)
    }

    fn require(&self, node: Node) -> &KinPanel {
        match self.panels.get(&node) {
            Some(panel) => panel,
            None => unreachable!("{node:?} evaluated before its dependencies"),
        }
    }
}

/// The rule book plus the evaluation schedule for the requested kin.
#[derive(Debug, Clone)]
pub(crate) struct Lineage {
    book: RuleBook,
    order: Vec<Node>,
}

impl Lineage {
    pub fn new(book: RuleBook, requested: &[KinType]) -> Self {
        let order = book.evaluation_order(requested);
        log::debug!("Kin evaluation order: {order:?}");
        Self { book, order }
    }

    /// Panels for a population that has lived under `ctx` forever.
    pub fn solve_stationary(&self, ctx: &PeriodContext) -> KinSnapshot {
        let ages = ctx.ops.grid().ages;
        let mut snapshot = KinSnapshot::default();
        for &node in &self.order {
            let rule = self.book.rule(node);
            let mut panel = KinPanel::zeros(ctx.ops.len(), ctx.cause_rows(), ages);
            panel.write(0, self.seed(rule, node, ctx, &snapshot));
            for focal_age in 0..ages.saturating_sub(1) {
                let subsidy = rule
                    .subsidy
                    .map(|(source, _)| snapshot.require(source).living.column(focal_age));
                let next = step(rule, ctx, &panel, focal_age, subsidy);
                panel.write(focal_age + 1, next);
            }
            snapshot.panels.insert(node, panel);
        }
        snapshot
    }

    /// Moves `previous` (year `t`) to year `t + 1`. Survivors and births
    /// follow the rates of year `t` in `current`; the cohort born in `t + 1`
    /// is seeded from `next`.
    pub fn advance(
        &self,
        previous: &KinSnapshot,
        current: &PeriodContext,
        next: &PeriodContext,
    ) -> KinSnapshot {
        let ages = current.ops.grid().ages;
        let mut snapshot = KinSnapshot::default();
        for &node in &self.order {
            let rule = self.book.rule(node);
            let before = previous.require(node);
            let mut panel = KinPanel::zeros(current.ops.len(), current.cause_rows(), ages);
            panel.write(0, self.seed(rule, node, next, &snapshot));
            for focal_age in 0..ages.saturating_sub(1) {
                let subsidy = rule
                    .subsidy
                    .map(|(source, _)| previous.require(source).living.column(focal_age));
                let column = step(rule, current, before, focal_age, subsidy);
                panel.write(focal_age + 1, column);
            }
            snapshot.panels.insert(node, panel);
        }
        snapshot
    }

    fn seed(&self, rule: Rule, node: Node, ctx: &PeriodContext, year: &KinSnapshot) -> Column {
        let living = match rule.seed {
            Seed::Zero => Array1::zeros(ctx.ops.len()),
            Seed::Birth => {
                let sex = if node == Node::MaternalFocal {
                    Sex::Female
                } else {
                    ctx.focal_sex
                };
                ctx.newborn(sex)
            }
            Seed::Parents => ctx.parents_vector(),
            Seed::Mix { source, via } => year
                .require(source)
                .living
                .dot(&ctx.mixing_weights(via)),
        };
        Column {
            dead: Array1::zeros(living.len()),
            cum_dead: Array1::zeros(living.len()),
            cum_dead_by_cause: Array1::zeros(ctx.cause_rows()),
            living,
        }
    }
}

/// One year of the kinship equation, `k(x+1) = U k(x) + F src(x)`, with the
/// deaths of the year added to the running totals.
fn step(
    rule: Rule,
    ctx: &PeriodContext,
    panel: &KinPanel,
    focal_age: usize,
    subsidy: Option<ArrayView1<'_, f64>>,
) -> Column {
    let living = panel.living.column(focal_age);
    let cum_dead = panel.cum_dead.column(focal_age);
    let cum_by_cause = panel.cum_dead_by_cause.column(focal_age);
    match rule.advance {
        Advance::Conditional => Column {
            living: ctx.ops.advance_conditional(living),
            dead: Array1::zeros(living.len()),
            cum_dead: cum_dead.to_owned(),
            cum_dead_by_cause: cum_by_cause.to_owned(),
        },
        Advance::Survival => {
            let mut next = ctx.ops.survive(living);
            if let (Some(source), Some((_, fertility))) = (subsidy, rule.subsidy) {
                next += &ctx.ops.reproduce(source, fertility);
            }
            let dead = ctx.ops.deaths(living);
            let by_cause = ctx.ops.deaths_by_cause(dead.view(), ctx.causes);
            let cum_dead_by_cause = &cum_by_cause + &Array1::from_iter(by_cause.iter().copied());
            Column {
                living: next,
                cum_dead: &cum_dead + &dead,
                dead,
                cum_dead_by_cause,
            }
        }
    }
}
