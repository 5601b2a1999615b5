//! Kin recursion rules and their evaluation order.
//!
//! Every kin node is produced from already-computed nodes in two ways: its
//! distribution at Focal's birth (the seed) may be a mixture of another node's
//! distributions over the parents' ages, and while Focal ages it may receive
//! newborns from another node's fertility (the subsidy). Both relations are
//! edges of a dependency graph; nodes are evaluated in topological order.

use std::collections::{BTreeMap, BTreeSet};

use crate::coupler::Fertility;
use crate::kin_type::KinType;

/// A node of the kinship recursion: a reported kin type or an auxiliary
/// lineage needed to seed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum Node {
    /// Focal's own state distribution.
    Focal,
    /// A female reference individual, standing in for Focal's mother when the
    /// children of a mother must be computed for a male Focal.
    MaternalFocal,
    /// Children of [`Node::MaternalFocal`].
    MaternalChildren,
    /// Grandchildren of [`Node::MaternalFocal`].
    MaternalGrandchildren,
    Kin(KinType),
}

/// Which parents a seed mixes over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Via {
    Mother,
    BothParents,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Seed {
    Zero,
    /// Focal's (or the maternal reference's) newborn state.
    Birth,
    /// The parental distribution itself.
    Parents,
    /// `Σ_x π(x) K(:, x)` over the parents' ages.
    Mix { source: Node, via: Via },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Advance {
    /// `U k + F src`: ordinary kin subject to mortality.
    Survival,
    /// Survival conditional on being alive (Focal and its stand-ins).
    Conditional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Rule {
    pub seed: Seed,
    pub subsidy: Option<(Node, Fertility)>,
    pub advance: Advance,
}

impl Rule {
    fn kin(seed: Seed, subsidy: Option<(Node, Fertility)>) -> Self {
        Self {
            seed,
            subsidy,
            advance: Advance::Survival,
        }
    }

    fn dependencies(&self) -> impl Iterator<Item = Node> + '_ {
        let seed = match self.seed {
            Seed::Mix { source, .. } => Some(source),
            Seed::Zero | Seed::Birth | Seed::Parents => None,
        };
        seed.into_iter()
            .chain(self.subsidy.map(|(source, _)| source))
    }
}

/// The rule table for one run.
///
/// `maternal_is_focal` says whether Focal can stand in for its own mother,
/// which holds unless Focal is male in a two-sex run.
#[derive(Debug, Clone)]
pub(crate) struct RuleBook {
    maternal_is_focal: bool,
}

impl RuleBook {
    pub fn new(maternal_is_focal: bool) -> Self {
        Self { maternal_is_focal }
    }

    fn mothers_children(&self) -> Node {
        if self.maternal_is_focal {
            Node::Kin(KinType::D)
        } else {
            Node::MaternalChildren
        }
    }

    fn mothers_grandchildren(&self) -> Node {
        if self.maternal_is_focal {
            Node::Kin(KinType::Gd)
        } else {
            Node::MaternalGrandchildren
        }
    }

    pub fn rule(&self, node: Node) -> Rule {
        use Fertility::{AllKin, MothersOnly};
        use KinType as K;
        let kin = Node::Kin;
        let mix = |source: Node, via: Via| Seed::Mix { source, via };
        match node {
            Node::Focal | Node::MaternalFocal => Rule {
                seed: Seed::Birth,
                subsidy: None,
                advance: Advance::Conditional,
            },
            Node::MaternalChildren => Rule::kin(Seed::Zero, Some((Node::MaternalFocal, AllKin))),
            Node::MaternalGrandchildren => {
                Rule::kin(Seed::Zero, Some((Node::MaternalChildren, AllKin)))
            }
            Node::Kin(kin_type) => match kin_type {
                K::D => Rule::kin(Seed::Zero, Some((Node::Focal, AllKin))),
                K::Gd => Rule::kin(Seed::Zero, Some((kin(K::D), AllKin))),
                K::Ggd => Rule::kin(Seed::Zero, Some((kin(K::Gd), AllKin))),
                K::Gggd => Rule::kin(Seed::Zero, Some((kin(K::Ggd), AllKin))),
                K::M => Rule::kin(Seed::Parents, None),
                K::Gm => Rule::kin(mix(kin(K::M), Via::BothParents), None),
                K::Ggm => Rule::kin(mix(kin(K::Gm), Via::BothParents), None),
                K::Gggm => Rule::kin(mix(kin(K::Ggm), Via::BothParents), None),
                K::Os => Rule::kin(mix(self.mothers_children(), Via::Mother), None),
                K::Ys => Rule::kin(Seed::Zero, Some((kin(K::M), MothersOnly))),
                K::Nos => Rule::kin(
                    mix(self.mothers_grandchildren(), Via::Mother),
                    Some((kin(K::Os), AllKin)),
                ),
                K::Nys => Rule::kin(Seed::Zero, Some((kin(K::Ys), AllKin))),
                K::Oa => Rule::kin(mix(kin(K::Os), Via::BothParents), None),
                K::Ya => Rule::kin(
                    mix(kin(K::Ys), Via::BothParents),
                    Some((kin(K::Gm), MothersOnly)),
                ),
                K::Coa => Rule::kin(
                    mix(kin(K::Nos), Via::BothParents),
                    Some((kin(K::Oa), AllKin)),
                ),
                K::Cya => Rule::kin(
                    mix(kin(K::Nys), Via::BothParents),
                    Some((kin(K::Ya), AllKin)),
                ),
            },
        }
    }

    /// All nodes needed to produce `requested`, in dependency order.
    ///
    /// Ties are broken by the node ordering so the schedule is deterministic.
    pub fn evaluation_order(&self, requested: &[KinType]) -> Vec<Node> {
        let mut needed = BTreeSet::new();
        let mut stack: Vec<Node> = requested.iter().copied().map(Node::Kin).collect();
        while let Some(node) = stack.pop() {
            if needed.insert(node) {
                stack.extend(self.rule(node).dependencies());
            }
        }

        let mut indegree: BTreeMap<Node, usize> = needed.iter().map(|&n| (n, 0)).collect();
        let mut dependents: BTreeMap<Node, Vec<Node>> = BTreeMap::new();
        for &node in &needed {
            for dependency in self.rule(node).dependencies() {
                *indegree.entry(node).or_default() += 1;
                dependents.entry(dependency).or_default().push(node);
            }
        }

        let mut ready: BTreeSet<Node> = indegree
            .iter()
            .filter(|&(_, &d)| d == 0)
            .map(|(&n, _)| n)
            .collect();
        let mut order = Vec::with_capacity(needed.len());
        while let Some(node) = ready.pop_first() {
            order.push(node);
            for &dependent in dependents.get(&node).into_iter().flatten() {
                let remaining = indegree.entry(dependent).or_default();
                *remaining -= 1;
                if *remaining == 0 {
                    ready.insert(dependent);
                }
            }
        }
        debug_assert_eq!(order.len(), needed.len(), "kin rules must be acyclic");
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(order: &[Node], node: Node) -> usize {
        order
            .iter()
            .position(|&n| n == node)
            .unwrap_or_else(|| panic!("{node:?} missing from {order:?}"))
    }

    #[test]
    fn every_dependency_precedes_its_dependent() {
        for maternal_is_focal in [true, false] {
            let book = RuleBook::new(maternal_is_focal);
            let order = book.evaluation_order(&KinType::ALL);
            for &node in &order {
                for dependency in book.rule(node).dependencies() {
                    assert!(position(&order, dependency) < position(&order, node));
                }
            }
        }
    }

    #[test]
    fn cousins_pull_in_their_whole_lineage() {
        let book = RuleBook::new(true);
        let order = book.evaluation_order(&[KinType::Coa]);
        for kin in [KinType::Nos, KinType::Oa, KinType::Os, KinType::Gd, KinType::D] {
            assert!(order.contains(&Node::Kin(kin)), "{kin} missing");
        }
        assert!(order.contains(&Node::Focal));
        assert!(!order.contains(&Node::Kin(KinType::Cya)));
        assert!(!order.contains(&Node::MaternalFocal));
    }

    #[test]
    fn male_focal_uses_a_maternal_stand_in_for_siblings() {
        let book = RuleBook::new(false);
        let order = book.evaluation_order(&[KinType::Os]);
        assert_eq!(
            order,
            vec![
                Node::MaternalFocal,
                Node::MaternalChildren,
                Node::Kin(KinType::Os),
            ]
        );
    }

    #[test]
    fn mother_has_no_dependencies() {
        let book = RuleBook::new(true);
        assert_eq!(book.evaluation_order(&[KinType::M]), vec![Node::Kin(KinType::M)]);
    }
}
