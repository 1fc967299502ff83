use crate::NodeId;
use std::collections::BTreeSet;

/// Voter configuration of the group.
///
/// A non-empty `outgoing` set means a joint configuration: the group is
/// moving from `outgoing` to `voters`, and every quorum needs a majority of
/// both.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Membership {
    pub voters: BTreeSet<NodeId>,
    pub outgoing: BTreeSet<NodeId>,
}

impl Membership {
    pub fn new(voters: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            voters: voters.into_iter().collect(),
            outgoing: BTreeSet::new(),
        }
    }

    /// The joint configuration leading from `current` to `incoming`.
    pub fn joint(current: &Membership, incoming: BTreeSet<NodeId>) -> Self {
        Self {
            voters: incoming,
            outgoing: current.voters.clone(),
        }
    }

    /// The configuration a joint one settles into.
    pub fn leave_joint(&self) -> Self {
        Self {
            voters: self.voters.clone(),
            outgoing: BTreeSet::new(),
        }
    }

    pub fn is_joint(&self) -> bool {
        !self.outgoing.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.voters.is_empty() && self.outgoing.is_empty()
    }

    /// `true` if `id` votes in either half of the configuration.
    pub fn contains(&self, id: NodeId) -> bool {
        self.voters.contains(&id) || self.outgoing.contains(&id)
    }

    /// Every voter of both halves.
    pub fn ids(&self) -> BTreeSet<NodeId> {
        self.voters.union(&self.outgoing).copied().collect()
    }

    /// `true` if the nodes for which `acked` holds form a quorum.
    pub fn has_quorum(&self, acked: impl Fn(NodeId) -> bool) -> bool {
        majority_of(&self.voters, &acked) && majority_of(&self.outgoing, &acked)
    }

    /// Highest index stored on a quorum, given each voter's match index.
    pub fn committed_index(&self, matched: impl Fn(NodeId) -> u64) -> u64 {
        majority_index(&self.voters, &matched).min(majority_index(&self.outgoing, &matched))
    }
}

fn majority_of(set: &BTreeSet<NodeId>, acked: &impl Fn(NodeId) -> bool) -> bool {
    if set.is_empty() {
        return true;
    }
    let yes = set.iter().filter(|id| acked(**id)).count();
    yes > set.len() / 2
}

fn majority_index(set: &BTreeSet<NodeId>, matched: &impl Fn(NodeId) -> u64) -> u64 {
    if set.is_empty() {
        return u64::MAX;
    }
    let mut indexes: Vec<u64> = set.iter().map(|id| matched(*id)).collect();
    indexes.sort_unstable_by(|a, b| b.cmp(a));
    indexes[set.len() / 2]
}
