//! Cluster membership as Raft sees it: the set of voting members and
//! learners, plus joint-consensus handling for safe reconfiguration.
//! Grounded on the member/learner split in the teacher corpus's Raft
//! reference (`Configuration`/`ConfigChange`), generalized here to support
//! the joint `C_old,new` transition the spec requires instead of the
//! single-server change the reference implements.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigChange {
    AddMember(NodeId),
    AddLearner(NodeId),
    RemoveServer(NodeId),
}

/// A single configuration: who votes, who merely receives the log.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub members: BTreeSet<NodeId>,
    pub learners: BTreeSet<NodeId>,
}

impl Configuration {
    pub fn apply(&mut self, change: &ConfigChange) {
        match change {
            ConfigChange::AddLearner(id) => {
                self.members.remove(id);
                self.learners.insert(id.clone());
            }
            ConfigChange::AddMember(id) => {
                self.learners.remove(id);
                self.members.insert(id.clone());
            }
            ConfigChange::RemoveServer(id) => {
                self.learners.remove(id);
                self.members.remove(id);
            }
        }
    }

    pub fn quorum_size(&self) -> usize {
        self.members.len() / 2 + 1
    }

    pub fn all(&self) -> impl Iterator<Item = &NodeId> {
        self.members.iter().chain(self.learners.iter())
    }
}

/// Either a single stable configuration, or a joint configuration spanning
/// an old and new member set during reconfiguration. While joint, a log
/// entry only commits once it has a majority in *both* `old` and `new`,
/// which is what makes reconfiguration safe against split-brain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipState {
    Stable(Configuration),
    Joint { old: Configuration, new: Configuration },
}

impl MembershipState {
    pub fn initial(members: impl IntoIterator<Item = NodeId>) -> Self {
        MembershipState::Stable(Configuration { members: members.into_iter().collect(), learners: BTreeSet::new() })
    }

    /// True once every voting member in the log entry has been counted;
    /// for a joint configuration this requires a majority in both halves.
    pub fn has_quorum(&self, acked_by: &BTreeSet<NodeId>) -> bool {
        match self {
            MembershipState::Stable(config) => {
                count_acks(config, acked_by) >= config.quorum_size()
            }
            MembershipState::Joint { old, new } => {
                count_acks(old, acked_by) >= old.quorum_size()
                    && count_acks(new, acked_by) >= new.quorum_size()
            }
        }
    }

    pub fn begin_joint(&self, target: Configuration) -> MembershipState {
        let old = match self {
            MembershipState::Stable(config) => config.clone(),
            MembershipState::Joint { new, .. } => new.clone(),
        };
        MembershipState::Joint { old, new: target }
    }

    /// Collapse a joint configuration to just its new half, once the
    /// joint entry itself has committed.
    pub fn finish_joint(&self) -> MembershipState {
        match self {
            MembershipState::Joint { new, .. } => MembershipState::Stable(new.clone()),
            stable => stable.clone(),
        }
    }

    pub fn is_voting_member(&self, id: &NodeId) -> bool {
        match self {
            MembershipState::Stable(config) => config.members.contains(id),
            MembershipState::Joint { old, new } => old.members.contains(id) || new.members.contains(id),
        }
    }

    pub fn all_voters(&self) -> BTreeSet<NodeId> {
        match self {
            MembershipState::Stable(config) => config.members.clone(),
            MembershipState::Joint { old, new } => old.members.union(&new.members).cloned().collect(),
        }
    }
}

fn count_acks(config: &Configuration, acked_by: &BTreeSet<NodeId>) -> usize {
    config.members.intersection(acked_by).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(label: &str) -> NodeId {
        NodeId::new(label)
    }

    #[test]
    fn stable_quorum_is_majority_of_members() {
        let state = MembershipState::initial([node("a"), node("b"), node("c")]);
        let acked: BTreeSet<NodeId> = [node("a"), node("b")].into_iter().collect();
        assert!(state.has_quorum(&acked));
        let acked_one: BTreeSet<NodeId> = [node("a")].into_iter().collect();
        assert!(!state.has_quorum(&acked_one));
    }

    #[test]
    fn joint_quorum_requires_majority_in_both_halves() {
        let old = Configuration { members: [node("a"), node("b"), node("c")].into_iter().collect(), learners: Default::default() };
        let new = Configuration { members: [node("c"), node("d"), node("e")].into_iter().collect(), learners: Default::default() };
        let joint = MembershipState::Joint { old, new };

        let acked: BTreeSet<NodeId> = [node("a"), node("b")].into_iter().collect();
        assert!(!joint.has_quorum(&acked), "new half has no acks yet");

        let acked_both: BTreeSet<NodeId> = [node("a"), node("b"), node("c"), node("d")].into_iter().collect();
        assert!(joint.has_quorum(&acked_both));
    }
}
