//! Core identifier, configuration, and persistent-state types

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::log::LogSlice;
use crate::state_machine::StateMachine;

/// Monotonic election epoch. At most one leader exists per term.
pub type Term = u64;

/// 1-based position in the replicated log.
pub type LogIndex = u64;

/// Identity of one member of the cluster.
///
/// Ids are opaque 128-bit values rather than small integers because there
/// is no reliable distributed way of assigning integers. A process that
/// leaves the cluster and joins again must use a fresh id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(u128);

impl MemberId {
    /// Generate a fresh, globally unique id.
    pub fn random() -> Self {
        MemberId(rand::random())
    }

    /// Build an id from a raw value. Useful for tests that want stable,
    /// readable ids; production members should use [`MemberId::random`].
    pub const fn from_raw(raw: u128) -> Self {
        MemberId(raw)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0 as u32)
    }
}

impl fmt::Debug for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemberId({self})")
    }
}

/// The set of members participating in the cluster.
///
/// `voting` members count for elections and entry commitment; `non_voting`
/// members receive replicated entries but hold no vote.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub voting: BTreeSet<MemberId>,
    pub non_voting: BTreeSet<MemberId>,
}

impl ClusterConfig {
    /// Configuration with the given voting members and no non-voting ones.
    pub fn new(voting: impl IntoIterator<Item = MemberId>) -> Self {
        ClusterConfig {
            voting: voting.into_iter().collect(),
            non_voting: BTreeSet::new(),
        }
    }

    /// All members, voting and non-voting.
    pub fn all_members(&self) -> BTreeSet<MemberId> {
        self.voting.union(&self.non_voting).copied().collect()
    }

    pub fn is_member(&self, member: MemberId) -> bool {
        self.voting.contains(&member) || self.non_voting.contains(&member)
    }

    /// Whether `members` contains a strict majority of the voting set.
    pub fn is_quorum(&self, members: &BTreeSet<MemberId>) -> bool {
        let votes = self.voting.intersection(members).count();
        votes * 2 > self.voting.len()
    }

    pub fn is_valid_leader(&self, member: MemberId) -> bool {
        self.voting.contains(&member)
    }
}

/// Either a single configuration or a joint consensus of an old and a new
/// configuration.
///
/// During a reconfiguration the cluster passes through a joint phase where
/// `next` is present: entries are replicated to all members of both
/// configurations, and agreement requires separate majorities from both.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JointConfig {
    pub current: ClusterConfig,
    pub next: Option<ClusterConfig>,
}

impl JointConfig {
    /// Wrap a single configuration (no transition in progress).
    pub fn single(config: ClusterConfig) -> Self {
        JointConfig {
            current: config,
            next: None,
        }
    }

    pub fn is_joint(&self) -> bool {
        self.next.is_some()
    }

    pub fn all_members(&self) -> BTreeSet<MemberId> {
        let mut members = self.current.all_members();
        if let Some(next) = &self.next {
            members.extend(next.all_members());
        }
        members
    }

    pub fn is_member(&self, member: MemberId) -> bool {
        self.current.is_member(member)
            || self.next.as_ref().is_some_and(|n| n.is_member(member))
    }

    /// All voting members of either configuration; the set a candidate
    /// solicits votes from.
    pub fn voting_members(&self) -> BTreeSet<MemberId> {
        let mut members = self.current.voting.clone();
        if let Some(next) = &self.next {
            members.extend(next.voting.iter().copied());
        }
        members
    }

    /// Under joint consensus a quorum requires a majority in both halves.
    pub fn is_quorum(&self, members: &BTreeSet<MemberId>) -> bool {
        match &self.next {
            Some(next) => self.current.is_quorum(members) && next.is_quorum(members),
            None => self.current.is_quorum(members),
        }
    }

    /// Any voting member of either configuration may serve as leader.
    pub fn is_valid_leader(&self, member: MemberId) -> bool {
        self.current.is_valid_leader(member)
            || self.next.as_ref().is_some_and(|n| n.is_valid_leader(member))
    }
}

/// Payload of one log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub enum EntryPayload<M: StateMachine> {
    /// An application change to apply to the state machine.
    Change(M::Change),
    /// A cluster configuration change; takes effect as soon as it is
    /// appended, regardless of commitment.
    Config(JointConfig),
    /// Does nothing. Appended by a fresh leader so entries from earlier
    /// terms can be committed through a current-term majority match.
    Noop,
}

/// One entry of the replicated log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct LogEntry<M: StateMachine> {
    pub term: Term,
    pub payload: EntryPayload<M>,
}

/// Everything a member must write to stable storage before acting on it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct PersistentState<M: StateMachine> {
    /// Latest term this member has seen.
    pub current_term: Term,
    /// Candidate this member voted for in `current_term`, if any.
    pub voted_for: Option<MemberId>,
    /// State machine value with every entry up to `log.prev_index` applied.
    pub snapshot_state: M,
    /// Configuration in effect at `log.prev_index`.
    pub snapshot_config: JointConfig,
    /// The log suffix not yet folded into the snapshot.
    pub log: LogSlice<M>,
}

impl<M: StateMachine> PersistentState<M> {
    /// The record every founding member of a new cluster starts from. The
    /// caller must hand the same `initial_state` and `initial_config` to
    /// every founding member.
    pub fn make_initial(initial_state: M, initial_config: ClusterConfig) -> Self {
        PersistentState {
            current_term: 0,
            voted_for: None,
            snapshot_state: initial_state,
            snapshot_config: JointConfig::single(initial_config),
            log: LogSlice::new(0, 0),
        }
    }
}

/// A state machine value together with the log index it reflects and the
/// configuration in effect at that index. Published through watch channels
/// as the committed and latest views.
#[derive(Clone, Debug, PartialEq)]
pub struct StateAndConfig<M: StateMachine> {
    pub log_index: LogIndex,
    pub state: M,
    pub config: JointConfig,
}

impl<M: StateMachine> StateAndConfig<M> {
    /// Advance this view by applying log entries `first ..= last`.
    pub(crate) fn apply_entries(&mut self, log: &LogSlice<M>, first: LogIndex, last: LogIndex) {
        assert_eq!(
            self.log_index + 1,
            first,
            "entries must be applied contiguously"
        );
        for index in first..=last {
            match &log.entry(index).payload {
                EntryPayload::Change(change) => self.state.apply_change(change),
                EntryPayload::Config(config) => self.config = config.clone(),
                EntryPayload::Noop => {}
            }
        }
        self.log_index = last;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: impl IntoIterator<Item = u128>) -> BTreeSet<MemberId> {
        raw.into_iter().map(MemberId::from_raw).collect()
    }

    #[test]
    fn quorum_is_strict_majority() {
        let config = ClusterConfig::new(ids([1, 2, 3]));
        assert!(config.is_quorum(&ids([1, 2])));
        assert!(config.is_quorum(&ids([1, 2, 3])));
        assert!(!config.is_quorum(&ids([1])));
        // Non-members never count toward a quorum.
        assert!(!config.is_quorum(&ids([1, 9])));
    }

    #[test]
    fn quorum_of_four_needs_three() {
        let config = ClusterConfig::new(ids([1, 2, 3, 4]));
        assert!(!config.is_quorum(&ids([1, 2])));
        assert!(config.is_quorum(&ids([1, 2, 3])));
    }

    #[test]
    fn non_voting_members_do_not_vote() {
        let mut config = ClusterConfig::new(ids([1, 2, 3]));
        config.non_voting = ids([4]);
        assert!(config.is_member(MemberId::from_raw(4)));
        assert!(!config.is_valid_leader(MemberId::from_raw(4)));
        assert!(!config.is_quorum(&ids([1, 4])));
    }

    #[test]
    fn joint_quorum_needs_both_majorities() {
        let joint = JointConfig {
            current: ClusterConfig::new(ids([1, 2, 3])),
            next: Some(ClusterConfig::new(ids([3, 4, 5]))),
        };
        // Majority of {1,2,3} but not of {3,4,5}.
        assert!(!joint.is_quorum(&ids([1, 2])));
        // Majority of both.
        assert!(joint.is_quorum(&ids([1, 2, 3, 4])));
        assert!(joint.is_quorum(&ids([2, 3, 4])));
        // Majority of {3,4,5} but not of {1,2,3}.
        assert!(!joint.is_quorum(&ids([4, 5])));
    }

    #[test]
    fn joint_leader_may_come_from_either_half() {
        let joint = JointConfig {
            current: ClusterConfig::new(ids([1, 2, 3])),
            next: Some(ClusterConfig::new(ids([4, 5, 6]))),
        };
        assert!(joint.is_valid_leader(MemberId::from_raw(1)));
        assert!(joint.is_valid_leader(MemberId::from_raw(6)));
        assert!(!joint.is_valid_leader(MemberId::from_raw(7)));
    }

    #[test]
    fn joint_voting_members_is_the_union() {
        let joint = JointConfig {
            current: ClusterConfig::new(ids([1, 2])),
            next: Some(ClusterConfig::new(ids([2, 3]))),
        };
        assert_eq!(joint.voting_members(), ids([1, 2, 3]));
    }

    #[test]
    fn initial_state_is_empty_at_term_zero() {
        let ps = PersistentState::make_initial(
            crate::state_machine::RecordingStateMachine::new(),
            ClusterConfig::new(ids([1, 2, 3])),
        );
        assert_eq!(ps.current_term, 0);
        assert_eq!(ps.voted_for, None);
        assert_eq!(ps.log.latest_index(), 0);
        assert!(!ps.snapshot_config.is_joint());
    }
}
