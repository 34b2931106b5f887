//! RPC request and reply variants
//!
//! The three RPCs of the Raft paper plus StepDown. This implementation
//! leans on the transport's connection liveness to detect failed leaders,
//! so a leader that ceases to lead without losing its connections tells
//! the other members explicitly with a StepDown RPC.

use serde::{Deserialize, Serialize};

use crate::core::log::LogSlice;
use crate::core::types::{JointConfig, LogIndex, MemberId, Term};
use crate::state_machine::StateMachine;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: MemberId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct AppendEntriesRequest<M: StateMachine> {
    pub term: Term,
    pub leader_id: MemberId,
    /// Carries the consistency-check point and the entries in one value:
    /// `entries.prev_index`/`prev_term` are what the paper calls
    /// `prevLogIndex`/`prevLogTerm`.
    pub entries: LogSlice<M>,
    pub leader_commit: LogIndex,
}

/// The snapshot is sent as a whole state value rather than as binary
/// chunks; the state machine parameter stands in for the paper's
/// `offset`/`data`/`done` fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct InstallSnapshotRequest<M: StateMachine> {
    pub term: Term,
    pub leader_id: MemberId,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub snapshot_state: M,
    pub snapshot_config: JointConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDownRequest {
    /// The term the sender was acting as leader for.
    pub term: Term,
    pub leader_id: MemberId,
}

/// A request from one member to another.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub enum RpcRequest<M: StateMachine> {
    RequestVote(RequestVoteRequest),
    AppendEntries(AppendEntriesRequest<M>),
    InstallSnapshot(InstallSnapshotRequest<M>),
    StepDown(StepDownRequest),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: Term,
    pub success: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotReply {
    pub term: Term,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDownReply {}

/// The reply to an [`RpcRequest`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcReply {
    RequestVote(RequestVoteReply),
    AppendEntries(AppendEntriesReply),
    InstallSnapshot(InstallSnapshotReply),
    StepDown(StepDownReply),
}
