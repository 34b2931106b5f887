//! The consensus core
//!
//! Everything that is the Raft algorithm itself lives here; networking and
//! storage are reached through the ports in `crate::transport` and
//! `crate::storage`.

pub mod change;
pub mod config;
pub mod invariants;
pub mod log;
pub mod member;
pub mod rpc;
pub mod types;

pub use change::ChangeToken;
pub use config::RaftConfig;
pub use invariants::check_invariants;
pub use log::LogSlice;
pub use member::{ChangeLock, MemberError, MemberStatus, RaftMember, Role};
pub use rpc::{
    AppendEntriesReply, AppendEntriesRequest, InstallSnapshotReply, InstallSnapshotRequest,
    RequestVoteReply, RequestVoteRequest, RpcReply, RpcRequest, StepDownReply, StepDownRequest,
};
pub use types::{
    ClusterConfig, EntryPayload, JointConfig, LogEntry, LogIndex, MemberId, PersistentState,
    StateAndConfig, Term,
};
