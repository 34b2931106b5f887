//! Network port for member-to-member RPC

use std::collections::BTreeSet;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::core::rpc::{RpcReply, RpcRequest};
use crate::core::types::MemberId;
use crate::state_machine::StateMachine;

/// Errors a transport can surface. None of them implies the request was
/// not delivered — only that no reply arrived.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("member is not reachable")]
    Unreachable,
    #[error("rpc timed out")]
    Timeout,
    #[error("unknown member")]
    UnknownMember,
}

/// Unary RPC transport between cluster members.
#[async_trait]
pub trait Transport<M: StateMachine>: Send + Sync + 'static {
    /// Deliver `request` to `dest` and wait for its reply. On error the
    /// request may or may not have been processed; callers should wait for
    /// the destination to show up in [`connected_members`] before
    /// retrying.
    ///
    /// [`connected_members`]: Transport::connected_members
    async fn send_rpc(
        &self,
        dest: MemberId,
        request: RpcRequest<M>,
    ) -> Result<RpcReply, TransportError>;

    /// The set of peers an RPC is currently likely to reach, as an
    /// observable value. Does not include the local member.
    fn connected_members(&self) -> watch::Receiver<BTreeSet<MemberId>>;
}
