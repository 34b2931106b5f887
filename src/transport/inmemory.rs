//! In-memory network for testing
//!
//! Routes RPCs between in-process members over channels, with per-link
//! partitions and an observable connectivity set per member. The tests use
//! the partition controls to simulate leader loss, network splits, and
//! healing.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};

use super::{Transport, TransportError};
use crate::core::rpc::{RpcReply, RpcRequest};
use crate::core::types::MemberId;
use crate::state_machine::StateMachine;

const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(1);
const INBOX_CAPACITY: usize = 64;

/// One request awaiting processing at its destination. The receiver side
/// answers by sending on `reply`; dropping it reads as a delivery failure
/// at the sender.
pub struct IncomingRpc<M: StateMachine> {
    pub from: MemberId,
    pub request: RpcRequest<M>,
    pub reply: oneshot::Sender<RpcReply>,
}

struct RoutingState<M: StateMachine> {
    routes: HashMap<MemberId, mpsc::Sender<IncomingRpc<M>>>,
    /// Severed links, stored as ordered pairs.
    blocked: BTreeSet<(MemberId, MemberId)>,
    watchers: HashMap<MemberId, watch::Sender<BTreeSet<MemberId>>>,
}

fn link(a: MemberId, b: MemberId) -> (MemberId, MemberId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

struct NetworkShared<M: StateMachine> {
    rpc_timeout: Duration,
    state: Mutex<RoutingState<M>>,
}

impl<M: StateMachine> NetworkShared<M> {
    /// Republish every member's reachable set after a topology change.
    fn republish_connectivity(&self, state: &RoutingState<M>) {
        for (&id, watcher) in &state.watchers {
            let reachable: BTreeSet<MemberId> = state
                .routes
                .keys()
                .copied()
                .filter(|&other| other != id && !state.blocked.contains(&link(id, other)))
                .collect();
            watcher.send_if_modified(|current| {
                if *current != reachable {
                    *current = reachable;
                    true
                } else {
                    false
                }
            });
        }
    }
}

/// Hub shared by every member of a simulated cluster.
#[derive(Clone)]
pub struct InMemoryNetwork<M: StateMachine> {
    shared: Arc<NetworkShared<M>>,
}

impl<M: StateMachine> InMemoryNetwork<M> {
    pub fn new() -> Self {
        Self::with_rpc_timeout(DEFAULT_RPC_TIMEOUT)
    }

    pub fn with_rpc_timeout(rpc_timeout: Duration) -> Self {
        InMemoryNetwork {
            shared: Arc::new(NetworkShared {
                rpc_timeout,
                state: Mutex::new(RoutingState {
                    routes: HashMap::new(),
                    blocked: BTreeSet::new(),
                    watchers: HashMap::new(),
                }),
            }),
        }
    }

    /// Attach a member. Returns its transport handle and the stream of
    /// requests addressed to it; the caller is responsible for serving the
    /// stream (usually by forwarding to `RaftMember::on_rpc`).
    pub fn join(&self, id: MemberId) -> (MemberTransport<M>, mpsc::Receiver<IncomingRpc<M>>) {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let mut state = self.shared.state.lock().unwrap();
        assert!(
            state.routes.insert(id, tx).is_none(),
            "member {id} joined twice"
        );
        let (watch_tx, watch_rx) = watch::channel(BTreeSet::new());
        state.watchers.insert(id, watch_tx);
        self.shared.republish_connectivity(&state);
        (
            MemberTransport {
                shared: self.shared.clone(),
                id,
                connected: watch_rx,
            },
            rx,
        )
    }

    /// Detach a member entirely (process death).
    pub fn leave(&self, id: MemberId) {
        let mut state = self.shared.state.lock().unwrap();
        state.routes.remove(&id);
        state.watchers.remove(&id);
        self.shared.republish_connectivity(&state);
    }

    /// Sever the link between two members, both directions.
    pub fn disconnect(&self, a: MemberId, b: MemberId) {
        let mut state = self.shared.state.lock().unwrap();
        state.blocked.insert(link(a, b));
        self.shared.republish_connectivity(&state);
    }

    /// Restore the link between two members.
    pub fn reconnect(&self, a: MemberId, b: MemberId) {
        let mut state = self.shared.state.lock().unwrap();
        state.blocked.remove(&link(a, b));
        self.shared.republish_connectivity(&state);
    }

    /// Sever every link touching `id`.
    pub fn isolate(&self, id: MemberId) {
        let mut state = self.shared.state.lock().unwrap();
        let others: Vec<MemberId> = state.routes.keys().copied().filter(|&o| o != id).collect();
        for other in others {
            state.blocked.insert(link(id, other));
        }
        self.shared.republish_connectivity(&state);
    }

    /// Restore every link touching `id`.
    pub fn heal(&self, id: MemberId) {
        let mut state = self.shared.state.lock().unwrap();
        state.blocked.retain(|&(a, b)| a != id && b != id);
        self.shared.republish_connectivity(&state);
    }

    /// Restore every link in the network.
    pub fn heal_all(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.blocked.clear();
        self.shared.republish_connectivity(&state);
    }
}

impl<M: StateMachine> Default for InMemoryNetwork<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// One member's handle onto the [`InMemoryNetwork`].
pub struct MemberTransport<M: StateMachine> {
    shared: Arc<NetworkShared<M>>,
    id: MemberId,
    connected: watch::Receiver<BTreeSet<MemberId>>,
}

#[async_trait]
impl<M: StateMachine> Transport<M> for MemberTransport<M> {
    async fn send_rpc(
        &self,
        dest: MemberId,
        request: RpcRequest<M>,
    ) -> Result<RpcReply, TransportError> {
        let sender = {
            let state = self.shared.state.lock().unwrap();
            let sender = state
                .routes
                .get(&dest)
                .ok_or(TransportError::UnknownMember)?;
            if state.blocked.contains(&link(self.id, dest)) {
                return Err(TransportError::Unreachable);
            }
            sender.clone()
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(IncomingRpc {
                from: self.id,
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| TransportError::Unreachable)?;

        match tokio::time::timeout(self.shared.rpc_timeout, reply_rx).await {
            Err(_) => Err(TransportError::Timeout),
            Ok(Err(_)) => Err(TransportError::Unreachable),
            Ok(Ok(reply)) => Ok(reply),
        }
    }

    fn connected_members(&self) -> watch::Receiver<BTreeSet<MemberId>> {
        self.connected.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rpc::{RequestVoteReply, RequestVoteRequest};
    use crate::state_machine::RecordingStateMachine;

    type Net = InMemoryNetwork<RecordingStateMachine>;

    fn vote_request(term: u64, candidate: MemberId) -> RpcRequest<RecordingStateMachine> {
        RpcRequest::RequestVote(RequestVoteRequest {
            term,
            candidate_id: candidate,
            last_log_index: 0,
            last_log_term: 0,
        })
    }

    #[tokio::test]
    async fn delivers_and_replies() {
        let net = Net::new();
        let a = MemberId::from_raw(1);
        let b = MemberId::from_raw(2);
        let (ta, _ra) = net.join(a);
        let (_tb, mut rb) = net.join(b);

        let send = ta.send_rpc(b, vote_request(1, a));
        let serve = async {
            let incoming = rb.recv().await.unwrap();
            assert_eq!(incoming.from, a);
            let _ = incoming.reply.send(RpcReply::RequestVote(RequestVoteReply {
                term: 1,
                vote_granted: true,
            }));
        };
        let (reply, ()) = tokio::join!(send, serve);
        assert_eq!(
            reply.unwrap(),
            RpcReply::RequestVote(RequestVoteReply {
                term: 1,
                vote_granted: true
            })
        );
    }

    #[tokio::test]
    async fn unknown_member_is_an_error() {
        let net = Net::new();
        let a = MemberId::from_raw(1);
        let (ta, _ra) = net.join(a);
        let reply = ta.send_rpc(MemberId::from_raw(9), vote_request(1, a)).await;
        assert_eq!(reply, Err(TransportError::UnknownMember));
    }

    #[tokio::test]
    async fn partition_blocks_and_updates_connectivity() {
        let net = Net::new();
        let a = MemberId::from_raw(1);
        let b = MemberId::from_raw(2);
        let (ta, _ra) = net.join(a);
        let (_tb, _rb) = net.join(b);

        assert!(ta.connected_members().borrow().contains(&b));
        net.disconnect(a, b);
        assert!(!ta.connected_members().borrow().contains(&b));
        assert_eq!(
            ta.send_rpc(b, vote_request(1, a)).await,
            Err(TransportError::Unreachable)
        );

        net.reconnect(a, b);
        assert!(ta.connected_members().borrow().contains(&b));
    }

    #[tokio::test]
    async fn isolate_and_heal_affect_every_link() {
        let net = Net::new();
        let ids: Vec<MemberId> = (1..=3).map(MemberId::from_raw).collect();
        let (ta, _ra) = net.join(ids[0]);
        let (_tb, _rb) = net.join(ids[1]);
        let (_tc, _rc) = net.join(ids[2]);

        net.isolate(ids[0]);
        assert!(ta.connected_members().borrow().is_empty());
        net.heal(ids[0]);
        assert_eq!(ta.connected_members().borrow().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unserved_request_times_out() {
        let net = Net::with_rpc_timeout(Duration::from_millis(100));
        let a = MemberId::from_raw(1);
        let b = MemberId::from_raw(2);
        let (ta, _ra) = net.join(a);
        let (_tb, _rb) = net.join(b);

        let reply = ta
            .send_rpc(
                b,
                RpcRequest::StepDown(crate::core::rpc::StepDownRequest {
                    term: 1,
                    leader_id: a,
                }),
            )
            .await;
        assert_eq!(reply, Err(TransportError::Timeout));
    }
}
