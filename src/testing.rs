//! Testing utilities: an in-process cluster harness
//!
//! `TestCluster` spins up members over the in-memory network and storage,
//! serves their RPC inboxes, and offers the wait/partition helpers the
//! integration tests are written with. Works best under paused tokio time
//! (`#[tokio::test(start_paused = true)]`), where the second-scale election
//! timeouts cost nothing in wall-clock terms.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::core::{
    check_invariants, ChangeToken, ClusterConfig, MemberId, PersistentState, RaftConfig,
    RaftMember, Role, StateAndConfig, Term,
};
use crate::state_machine::{KvChange, KvStore};
use crate::storage::MemoryStorage;
use crate::transport::inmemory::{InMemoryNetwork, IncomingRpc, MemberTransport};

type ClusterMember = RaftMember<KvStore, MemoryStorage<KvStore>, MemberTransport<KvStore>>;

/// How long the wait helpers poll before declaring failure.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

struct TestMember {
    member: ClusterMember,
    rpc_task: JoinHandle<()>,
}

/// An in-process cluster of key-value members.
pub struct TestCluster {
    config: RaftConfig,
    network: InMemoryNetwork<KvStore>,
    members: BTreeMap<MemberId, TestMember>,
    next_raw_id: u128,
    /// Leaders observed per term, for the Election Safety property.
    leaders_seen: Arc<Mutex<BTreeMap<Term, MemberId>>>,
}

impl TestCluster {
    /// A fresh cluster of `count` voting members with default timing.
    pub async fn new(count: usize) -> Self {
        Self::with_config(count, RaftConfig::default()).await
    }

    pub async fn with_config(count: usize, config: RaftConfig) -> Self {
        let ids: Vec<MemberId> = (1..=count as u128).map(MemberId::from_raw).collect();
        let initial_config = ClusterConfig::new(ids.iter().copied());
        let network = InMemoryNetwork::new();

        let mut members = BTreeMap::new();
        for &id in &ids {
            let (transport, inbox) = network.join(id);
            let member = RaftMember::spawn(
                id,
                MemoryStorage::new(),
                transport,
                PersistentState::make_initial(KvStore::new(), initial_config.clone()),
                config.clone(),
            );
            let rpc_task = tokio::spawn(serve_rpcs(member.clone(), inbox));
            members.insert(id, TestMember { member, rpc_task });
        }

        TestCluster {
            config,
            network,
            members,
            next_raw_id: count as u128 + 1,
            leaders_seen: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn ids(&self) -> Vec<MemberId> {
        self.members.keys().copied().collect()
    }

    pub fn member(&self, id: MemberId) -> &ClusterMember {
        &self.members.get(&id).expect("unknown member").member
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    /// Join a brand-new member, initialized from an existing member's
    /// `get_state_for_init`, and start serving it. The new member is not
    /// part of the voting configuration until a config change adds it.
    pub async fn add_member(&mut self) -> MemberId {
        let id = MemberId::from_raw(self.next_raw_id);
        self.next_raw_id += 1;
        let seed = self
            .members
            .values()
            .next()
            .expect("cluster is not empty")
            .member
            .get_state_for_init()
            .await;
        let (transport, inbox) = self.network.join(id);
        let member = RaftMember::spawn(id, MemoryStorage::new(), transport, seed, self.config.clone());
        let rpc_task = tokio::spawn(serve_rpcs(member.clone(), inbox));
        self.members.insert(id, TestMember { member, rpc_task });
        id
    }

    /// Kill a member outright: detach it from the network and stop it.
    pub async fn stop_member(&mut self, id: MemberId) {
        let entry = self.members.remove(&id).expect("unknown member");
        self.network.leave(id);
        entry.rpc_task.abort();
        entry.member.shutdown().await;
    }

    // ---- partition control ------------------------------------------

    /// Cut `group` off from the rest of the cluster (both directions).
    pub fn partition(&self, group: &[MemberId]) {
        for &a in group {
            for b in self.ids() {
                if !group.contains(&b) {
                    self.network.disconnect(a, b);
                }
            }
        }
    }

    pub fn isolate(&self, id: MemberId) {
        self.network.isolate(id);
    }

    pub fn heal(&self, id: MemberId) {
        self.network.heal(id);
    }

    pub fn heal_all(&self) {
        self.network.heal_all();
    }

    // ---- observation -----------------------------------------------

    /// Record current leaders for the Election Safety property. Panics if
    /// two different members were ever seen leading the same term.
    pub async fn observe_leaders(&self) {
        for entry in self.members.values() {
            let status = entry.member.status().await;
            if status.role == Role::Leader {
                let mut seen = self.leaders_seen.lock().unwrap();
                let previous = seen.insert(status.term, entry.member.id());
                if let Some(previous) = previous {
                    assert_eq!(
                        previous,
                        entry.member.id(),
                        "two leaders observed for term {}",
                        status.term
                    );
                }
            }
        }
    }

    /// The member currently ready for changes, if any.
    pub async fn current_leader(&self) -> Option<MemberId> {
        self.observe_leaders().await;
        for entry in self.members.values() {
            if *entry.member.readiness_for_change().borrow() {
                return Some(entry.member.id());
            }
        }
        None
    }

    /// Wait until some member reports readiness for changes.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<MemberId> {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if let Some(leader) = self.current_leader().await {
                return Some(leader);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        None
    }

    /// Wait for a ready leader among `candidates`.
    pub async fn wait_for_leader_among(
        &self,
        candidates: &[MemberId],
        timeout: Duration,
    ) -> Option<MemberId> {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if let Some(leader) = self.current_leader().await {
                if candidates.contains(&leader) {
                    return Some(leader);
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        None
    }

    /// Wait until `predicate` holds for every listed member's committed
    /// view.
    pub async fn wait_for_committed(
        &self,
        members: &[MemberId],
        timeout: Duration,
        predicate: impl Fn(&StateAndConfig<KvStore>) -> bool,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let all = {
                let mut all = true;
                for id in members {
                    let view = self.member(*id).committed_view().borrow().clone();
                    if !predicate(&view) {
                        all = false;
                        break;
                    }
                }
                all
            };
            if all {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            self.observe_leaders().await;
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait until every listed member's committed state holds
    /// `key == value`.
    pub async fn wait_for_value(
        &self,
        members: &[MemberId],
        key: &str,
        value: &str,
        timeout: Duration,
    ) -> bool {
        self.wait_for_committed(members, timeout, |view| view.state.get(key) == Some(value))
            .await
    }

    // ---- proposals --------------------------------------------------

    /// Propose `key = value` through `id`. Returns the change token, or
    /// `None` when that member would not accept it.
    pub async fn propose(&self, id: MemberId, key: &str, value: &str) -> Option<ChangeToken> {
        let member = self.member(id);
        let mut lock = member.change_lock().await;
        member
            .propose_change(&mut lock, KvChange::set(key, value))
            .await
            .expect("member lost")
    }

    /// Propose a new voting configuration through `id`.
    pub async fn propose_config(
        &self,
        id: MemberId,
        voting: &[MemberId],
    ) -> Option<ChangeToken> {
        let member = self.member(id);
        let mut lock = member.change_lock().await;
        member
            .propose_config_change(&mut lock, ClusterConfig::new(voting.iter().copied()))
            .await
            .expect("member lost")
    }

    // ---- verification ----------------------------------------------

    /// Run the structural invariant checker across the whole cluster.
    pub async fn check_invariants(&self) {
        let members: Vec<&ClusterMember> =
            self.members.values().map(|entry| &entry.member).collect();
        check_invariants(&members).await;
        self.observe_leaders().await;
    }

    pub async fn shutdown(self) {
        for (_, entry) in self.members {
            entry.rpc_task.abort();
            entry.member.shutdown().await;
        }
    }
}

/// Forward every inbound RPC to the member until the inbox closes.
async fn serve_rpcs(member: ClusterMember, mut inbox: tokio::sync::mpsc::Receiver<IncomingRpc<KvStore>>) {
    while let Some(incoming) = inbox.recv().await {
        match member.on_rpc(incoming.request).await {
            Ok(reply) => {
                let _ = incoming.reply.send(reply);
            }
            Err(_) => {
                // A lost member answers nothing; the sender sees a
                // delivery failure.
            }
        }
    }
}
