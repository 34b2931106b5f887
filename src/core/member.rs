//! The per-member consensus engine
//!
//! `RaftMember` manages one member of the cluster: term and vote state,
//! the log and snapshot, the follower/candidate/leader mode machine, the
//! RPC handlers, and the client proposal path. It follows the Raft paper
//! (Ongaro & Ousterhout, 2014) closely; section references below are to
//! the paper.
//!
//! A single mutex serializes every externally visible mutation. RPC
//! handlers hold it for their whole run (one RPC at a time per member);
//! the election & leader task and the per-peer replication subtasks hold
//! it for their critical sections and release it while waiting on the
//! network or on timers. Persistence always completes before any action
//! that depends on it: a vote is durable before it is granted, a term
//! bump before it is acknowledged, appended entries before they are
//! confirmed.
//!
//! One deviation from the paper: leader-failure detection leans primarily
//! on the transport's connection liveness rather than on heartbeat loss,
//! so a leader that stops leading without dropping connections announces
//! it with a StepDown RPC. Low-rate empty AppendEntries still flow so
//! followers do not depend on transport-specific timeouts.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::{watch, Mutex, MutexGuard, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::core::change::{ChangeRegistry, ChangeToken, PendingChange};
use crate::core::config::RaftConfig;
use crate::core::rpc::{
    AppendEntriesReply, AppendEntriesRequest, InstallSnapshotReply, InstallSnapshotRequest,
    RequestVoteReply, RequestVoteRequest, RpcReply, RpcRequest, StepDownReply, StepDownRequest,
};
use crate::core::types::{
    ClusterConfig, EntryPayload, JointConfig, LogEntry, LogIndex, MemberId, PersistentState,
    StateAndConfig, Term,
};
use crate::state_machine::StateMachine;
use crate::storage::{Storage, StorageError};
use crate::transport::Transport;

/// Why a public operation could not run.
#[derive(Debug, Error)]
pub enum MemberError {
    /// Writing persistent state failed. The member is lost; destroy it.
    #[error("persistent storage failed: {0}")]
    Storage(#[from] StorageError),
    /// A previous failure already poisoned this member.
    #[error("member has failed and must be destroyed")]
    Lost,
}

/// Coarse view of a member's mode, for observation only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Point-in-time observability snapshot of one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberStatus {
    pub term: Term,
    pub role: Role,
    pub commit_index: LogIndex,
    pub latest_index: LogIndex,
    /// The member believed to lead `term`, if any was seen.
    pub leader: Option<MemberId>,
}

/// The paper's follower state, split on whether a live leader is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    FollowerLed,
    FollowerUnled,
    Candidate,
    Leader,
}

/// When we last had evidence of a live leader or candidate.
#[derive(Debug, Clone, Copy)]
enum LeaderPresence {
    /// A leader exists right now (we are led, or we are the leader).
    Current,
    /// No live leader since this instant; election timeouts count from it.
    AbsentSince(Instant),
}

/// Cancellation plumbing for the long-running tasks. The sender half lives
/// in [`MemberState`]; signalling it and awaiting the join handle is how
/// a task is stopped deterministically.
struct TaskHandle {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    async fn stop(self) {
        let _ = self.cancel.send(true);
        let _ = self.handle.await;
    }
}

#[derive(Clone)]
struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    fn new() -> (watch::Sender<bool>, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (tx, CancelSignal { rx })
    }

    async fn cancelled(&mut self) {
        // A dropped sender also reads as cancellation.
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Everything guarded by the member mutex.
pub(crate) struct MemberState<M: StateMachine> {
    pub(crate) ps: PersistentState<M>,
    pub(crate) mode: Mode,
    /// The member seen leading `current_term`, if any.
    pub(crate) current_term_leader: Option<MemberId>,
    /// True once the term's leader stepped down or disconnected; later
    /// AppendEntries from it are still processed but no longer count as
    /// evidence of a live leader.
    leader_invalidated: bool,
    last_leader_seen: LeaderPresence,
    /// Per-member replication progress. Non-empty only on a leader.
    pub(crate) match_index: BTreeMap<MemberId, LogIndex>,
    pub(crate) changes: ChangeRegistry,
    election_task: Option<TaskHandle>,
    connectivity_task: Option<TaskHandle>,
    failed: bool,
}

pub(crate) struct MemberInner<M: StateMachine, S, N> {
    pub(crate) id: MemberId,
    config: RaftConfig,
    storage: S,
    network: N,
    pub(crate) state: Arc<Mutex<MemberState<M>>>,
    pub(crate) committed: watch::Sender<StateAndConfig<M>>,
    pub(crate) latest: watch::Sender<StateAndConfig<M>>,
    ready_change: watch::Sender<bool>,
    ready_config_change: watch::Sender<bool>,
}

/// Scoped exclusive hold on a member, taken before proposing.
///
/// While a `ChangeLock` exists the member processes no RPCs, so the latest
/// view cannot change except through proposals made under this lock. It is
/// safe to block while holding one, but holding it for long stalls the
/// member.
pub struct ChangeLock<M: StateMachine> {
    owner: MemberId,
    guard: OwnedMutexGuard<MemberState<M>>,
}

/// One member of the cluster. Cheap to clone; all clones drive the same
/// member.
///
/// Call [`RaftMember::shutdown`] when done: it stops the election/leader
/// task and every replication subtask and waits for them to exit. A member
/// whose public operation was cancelled (its future dropped midway) or
/// that returned [`MemberError`] is only usable for shutdown.
pub struct RaftMember<M: StateMachine, S: Storage<M>, N: Transport<M>> {
    pub(crate) inner: Arc<MemberInner<M, S, N>>,
}

impl<M: StateMachine, S: Storage<M>, N: Transport<M>> Clone for RaftMember<M, S, N> {
    fn clone(&self) -> Self {
        RaftMember {
            inner: self.inner.clone(),
        }
    }
}

impl<M, S, N> RaftMember<M, S, N>
where
    M: StateMachine,
    S: Storage<M>,
    N: Transport<M>,
{
    /// Bring up a member from a restored (or freshly initialized)
    /// persistent record. The record must be the one storage would have
    /// returned after the last shutdown; see
    /// [`PersistentState::make_initial`] for founding members.
    pub fn spawn(id: MemberId, storage: S, network: N, state: PersistentState<M>, config: RaftConfig) -> Self {
        // Entries above the snapshot are not known committed after a
        // restart, so the committed view starts at the snapshot and grows
        // back as the leader tells us.
        let committed_view = StateAndConfig {
            log_index: state.log.prev_index,
            state: state.snapshot_state.clone(),
            config: state.snapshot_config.clone(),
        };
        let mut latest_view = committed_view.clone();
        if state.log.latest_index() > state.log.prev_index {
            latest_view.apply_entries(
                &state.log,
                state.log.prev_index + 1,
                state.log.latest_index(),
            );
        }

        let inner = Arc::new(MemberInner {
            id,
            config,
            storage,
            network,
            state: Arc::new(Mutex::new(MemberState {
                ps: state,
                mode: Mode::FollowerUnled,
                current_term_leader: None,
                leader_invalidated: false,
                last_leader_seen: LeaderPresence::AbsentSince(Instant::now()),
                match_index: BTreeMap::new(),
                changes: ChangeRegistry::default(),
                election_task: None,
                connectivity_task: None,
                failed: false,
            })),
            committed: watch::channel(committed_view).0,
            latest: watch::channel(latest_view).0,
            ready_change: watch::channel(false).0,
            ready_config_change: watch::channel(false).0,
        });

        {
            let mut st = inner
                .state
                .try_lock()
                .expect("nothing can hold a freshly built member");
            inner.start_election_task(&mut st);
            let (cancel_tx, cancel) = CancelSignal::new();
            let task = tokio::spawn(inner.clone().connectivity_task(cancel));
            st.connectivity_task = Some(TaskHandle {
                cancel: cancel_tx,
                handle: task,
            });
        }

        info!(member = %id, "member started");
        RaftMember { inner }
    }

    /// Stop every background task and wait for them to exit.
    pub async fn shutdown(self) {
        let (election, connectivity) = {
            let mut st = self.inner.state.lock().await;
            (st.election_task.take(), st.connectivity_task.take())
        };
        if let Some(task) = election {
            task.stop().await;
        }
        if let Some(task) = connectivity {
            task.stop().await;
        }
        info!(member = %self.inner.id, "member shut down");
    }

    pub fn id(&self) -> MemberId {
        self.inner.id
    }

    /// State with every committed entry applied, as an observable.
    pub fn committed_view(&self) -> watch::Receiver<StateAndConfig<M>> {
        self.inner.committed.subscribe()
    }

    /// State with every log entry applied, committed or not. This is the
    /// view configuration lookups and proposal pre-flight use.
    pub fn latest_view(&self) -> watch::Receiver<StateAndConfig<M>> {
        self.inner.latest.subscribe()
    }

    /// True while this member is leader and in contact with a quorum;
    /// proposals made then will probably (not certainly) succeed.
    pub fn readiness_for_change(&self) -> watch::Receiver<bool> {
        self.inner.ready_change.subscribe()
    }

    /// As [`readiness_for_change`](Self::readiness_for_change), and
    /// additionally no reconfiguration is in flight.
    pub fn readiness_for_config_change(&self) -> watch::Receiver<bool> {
        self.inner.ready_config_change.subscribe()
    }

    /// A persistent record a fresh member could join the cluster with:
    /// the committed state as its snapshot and an empty log.
    pub async fn get_state_for_init(&self) -> PersistentState<M> {
        let st = self.inner.state.lock().await;
        let committed = self.inner.committed.borrow().clone();
        PersistentState {
            current_term: st.ps.current_term,
            voted_for: None,
            snapshot_state: committed.state,
            snapshot_config: committed.config,
            log: crate::core::log::LogSlice::new(
                committed.log_index,
                st.ps.log.entry_term(committed.log_index),
            ),
        }
    }

    /// Observability snapshot; used by tests and operators.
    pub async fn status(&self) -> MemberStatus {
        let st = self.inner.state.lock().await;
        MemberStatus {
            term: st.ps.current_term,
            role: match st.mode {
                Mode::FollowerLed | Mode::FollowerUnled => Role::Follower,
                Mode::Candidate => Role::Candidate,
                Mode::Leader => Role::Leader,
            },
            commit_index: self.inner.committed.borrow().log_index,
            latest_index: st.ps.log.latest_index(),
            leader: st.current_term_leader,
        }
    }

    /// Handle an RPC delivered by the transport and produce its reply.
    pub async fn on_rpc(&self, request: RpcRequest<M>) -> Result<RpcReply, MemberError> {
        match request {
            RpcRequest::RequestVote(req) => self
                .inner
                .on_request_vote(req)
                .await
                .map(RpcReply::RequestVote),
            RpcRequest::AppendEntries(req) => self
                .inner
                .on_append_entries(req)
                .await
                .map(RpcReply::AppendEntries),
            RpcRequest::InstallSnapshot(req) => self
                .inner
                .on_install_snapshot(req)
                .await
                .map(RpcReply::InstallSnapshot),
            RpcRequest::StepDown(req) => {
                self.inner.on_step_down(req).await.map(RpcReply::StepDown)
            }
        }
    }

    /// Freeze the member for proposing. See [`ChangeLock`].
    pub async fn change_lock(&self) -> ChangeLock<M> {
        ChangeLock {
            owner: self.inner.id,
            guard: self.inner.state.clone().lock_owned().await,
        }
    }

    /// Propose an application change. Returns `None` when this member is
    /// not a ready leader; the caller should find one via
    /// [`readiness_for_change`](Self::readiness_for_change).
    pub async fn propose_change(
        &self,
        lock: &mut ChangeLock<M>,
        change: M::Change,
    ) -> Result<Option<ChangeToken>, MemberError> {
        assert_eq!(lock.owner, self.inner.id, "change lock from another member");
        let st = &mut *lock.guard;
        if st.failed {
            return Err(MemberError::Lost);
        }
        if !self.inner.change_ready(st) {
            return Ok(None);
        }
        let entry = LogEntry {
            term: st.ps.current_term,
            payload: EntryPayload::Change(change),
        };
        let index = self.inner.leader_append(st, entry).await?;
        let (pending, token) = PendingChange::pair(false);
        st.changes.register(index, pending);
        // The append itself can complete the commit (a quorum of one);
        // settle the token right away in that case.
        st.changes
            .resolve_committed(self.inner.committed.borrow().log_index);
        debug!(member = %self.inner.id, index, "change proposed");
        Ok(Some(token))
    }

    /// Propose a new voting configuration. The cluster passes through a
    /// joint phase first (§6); the second, transition-completing entry is
    /// appended by the leader once the joint entry commits. Returns `None`
    /// when this member is not a ready leader or a reconfiguration is
    /// already in flight.
    pub async fn propose_config_change(
        &self,
        lock: &mut ChangeLock<M>,
        new_config: ClusterConfig,
    ) -> Result<Option<ChangeToken>, MemberError> {
        assert_eq!(lock.owner, self.inner.id, "change lock from another member");
        let st = &mut *lock.guard;
        if st.failed {
            return Err(MemberError::Lost);
        }
        let latest_config = self.inner.latest.borrow().config.clone();
        // Refuse while any reconfiguration is in flight: a joint latest
        // view means phase 1 is pending, a joint committed view means the
        // phase-2 entry has not committed yet. Accepting in the second
        // window would layer a new transition on top of an uncommitted
        // one.
        if !self.inner.change_ready(st)
            || latest_config.is_joint()
            || self.inner.committed.borrow().config.is_joint()
        {
            return Ok(None);
        }
        let joint = JointConfig {
            current: latest_config.current,
            next: Some(new_config),
        };
        let entry = LogEntry {
            term: st.ps.current_term,
            payload: EntryPayload::Config(joint),
        };
        let index = self.inner.leader_append(st, entry).await?;
        let (pending, token) = PendingChange::pair(true);
        st.changes.register(index, pending);
        st.changes
            .resolve_committed(self.inner.committed.borrow().log_index);
        info!(member = %self.inner.id, index, "configuration change proposed");
        Ok(Some(token))
    }

    /// Fold every committed entry into the snapshot and drop the covered
    /// log prefix. When to call this is the caller's retention policy.
    pub async fn take_snapshot(&self) -> Result<(), MemberError> {
        let mut guard = self.inner.state.lock().await;
        let st = &mut *guard;
        if st.failed {
            return Err(MemberError::Lost);
        }
        let committed = self.inner.committed.borrow().clone();
        if committed.log_index <= st.ps.log.prev_index {
            return Ok(());
        }
        st.ps.log.compact_to(committed.log_index);
        st.ps.snapshot_state = committed.state;
        st.ps.snapshot_config = committed.config;
        self.inner.persist(st).await?;
        info!(
            member = %self.inner.id,
            through = committed.log_index,
            "log compacted into snapshot"
        );
        Ok(())
    }
}

/// Outcome of one candidacy (§5.2).
enum CandidateOutcome {
    Elected,
    Defeated,
    Cancelled,
}

/// Why the leader phase ended.
enum LeaderOutcome {
    SteppedDown,
    Cancelled,
}

/// What a replication subtask decided to send next.
enum ReplicationStep<M: StateMachine> {
    Append(AppendEntriesRequest<M>, LogIndex),
    Snapshot(InstallSnapshotRequest<M>),
    Idle,
}

impl<M, S, N> MemberInner<M, S, N>
where
    M: StateMachine,
    S: Storage<M>,
    N: Transport<M>,
{
    // ------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------

    async fn lock_or_cancelled(
        &self,
        cancel: &mut CancelSignal,
    ) -> Option<MutexGuard<'_, MemberState<M>>> {
        tokio::select! {
            guard = self.state.lock() => Some(guard),
            _ = cancel.cancelled() => None,
        }
    }

    /// Flush `ps` to stable storage. Failure poisons the member.
    async fn persist(&self, st: &mut MemberState<M>) -> Result<(), MemberError> {
        if let Err(e) = self.storage.write_persistent_state(&st.ps).await {
            st.failed = true;
            st.changes.fail_all();
            error!(member = %self.id, error = %e, "persistent state write failed; member is lost");
            return Err(MemberError::Storage(e));
        }
        Ok(())
    }

    /// Enter `new_term` and reset all per-term tracking. The caller is
    /// responsible for persisting afterwards.
    fn update_term(&self, st: &mut MemberState<M>, new_term: Term) {
        debug_assert!(new_term > st.ps.current_term);
        st.ps.current_term = new_term;
        st.ps.voted_for = None;
        st.current_term_leader = None;
        st.leader_invalidated = false;
        // No leader is known for the new term yet; the election timer must
        // be armed unless evidence of one arrives (note_leader re-marks).
        if matches!(st.last_leader_seen, LeaderPresence::Current) {
            st.last_leader_seen = LeaderPresence::AbsentSince(Instant::now());
        }
    }

    /// Whether this member would accept a proposal right now.
    fn change_ready(&self, st: &MemberState<M>) -> bool {
        if st.mode != Mode::Leader {
            return false;
        }
        let mut reachable = self.network.connected_members().borrow().clone();
        reachable.insert(self.id);
        self.latest.borrow().config.is_quorum(&reachable)
    }

    fn update_readiness(&self, st: &MemberState<M>) {
        let ready = self.change_ready(st);
        // A reconfiguration is in flight from the moment the joint entry
        // is appended until the plain phase-2 entry *commits*. The latest
        // view alone cannot tell: it turns non-joint as soon as phase 2 is
        // appended, while the committed view stays joint until then.
        let ready_config = ready
            && !self.latest.borrow().config.is_joint()
            && !self.committed.borrow().config.is_joint();
        self.ready_change.send_if_modified(|v| {
            if *v != ready {
                *v = ready;
                true
            } else {
                false
            }
        });
        self.ready_config_change.send_if_modified(|v| {
            if *v != ready_config {
                *v = ready_config;
                true
            } else {
                false
            }
        });
    }

    /// Republish the latest view after entries were appended up to
    /// `latest_index`.
    fn extend_latest_view(&self, st: &MemberState<M>, latest_index: LogIndex) {
        let mut view = self.latest.borrow().clone();
        if latest_index > view.log_index {
            view.apply_entries(&st.ps.log, view.log_index + 1, latest_index);
            self.latest.send_replace(view);
        }
    }

    /// Rebuild the latest view from the committed view; needed after a
    /// truncation invalidated the previous value.
    fn rebuild_latest_view(&self, st: &MemberState<M>) {
        let mut view = self.committed.borrow().clone();
        if st.ps.log.latest_index() > view.log_index {
            view.apply_entries(&st.ps.log, view.log_index + 1, st.ps.log.latest_index());
        }
        self.latest.send_replace(view);
    }

    /// Advance the commit index to `new_commit`, applying the newly
    /// committed entries and resolving their change tokens.
    fn update_commit_index(&self, st: &mut MemberState<M>, new_commit: LogIndex) {
        let mut view = self.committed.borrow().clone();
        debug_assert!(new_commit > view.log_index);
        view.apply_entries(&st.ps.log, view.log_index + 1, new_commit);
        self.committed.send_replace(view);
        st.changes.resolve_committed(new_commit);
    }

    /// Largest `N` such that a quorum matches at `>= N` and the entry at
    /// `N` carries the current term (§5.4.2). Earlier entries commit
    /// transitively.
    fn try_advance_commit(&self, st: &mut MemberState<M>) {
        let config = self.latest.borrow().config.clone();
        let commit = self.committed.borrow().log_index;
        for n in (commit + 1..=st.ps.log.latest_index()).rev() {
            if st.ps.log.entry_term(n) < st.ps.current_term {
                break;
            }
            let agree = st
                .match_index
                .iter()
                .filter(|&(_, &matched)| matched >= n)
                .map(|(&member, _)| member)
                .collect();
            if config.is_quorum(&agree) {
                debug!(member = %self.id, commit = n, "commit index advanced");
                self.update_commit_index(st, n);
                return;
            }
        }
    }

    /// Append one entry as leader: log, persist, views, own match index.
    async fn leader_append(
        &self,
        st: &mut MemberState<M>,
        entry: LogEntry<M>,
    ) -> Result<LogIndex, MemberError> {
        debug_assert_eq!(st.mode, Mode::Leader);
        debug_assert_eq!(entry.term, st.ps.current_term);
        st.ps.log.append(entry);
        let index = st.ps.log.latest_index();
        self.persist(st).await?;
        self.extend_latest_view(st, index);
        if let Some(own) = st.match_index.get_mut(&self.id) {
            *own = index;
        }
        self.try_advance_commit(st);
        self.update_readiness(st);
        Ok(index)
    }

    /// Stop the election & leader task and wait for it to exit, cleaning
    /// up leader state if we were leading. Leaves the mode at
    /// `FollowerUnled`; the caller must either move to `FollowerLed` or
    /// start a fresh task before releasing the mutex.
    async fn stop_election_task(self: &Arc<Self>, st: &mut MemberState<M>) {
        let was_leader = st.mode == Mode::Leader;
        if let Some(task) = st.election_task.take() {
            // The task's every suspension races its cancel signal, and it
            // never needs this mutex after the signal fires, so awaiting
            // it while holding the mutex terminates.
            task.stop().await;
        }
        if was_leader {
            self.leader_cleanup(st);
        }
        st.mode = Mode::FollowerUnled;
        self.update_readiness(st);
    }

    /// Shed leader-only state: fail outstanding tokens, clear match
    /// indexes, tell the others asynchronously.
    fn leader_cleanup(self: &Arc<Self>, st: &mut MemberState<M>) {
        info!(member = %self.id, term = st.ps.current_term, "stepping down");
        st.changes.fail_all();
        st.match_index.clear();
        let request = StepDownRequest {
            term: st.ps.current_term,
            leader_id: self.id,
        };
        for peer in self.latest.borrow().config.all_members() {
            if peer == self.id {
                continue;
            }
            let inner = self.clone();
            let request = request.clone();
            tokio::spawn(async move {
                let _ = inner
                    .network
                    .send_rpc(peer, RpcRequest::StepDown(request))
                    .await;
            });
        }
    }

    fn start_election_task(self: &Arc<Self>, st: &mut MemberState<M>) {
        debug_assert!(st.election_task.is_none());
        let (cancel_tx, cancel) = CancelSignal::new();
        let inner = self.clone();
        let handle = tokio::spawn(async move { inner.election_and_leader_task(cancel).await });
        st.election_task = Some(TaskHandle {
            cancel: cancel_tx,
            handle,
        });
    }

    #[cfg(debug_assertions)]
    fn assert_local_invariants(&self, st: &MemberState<M>) {
        let committed_index = self.committed.borrow().log_index;
        let latest_index = self.latest.borrow().log_index;
        assert!(committed_index >= st.ps.log.prev_index);
        assert!(committed_index <= latest_index);
        assert_eq!(latest_index, st.ps.log.latest_index());
        if st.mode != Mode::Leader {
            assert!(st.match_index.is_empty());
            assert!(st.changes.is_empty());
        }
    }

    #[cfg(not(debug_assertions))]
    fn assert_local_invariants(&self, _st: &MemberState<M>) {}

    // ------------------------------------------------------------------
    // RPC handlers
    // ------------------------------------------------------------------

    /// Common prologue: a greater term is adopted before the request is
    /// processed (§5.1). Returns whether persistent state was touched.
    async fn adopt_term_if_newer(self: &Arc<Self>, st: &mut MemberState<M>, term: Term) -> bool {
        if term <= st.ps.current_term {
            return false;
        }
        debug!(member = %self.id, term, "adopting newer term");
        self.stop_election_task(st).await;
        self.update_term(st, term);
        true
    }

    /// Record evidence of `leader_id` leading the current term, moving to
    /// `FollowerLed` unless that leader was invalidated this term.
    async fn note_leader(self: &Arc<Self>, st: &mut MemberState<M>, leader_id: MemberId) {
        if st.current_term_leader.is_none() {
            st.current_term_leader = Some(leader_id);
        }
        if st.current_term_leader != Some(leader_id) {
            // A second id claiming the same term; elections forbid it, so
            // treat the evidence as unusable and drop any led status.
            warn!(member = %self.id, %leader_id, "conflicting leader claim for current term");
            if st.mode == Mode::FollowerLed {
                st.mode = Mode::FollowerUnled;
                st.last_leader_seen = LeaderPresence::AbsentSince(Instant::now());
                self.start_election_task(st);
            }
            return;
        }
        if st.leader_invalidated {
            // Entries are still integrated, but an invalidated leader is
            // not evidence that a live one exists.
            return;
        }
        if st.mode != Mode::FollowerLed {
            self.stop_election_task(st).await;
            st.mode = Mode::FollowerLed;
            info!(member = %self.id, leader = %leader_id, term = st.ps.current_term, "following leader");
        }
        st.last_leader_seen = LeaderPresence::Current;
    }

    async fn on_request_vote(
        self: &Arc<Self>,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteReply, MemberError> {
        let mut guard = self.state.lock().await;
        let st = &mut *guard;
        if st.failed {
            return Err(MemberError::Lost);
        }

        let mut dirty = false;
        if self.adopt_term_if_newer(st, req.term).await {
            dirty = true;
            self.start_election_task(st);
        }
        if req.term < st.ps.current_term {
            debug!(member = %self.id, candidate = %req.candidate_id, "refusing vote for stale term");
            return Ok(RequestVoteReply {
                term: st.ps.current_term,
                vote_granted: false,
            });
        }

        // Vote-once per term, eligibility, and the up-to-date check
        // (§5.2, §5.4.1): a higher last term wins; at equal terms the
        // longer log wins.
        let eligible = self.latest.borrow().config.is_valid_leader(req.candidate_id);
        let can_vote = st.ps.voted_for.is_none_or(|v| v == req.candidate_id);
        let up_to_date = (req.last_log_term, req.last_log_index)
            >= (st.ps.log.latest_term(), st.ps.log.latest_index());
        let vote_granted = eligible && can_vote && up_to_date;
        if vote_granted {
            st.ps.voted_for = Some(req.candidate_id);
            dirty = true;
            if let LeaderPresence::AbsentSince(_) = st.last_leader_seen {
                st.last_leader_seen = LeaderPresence::AbsentSince(Instant::now());
            }
            info!(member = %self.id, candidate = %req.candidate_id, term = req.term, "vote granted");
        } else {
            debug!(
                member = %self.id,
                candidate = %req.candidate_id,
                eligible,
                can_vote,
                up_to_date,
                "vote refused"
            );
        }

        if dirty {
            self.persist(st).await?;
        }
        self.assert_local_invariants(st);
        Ok(RequestVoteReply {
            term: st.ps.current_term,
            vote_granted,
        })
    }

    async fn on_append_entries(
        self: &Arc<Self>,
        req: AppendEntriesRequest<M>,
    ) -> Result<AppendEntriesReply, MemberError> {
        let mut guard = self.state.lock().await;
        let st = &mut *guard;
        if st.failed {
            return Err(MemberError::Lost);
        }

        let mut dirty = self.adopt_term_if_newer(st, req.term).await;
        if req.term < st.ps.current_term {
            debug!(member = %self.id, leader = %req.leader_id, "refusing AppendEntries from stale term");
            return Ok(AppendEntriesReply {
                term: st.ps.current_term,
                success: false,
            });
        }
        self.note_leader(st, req.leader_id).await;

        // Consistency check (§5.3). A slice based below our snapshot can
        // still be matched at the snapshot boundary: everything at or
        // before it is committed, hence identical.
        let slice = &req.entries;
        let our_prev = st.ps.log.prev_index;
        let matched_at = if slice.prev_index >= our_prev {
            if slice.prev_index <= st.ps.log.latest_index()
                && st.ps.log.entry_term(slice.prev_index) == slice.prev_term
            {
                Some(slice.prev_index)
            } else {
                None
            }
        } else if slice.latest_index() >= our_prev {
            (slice.entry_term(our_prev) == st.ps.log.prev_term).then_some(our_prev)
        } else {
            // The whole slice is folded into our snapshot already.
            Some(slice.latest_index())
        };
        let Some(matched_at) = matched_at else {
            if dirty {
                self.persist(st).await?;
            }
            debug!(
                member = %self.id,
                prev_index = slice.prev_index,
                prev_term = slice.prev_term,
                "AppendEntries consistency check failed"
            );
            self.assert_local_invariants(st);
            return Ok(AppendEntriesReply {
                term: st.ps.current_term,
                success: false,
            });
        };

        // Integrate: keep entries whose terms already match, truncate at
        // the first conflict, append the rest (§5.3).
        let mut truncated = false;
        let mut appended = false;
        for index in matched_at + 1..=slice.latest_index() {
            let incoming = slice.entry(index);
            if index <= st.ps.log.latest_index() {
                if st.ps.log.entry_term(index) == incoming.term {
                    continue;
                }
                assert!(
                    index > self.committed.borrow().log_index,
                    "a committed entry can never conflict"
                );
                st.ps.log.truncate_from(index);
                truncated = true;
            }
            st.ps.log.append(incoming.clone());
            appended = true;
        }
        if truncated {
            self.rebuild_latest_view(st);
        } else if appended {
            self.extend_latest_view(st, st.ps.log.latest_index());
        }
        dirty |= truncated || appended;

        let new_commit = req.leader_commit.min(st.ps.log.latest_index());
        if new_commit > self.committed.borrow().log_index {
            self.update_commit_index(st, new_commit);
        }

        if dirty {
            self.persist(st).await?;
        }
        self.assert_local_invariants(st);
        Ok(AppendEntriesReply {
            term: st.ps.current_term,
            success: true,
        })
    }

    async fn on_install_snapshot(
        self: &Arc<Self>,
        req: InstallSnapshotRequest<M>,
    ) -> Result<InstallSnapshotReply, MemberError> {
        let mut guard = self.state.lock().await;
        let st = &mut *guard;
        if st.failed {
            return Err(MemberError::Lost);
        }

        let mut dirty = self.adopt_term_if_newer(st, req.term).await;
        if req.term < st.ps.current_term {
            debug!(member = %self.id, leader = %req.leader_id, "ignoring InstallSnapshot from stale term");
            return Ok(InstallSnapshotReply {
                term: st.ps.current_term,
            });
        }
        self.note_leader(st, req.leader_id).await;

        if req.last_included_index <= self.committed.borrow().log_index {
            // We already have everything the snapshot covers.
            if dirty {
                self.persist(st).await?;
            }
            self.assert_local_invariants(st);
            return Ok(InstallSnapshotReply {
                term: st.ps.current_term,
            });
        }

        // Replace the snapshot. A suffix whose base entry matches the
        // snapshot point survives; anything else is discarded (§7).
        let retains_suffix = req.last_included_index <= st.ps.log.latest_index()
            && st.ps.log.entry_term(req.last_included_index) == req.last_included_term;
        if retains_suffix {
            st.ps.log.compact_to(req.last_included_index);
        } else {
            st.ps.log =
                crate::core::log::LogSlice::new(req.last_included_index, req.last_included_term);
        }
        st.ps.snapshot_state = req.snapshot_state;
        st.ps.snapshot_config = req.snapshot_config;
        dirty = true;

        let committed_view = StateAndConfig {
            log_index: st.ps.log.prev_index,
            state: st.ps.snapshot_state.clone(),
            config: st.ps.snapshot_config.clone(),
        };
        self.committed.send_replace(committed_view);
        self.rebuild_latest_view(st);
        st.changes.fail_all();
        info!(
            member = %self.id,
            through = req.last_included_index,
            "snapshot installed"
        );

        if dirty {
            self.persist(st).await?;
        }
        self.update_readiness(st);
        self.assert_local_invariants(st);
        Ok(InstallSnapshotReply {
            term: st.ps.current_term,
        })
    }

    async fn on_step_down(
        self: &Arc<Self>,
        req: StepDownRequest,
    ) -> Result<StepDownReply, MemberError> {
        let mut guard = self.state.lock().await;
        let st = &mut *guard;
        if st.failed {
            return Err(MemberError::Lost);
        }

        let mut dirty = false;
        if self.adopt_term_if_newer(st, req.term).await {
            dirty = true;
            self.start_election_task(st);
        }
        if req.term == st.ps.current_term
            && st.current_term_leader == Some(req.leader_id)
            && !st.leader_invalidated
        {
            info!(member = %self.id, leader = %req.leader_id, term = req.term, "leader stepped down");
            st.leader_invalidated = true;
            if st.mode == Mode::FollowerLed {
                st.mode = Mode::FollowerUnled;
                st.last_leader_seen = LeaderPresence::AbsentSince(Instant::now());
                self.start_election_task(st);
            }
        }
        if dirty {
            self.persist(st).await?;
        }
        self.assert_local_invariants(st);
        Ok(StepDownReply {})
    }

    // ------------------------------------------------------------------
    // Connectivity observer
    // ------------------------------------------------------------------

    async fn connectivity_task(self: Arc<Self>, mut cancel: CancelSignal) {
        let mut connected_rx = self.network.connected_members();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = connected_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            let connected = connected_rx.borrow_and_update().clone();
            let Some(mut guard) = self.lock_or_cancelled(&mut cancel).await else {
                return;
            };
            let st = &mut *guard;
            if st.failed {
                return;
            }
            if let Some(leader) = st.current_term_leader {
                if leader != self.id && !connected.contains(&leader) && !st.leader_invalidated {
                    info!(member = %self.id, %leader, "leader disconnected");
                    st.leader_invalidated = true;
                    if st.mode == Mode::FollowerLed {
                        st.mode = Mode::FollowerUnled;
                        st.last_leader_seen = LeaderPresence::AbsentSince(Instant::now());
                        self.start_election_task(st);
                    }
                }
            }
            // Quorum-loss step-down for a leader is driven by the leader
            // phase itself, which watches the same set.
            self.update_readiness(st);
        }
    }

    // ------------------------------------------------------------------
    // Election & leader task
    // ------------------------------------------------------------------

    /// The one long-running task per member. It exists exactly while the
    /// mode is not `FollowerLed`: it waits out the election timeout, runs
    /// candidacies, and on victory runs the leader phase. External
    /// transitions (a live leader appearing, a newer term adopted by a
    /// handler) stop it via its cancel signal; internal defeats loop back
    /// to the timeout wait.
    async fn election_and_leader_task(self: Arc<Self>, mut cancel: CancelSignal) {
        loop {
            if !self.await_election_timeout(&mut cancel).await {
                return;
            }
            match self.run_candidate(&mut cancel).await {
                CandidateOutcome::Cancelled => return,
                CandidateOutcome::Defeated => continue,
                CandidateOutcome::Elected => {}
            }
            match self.lead(&mut cancel).await {
                LeaderOutcome::Cancelled => return,
                LeaderOutcome::SteppedDown => continue,
            }
        }
    }

    /// Wait until an election timeout has elapsed since the leader was
    /// last seen. Returns false on cancellation.
    async fn await_election_timeout(&self, cancel: &mut CancelSignal) -> bool {
        let timeout = self.config.random_election_timeout();
        loop {
            let deadline = {
                let Some(st) = self.lock_or_cancelled(cancel).await else {
                    return false;
                };
                match st.last_leader_seen {
                    LeaderPresence::AbsentSince(since) => since + timeout,
                    // Transiently possible right after construction races;
                    // treat "now" as the reference point.
                    LeaderPresence::Current => Instant::now() + timeout,
                }
            };
            if Instant::now() >= deadline {
                return true;
            }
            tokio::select! {
                _ = sleep_until(deadline) => {}
                _ = cancel.cancelled() => return false,
            }
        }
    }

    async fn run_candidate(self: &Arc<Self>, cancel: &mut CancelSignal) -> CandidateOutcome {
        loop {
            // Begin an election: new term, vote for self, persist, fan
            // out RequestVote to every voting member (both halves under
            // joint consensus).
            let (election_term, request, config) = {
                let Some(mut guard) = self.lock_or_cancelled(cancel).await else {
                    return CandidateOutcome::Cancelled;
                };
                let st = &mut *guard;
                if st.failed {
                    return CandidateOutcome::Cancelled;
                }
                let config = self.latest.borrow().config.clone();
                if !config.is_valid_leader(self.id) {
                    // Not eligible (removed, or non-voting); wait for the
                    // configuration to change instead of burning terms.
                    st.last_leader_seen = LeaderPresence::AbsentSince(Instant::now());
                    return CandidateOutcome::Defeated;
                }
                st.mode = Mode::Candidate;
                let new_term = st.ps.current_term + 1;
                self.update_term(st, new_term);
                st.ps.voted_for = Some(self.id);
                if self.persist(st).await.is_err() {
                    return CandidateOutcome::Cancelled;
                }
                info!(member = %self.id, term = new_term, "starting election");
                let request = RequestVoteRequest {
                    term: new_term,
                    candidate_id: self.id,
                    last_log_index: st.ps.log.latest_index(),
                    last_log_term: st.ps.log.latest_term(),
                };
                (new_term, request, config)
            };

            let mut votes: FuturesUnordered<_> = config
                .voting_members()
                .into_iter()
                .filter(|&peer| peer != self.id)
                .map(|peer| {
                    let inner = self.clone();
                    let request = request.clone();
                    async move {
                        (
                            peer,
                            inner
                                .network
                                .send_rpc(peer, RpcRequest::RequestVote(request))
                                .await,
                        )
                    }
                })
                .collect();

            let mut granted = std::collections::BTreeSet::from([self.id]);
            let attempt_deadline = Instant::now() + self.config.random_election_timeout();
            loop {
                if config.is_quorum(&granted) {
                    return CandidateOutcome::Elected;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return CandidateOutcome::Cancelled,
                    _ = sleep_until(attempt_deadline) => {
                        debug!(member = %self.id, term = election_term, "election timed out, retrying");
                        break;
                    }
                    reply = votes.next() => match reply {
                        None => {
                            // Every reply is in and we lost; wait out the
                            // timer so peers can reappear before retrying.
                            tokio::select! {
                                _ = cancel.cancelled() => return CandidateOutcome::Cancelled,
                                _ = sleep_until(attempt_deadline) => break,
                            }
                        }
                        Some((peer, Ok(RpcReply::RequestVote(reply)))) => {
                            if reply.term > election_term {
                                let Some(mut guard) = self.lock_or_cancelled(cancel).await else {
                                    return CandidateOutcome::Cancelled;
                                };
                                let st = &mut *guard;
                                if reply.term > st.ps.current_term {
                                    self.update_term(st, reply.term);
                                    if self.persist(st).await.is_err() {
                                        return CandidateOutcome::Cancelled;
                                    }
                                }
                                st.mode = Mode::FollowerUnled;
                                st.last_leader_seen = LeaderPresence::AbsentSince(Instant::now());
                                return CandidateOutcome::Defeated;
                            }
                            if reply.vote_granted && reply.term == election_term {
                                granted.insert(peer);
                            }
                        }
                        Some((peer, Ok(_))) => {
                            warn!(member = %self.id, %peer, "mismatched reply to RequestVote");
                        }
                        Some((peer, Err(e))) => {
                            debug!(member = %self.id, %peer, error = %e, "vote request failed");
                        }
                    }
                }
            }
        }
    }

    async fn lead(self: &Arc<Self>, cancel: &mut CancelSignal) -> LeaderOutcome {
        // Higher terms observed by replication subtasks, quorum loss, and
        // self-removal all funnel through this one defeat signal.
        let (defeat_tx, mut defeat_rx) = watch::channel::<Option<Term>>(None);
        let mut subtasks: BTreeMap<MemberId, TaskHandle> = BTreeMap::new();
        // Subscribed before leadership is initialized so that nothing
        // that happens between initialization and the first poll of the
        // loop below can slip by unseen.
        let mut latest_rx = self.latest.subscribe();
        let mut committed_rx = self.committed.subscribe();
        let mut connected_rx = self.network.connected_members();
        let term;
        {
            let Some(mut guard) = self.lock_or_cancelled(cancel).await else {
                return LeaderOutcome::Cancelled;
            };
            let st = &mut *guard;
            if st.failed || st.mode != Mode::Candidate {
                st.mode = Mode::FollowerUnled;
                return LeaderOutcome::SteppedDown;
            }
            term = st.ps.current_term;
            st.mode = Mode::Leader;
            st.current_term_leader = Some(self.id);
            st.last_leader_seen = LeaderPresence::Current;
            info!(member = %self.id, term, "won election, leading");

            // A no-op at the new term lets earlier-term entries commit
            // through a current-term majority match (§5.4.2, §8).
            let noop_index = st.ps.log.latest_index() + 1;
            st.ps.log.append(LogEntry {
                term,
                payload: EntryPayload::Noop,
            });
            if self.persist(st).await.is_err() {
                return LeaderOutcome::Cancelled;
            }
            self.extend_latest_view(st, noop_index);

            let config = self.latest.borrow().config.clone();
            st.match_index.clear();
            for member in config.all_members() {
                st.match_index.insert(member, 0);
            }
            st.match_index.insert(self.id, noop_index);
            self.try_advance_commit(st);
            self.update_readiness(st);

            for peer in config.all_members() {
                if peer != self.id {
                    subtasks.insert(
                        peer,
                        self.spawn_replication(peer, term, noop_index, defeat_tx.clone()),
                    );
                }
            }

            // A joint configuration may already be committed (we took
            // over mid-reconfiguration); drive it forward immediately.
            if self.drive_reconfiguration(st, term, &defeat_tx).await.is_err() {
                return LeaderOutcome::Cancelled;
            }
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Externally stopped; the stopper holds the mutex and
                    // performs the leader cleanup itself.
                    Self::teardown_subtasks(&mut subtasks).await;
                    return LeaderOutcome::Cancelled;
                }
                _ = defeat_rx.changed() => {
                    Self::teardown_subtasks(&mut subtasks).await;
                    let Some(mut guard) = self.lock_or_cancelled(cancel).await else {
                        return LeaderOutcome::Cancelled;
                    };
                    let st = &mut *guard;
                    // Clean up (and announce the step-down at the term we
                    // actually led) before adopting any newer term.
                    self.leader_cleanup(st);
                    let newer = *defeat_rx.borrow_and_update();
                    if let Some(newer) = newer {
                        if newer > st.ps.current_term {
                            self.update_term(st, newer);
                            if self.persist(st).await.is_err() {
                                return LeaderOutcome::Cancelled;
                            }
                        }
                    }
                    st.mode = Mode::FollowerUnled;
                    st.last_leader_seen = LeaderPresence::AbsentSince(Instant::now());
                    self.update_readiness(st);
                    return LeaderOutcome::SteppedDown;
                }
                _ = latest_rx.changed() => {
                    // Keep the replication subtask set and match indexes
                    // congruent with the (possibly joint) membership.
                    let Some(mut guard) = self.lock_or_cancelled(cancel).await else {
                        return LeaderOutcome::Cancelled;
                    };
                    let st = &mut *guard;
                    if st.mode != Mode::Leader {
                        continue;
                    }
                    let members = self.latest.borrow().config.all_members();
                    for &member in &members {
                        if member != self.id && !subtasks.contains_key(&member) {
                            st.match_index.entry(member).or_insert(0);
                            let next = st.ps.log.latest_index() + 1;
                            subtasks.insert(
                                member,
                                self.spawn_replication(member, term, next, defeat_tx.clone()),
                            );
                        }
                    }
                    let gone: Vec<MemberId> = subtasks
                        .keys()
                        .copied()
                        .filter(|m| !members.contains(m))
                        .collect();
                    for member in gone {
                        if let Some(task) = subtasks.remove(&member) {
                            task.stop().await;
                        }
                        st.match_index.remove(&member);
                    }
                    if !members.contains(&self.id) {
                        st.match_index.remove(&self.id);
                    }
                    self.try_advance_commit(st);
                    self.update_readiness(st);
                }
                _ = committed_rx.changed() => {
                    let Some(mut guard) = self.lock_or_cancelled(cancel).await else {
                        return LeaderOutcome::Cancelled;
                    };
                    let st = &mut *guard;
                    if st.mode != Mode::Leader {
                        continue;
                    }
                    if self.drive_reconfiguration(st, term, &defeat_tx).await.is_err() {
                        return LeaderOutcome::Cancelled;
                    }
                    // Config-change readiness tracks the committed
                    // configuration, so a commit advance can change it
                    // (the phase-2 commit in particular).
                    self.update_readiness(st);
                }
                changed = connected_rx.changed() => {
                    if changed.is_err() {
                        continue;
                    }
                    let Some(mut guard) = self.lock_or_cancelled(cancel).await else {
                        return LeaderOutcome::Cancelled;
                    };
                    let st = &mut *guard;
                    if st.mode != Mode::Leader {
                        continue;
                    }
                    self.update_readiness(st);
                    let mut reachable = connected_rx.borrow_and_update().clone();
                    reachable.insert(self.id);
                    if !self.latest.borrow().config.is_quorum(&reachable) {
                        info!(member = %self.id, term, "lost contact with a quorum");
                        let _ = defeat_tx.send(None);
                    }
                }
            }
        }
    }

    /// Two-phase reconfiguration driver (§6). Once a joint entry commits,
    /// append the entry carrying only its `next` half; once a plain
    /// configuration that excludes us commits, step down.
    async fn drive_reconfiguration(
        &self,
        st: &mut MemberState<M>,
        term: Term,
        defeat_tx: &watch::Sender<Option<Term>>,
    ) -> Result<(), MemberError> {
        let committed_config = self.committed.borrow().config.clone();
        let latest_config = self.latest.borrow().config.clone();
        if committed_config.is_joint() && latest_config == committed_config {
            let next = committed_config.next.clone().expect("joint has a next half");
            info!(member = %self.id, term, "joint configuration committed, completing transition");
            self.leader_append(
                st,
                LogEntry {
                    term,
                    payload: EntryPayload::Config(JointConfig::single(next)),
                },
            )
            .await?;
        }
        if !committed_config.is_joint() && !committed_config.is_valid_leader(self.id) {
            info!(member = %self.id, term, "removed from the configuration");
            let _ = defeat_tx.send(None);
        }
        Ok(())
    }

    async fn teardown_subtasks(subtasks: &mut BTreeMap<MemberId, TaskHandle>) {
        for (_, task) in std::mem::take(subtasks) {
            task.stop().await;
        }
    }

    // ------------------------------------------------------------------
    // Per-peer replication
    // ------------------------------------------------------------------

    fn spawn_replication(
        self: &Arc<Self>,
        peer: MemberId,
        term: Term,
        next_index: LogIndex,
        defeat_tx: watch::Sender<Option<Term>>,
    ) -> TaskHandle {
        let (cancel_tx, cancel) = CancelSignal::new();
        let inner = self.clone();
        let handle = tokio::spawn(async move {
            inner
                .replicate_to_peer(peer, term, next_index, defeat_tx, cancel)
                .await;
        });
        TaskHandle {
            cancel: cancel_tx,
            handle,
        }
    }

    /// Push entries (or the snapshot) to one peer until stopped. Owns the
    /// peer's `next_index` cursor; `match_index` updates flow back under
    /// the mutex.
    async fn replicate_to_peer(
        self: Arc<Self>,
        peer: MemberId,
        term: Term,
        mut next_index: LogIndex,
        defeat_tx: watch::Sender<Option<Term>>,
        mut cancel: CancelSignal,
    ) {
        let mut latest_rx = self.latest.subscribe();
        let mut committed_rx = self.committed.subscribe();
        let mut last_sent = Instant::now();
        let mut last_sent_commit: LogIndex = 0;

        loop {
            let step = {
                let Some(st) = self.lock_or_cancelled(&mut cancel).await else {
                    return;
                };
                if st.failed || st.ps.current_term != term || st.mode != Mode::Leader {
                    return;
                }
                let commit = self.committed.borrow().log_index;
                let log = &st.ps.log;
                if next_index <= log.prev_index {
                    ReplicationStep::Snapshot(InstallSnapshotRequest {
                        term,
                        leader_id: self.id,
                        last_included_index: log.prev_index,
                        last_included_term: log.prev_term,
                        snapshot_state: st.ps.snapshot_state.clone(),
                        snapshot_config: st.ps.snapshot_config.clone(),
                    })
                } else if next_index <= log.latest_index() {
                    let window = log.window(next_index, self.config.max_entries_per_append);
                    let top = window.latest_index();
                    ReplicationStep::Append(
                        AppendEntriesRequest {
                            term,
                            leader_id: self.id,
                            entries: window,
                            leader_commit: commit,
                        },
                        top,
                    )
                } else if commit > last_sent_commit
                    || last_sent.elapsed() >= self.config.heartbeat_interval
                {
                    // Nothing new to send: an empty AppendEntries carries
                    // the commit index and doubles as the heartbeat.
                    let window = log.window(next_index, 0);
                    let top = window.latest_index();
                    ReplicationStep::Append(
                        AppendEntriesRequest {
                            term,
                            leader_id: self.id,
                            entries: window,
                            leader_commit: commit,
                        },
                        top,
                    )
                } else {
                    ReplicationStep::Idle
                }
            };

            match step {
                ReplicationStep::Idle => {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = latest_rx.changed() => {}
                        _ = committed_rx.changed() => {}
                        _ = sleep_until(last_sent + self.config.heartbeat_interval) => {}
                    }
                }
                ReplicationStep::Append(request, top) => {
                    let sent_commit = request.leader_commit;
                    let reply = tokio::select! {
                        reply = self.network.send_rpc(peer, RpcRequest::AppendEntries(request)) => reply,
                        _ = cancel.cancelled() => return,
                    };
                    last_sent = Instant::now();
                    match reply {
                        Ok(RpcReply::AppendEntries(reply)) => {
                            if reply.term > term {
                                let _ = defeat_tx.send(Some(reply.term));
                                return;
                            }
                            if reply.success {
                                last_sent_commit = sent_commit;
                                next_index = top + 1;
                                let Some(mut guard) = self.lock_or_cancelled(&mut cancel).await
                                else {
                                    return;
                                };
                                let st = &mut *guard;
                                if st.ps.current_term != term || st.mode != Mode::Leader {
                                    return;
                                }
                                if let Some(matched) = st.match_index.get_mut(&peer) {
                                    if top > *matched {
                                        *matched = top;
                                    }
                                }
                                self.try_advance_commit(st);
                            } else {
                                // Log mismatch; back off one entry and
                                // retry (§5.3). The snapshot path takes
                                // over once the cursor falls below our
                                // own log.
                                if next_index > 1 {
                                    next_index -= 1;
                                }
                                debug!(member = %self.id, %peer, next_index, "log mismatch, backing off");
                            }
                        }
                        Ok(_) => warn!(member = %self.id, %peer, "mismatched reply to AppendEntries"),
                        Err(e) => {
                            debug!(member = %self.id, %peer, error = %e, "append delivery failed");
                            if !self.await_peer_reachable(peer, &mut cancel).await {
                                return;
                            }
                        }
                    }
                }
                ReplicationStep::Snapshot(request) => {
                    let snapshot_index = request.last_included_index;
                    let reply = tokio::select! {
                        reply = self.network.send_rpc(peer, RpcRequest::InstallSnapshot(request)) => reply,
                        _ = cancel.cancelled() => return,
                    };
                    last_sent = Instant::now();
                    match reply {
                        Ok(RpcReply::InstallSnapshot(reply)) => {
                            if reply.term > term {
                                let _ = defeat_tx.send(Some(reply.term));
                                return;
                            }
                            next_index = snapshot_index + 1;
                            let Some(mut guard) = self.lock_or_cancelled(&mut cancel).await else {
                                return;
                            };
                            let st = &mut *guard;
                            if st.ps.current_term != term || st.mode != Mode::Leader {
                                return;
                            }
                            debug!(member = %self.id, %peer, snapshot_index, "snapshot installed on peer");
                            if let Some(matched) = st.match_index.get_mut(&peer) {
                                if snapshot_index > *matched {
                                    *matched = snapshot_index;
                                }
                            }
                            self.try_advance_commit(st);
                        }
                        Ok(_) => warn!(member = %self.id, %peer, "mismatched reply to InstallSnapshot"),
                        Err(e) => {
                            debug!(member = %self.id, %peer, error = %e, "snapshot delivery failed");
                            if !self.await_peer_reachable(peer, &mut cancel).await {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    /// After a delivery failure, hold off until the peer is back in the
    /// connectivity set. Returns false on cancellation.
    async fn await_peer_reachable(&self, peer: MemberId, cancel: &mut CancelSignal) -> bool {
        let mut connected_rx = self.network.connected_members();
        if connected_rx.borrow_and_update().contains(&peer) {
            // Listed but failing; pace the retries instead of spinning.
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.config.heartbeat_interval) => return true,
            }
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                changed = connected_rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
            if connected_rx.borrow_and_update().contains(&peer) {
                return true;
            }
        }
    }
}
