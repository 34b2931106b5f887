//! Structural assertions across a set of members
//!
//! Test-only tooling: it needs direct access to every member of the
//! cluster, so it is only usable where all of them live in one process.
//! The checker takes each member's mutex in ascending id order (no
//! deadlock against a concurrent checker) and verifies, read-only, the
//! per-member view invariants plus the cross-member safety properties:
//! Election Safety, Log Matching, and committed-prefix agreement.
//!
//! Panics on violation: a broken invariant is a programming error and
//! continuing would violate safety.

use crate::core::member::{MemberState, Mode, RaftMember};
use crate::core::types::{LogIndex, StateAndConfig};
use crate::state_machine::StateMachine;
use crate::storage::Storage;
use crate::transport::Transport;

/// Verify a collection of members that form one cluster. Blocks until
/// every member's mutex is briefly available; modifies nothing.
pub async fn check_invariants<M, S, N>(members: &[&RaftMember<M, S, N>])
where
    M: StateMachine,
    S: Storage<M>,
    N: Transport<M>,
{
    let mut ordered: Vec<&RaftMember<M, S, N>> = members.to_vec();
    ordered.sort_by_key(|m| m.inner.id);
    ordered.dedup_by_key(|m| m.inner.id);

    let mut guards = Vec::with_capacity(ordered.len());
    for member in &ordered {
        guards.push(member.inner.state.lock().await);
    }

    for (member, st) in ordered.iter().zip(guards.iter()) {
        check_member(member, st);
    }

    for i in 0..ordered.len() {
        for j in i + 1..ordered.len() {
            check_pair(ordered[i], &guards[i], ordered[j], &guards[j]);
        }
    }
}

fn check_member<M, S, N>(member: &RaftMember<M, S, N>, st: &MemberState<M>)
where
    M: StateMachine,
    S: Storage<M>,
    N: Transport<M>,
{
    let id = member.inner.id;
    let committed = member.inner.committed.borrow().clone();
    let latest = member.inner.latest.borrow().clone();

    assert!(
        committed.log_index >= st.ps.log.prev_index,
        "{id}: commit index behind the snapshot"
    );
    assert!(
        committed.log_index <= latest.log_index,
        "{id}: committed view ahead of latest view"
    );
    assert_eq!(
        latest.log_index,
        st.ps.log.latest_index(),
        "{id}: latest view out of sync with the log"
    );

    // The views must equal a replay of the log over the snapshot.
    let mut replay = StateAndConfig {
        log_index: st.ps.log.prev_index,
        state: st.ps.snapshot_state.clone(),
        config: st.ps.snapshot_config.clone(),
    };
    if committed.log_index > replay.log_index {
        replay.apply_entries(&st.ps.log, replay.log_index + 1, committed.log_index);
    }
    assert_eq!(replay, committed, "{id}: committed view diverges from a replay");
    if latest.log_index > replay.log_index {
        replay.apply_entries(&st.ps.log, replay.log_index + 1, latest.log_index);
    }
    assert_eq!(replay, latest, "{id}: latest view diverges from a replay");

    if st.mode != Mode::Leader {
        assert!(
            st.match_index.is_empty(),
            "{id}: non-leader holds match indexes"
        );
        assert!(
            st.changes.is_empty(),
            "{id}: non-leader holds pending change tokens"
        );
    }
}

fn check_pair<M, S, N>(
    a: &RaftMember<M, S, N>,
    a_st: &MemberState<M>,
    b: &RaftMember<M, S, N>,
    b_st: &MemberState<M>,
) where
    M: StateMachine,
    S: Storage<M>,
    N: Transport<M>,
{
    let (a_id, b_id) = (a.inner.id, b.inner.id);

    // Election Safety: at most one leader per term.
    if a_st.mode == Mode::Leader
        && b_st.mode == Mode::Leader
        && a_st.ps.current_term == b_st.ps.current_term
    {
        panic!(
            "election safety violated: {a_id} and {b_id} both lead term {}",
            a_st.ps.current_term
        );
    }

    // Log Matching: where both logs hold an entry with the same term, the
    // entries are identical, and so is everything before them.
    let lo: LogIndex = a_st.ps.log.prev_index.max(b_st.ps.log.prev_index);
    let hi: LogIndex = a_st
        .ps
        .log
        .latest_index()
        .min(b_st.ps.log.latest_index());
    let mut matched_above: Option<LogIndex> = None;
    for index in (lo.max(1)..=hi).rev() {
        if index <= a_st.ps.log.prev_index || index <= b_st.ps.log.prev_index {
            break;
        }
        if a_st.ps.log.entry_term(index) == b_st.ps.log.entry_term(index) {
            matched_above = Some(index);
            break;
        }
    }
    if let Some(top) = matched_above {
        for index in (lo.max(1)..=top).rev() {
            if index <= a_st.ps.log.prev_index || index <= b_st.ps.log.prev_index {
                break;
            }
            assert_eq!(
                a_st.ps.log.entry(index),
                b_st.ps.log.entry(index),
                "log matching violated between {a_id} and {b_id} at index {index}"
            );
        }
    }

    // Committed prefixes agree (State Machine Safety): every index both
    // members have committed and still hold in their logs is identical.
    let a_commit = a.inner.committed.borrow().log_index;
    let b_commit = b.inner.committed.borrow().log_index;
    let commit_hi = a_commit.min(b_commit).min(hi);
    for index in (lo.max(1)..=commit_hi).rev() {
        if index <= a_st.ps.log.prev_index || index <= b_st.ps.log.prev_index {
            break;
        }
        assert_eq!(
            a_st.ps.log.entry(index),
            b_st.ps.log.entry(index),
            "committed entries diverge between {a_id} and {b_id} at index {index}"
        );
    }
}
