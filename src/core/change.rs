//! Change tracking for client proposals
//!
//! Every accepted proposal registers a single-shot [`ChangeToken`] keyed by
//! the log index of its entry. When the commit index advances past that
//! index the token resolves to `true`; when leadership is lost first, every
//! remaining token resolves to `false`. A `false` outcome does not mean the
//! change was not (or will not be) committed — the caller must reconcile by
//! observing the replicated state.

use std::collections::BTreeMap;

use tokio::sync::oneshot;

use crate::core::types::LogIndex;

/// Single-shot handle tracking one proposed change.
#[derive(Debug)]
pub struct ChangeToken {
    rx: oneshot::Receiver<bool>,
}

impl ChangeToken {
    /// Resolve the token: `true` once the entry is committed, `false` if
    /// it was abandoned (leadership lost before commitment was observed).
    pub async fn wait(self) -> bool {
        self.rx.await.unwrap_or(false)
    }
}

/// The member-side half of a registered token.
#[derive(Debug)]
pub(crate) struct PendingChange {
    pub is_config: bool,
    tx: oneshot::Sender<bool>,
}

impl PendingChange {
    pub(crate) fn pair(is_config: bool) -> (PendingChange, ChangeToken) {
        let (tx, rx) = oneshot::channel();
        (PendingChange { is_config, tx }, ChangeToken { rx })
    }

    fn resolve(self, committed: bool) {
        let _ = self.tx.send(committed);
    }
}

/// Pending tokens keyed by the log index they await. Non-empty only on a
/// leader.
#[derive(Debug, Default)]
pub(crate) struct ChangeRegistry {
    pending: BTreeMap<LogIndex, Vec<PendingChange>>,
}

impl ChangeRegistry {
    pub fn register(&mut self, index: LogIndex, change: PendingChange) {
        self.pending.entry(index).or_default().push(change);
    }

    /// Resolve success for every token at an index `<= up_to`.
    pub fn resolve_committed(&mut self, up_to: LogIndex) {
        let keep = self.pending.split_off(&(up_to + 1));
        for (_, changes) in std::mem::replace(&mut self.pending, keep) {
            for change in changes {
                change.resolve(true);
            }
        }
    }

    /// Resolve failure for everything still pending.
    pub fn fail_all(&mut self) {
        for (_, changes) in std::mem::take(&mut self.pending) {
            for change in changes {
                change.resolve(false);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn commit_resolves_tokens_at_or_below_the_index() {
        let mut registry = ChangeRegistry::default();
        let (p1, t1) = PendingChange::pair(false);
        let (p2, t2) = PendingChange::pair(false);
        registry.register(3, p1);
        registry.register(5, p2);

        registry.resolve_committed(4);
        assert!(t1.wait().await);
        assert!(!registry.is_empty());

        registry.resolve_committed(5);
        assert!(t2.wait().await);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn leader_loss_fails_remaining_tokens() {
        let mut registry = ChangeRegistry::default();
        let (p, token) = PendingChange::pair(true);
        registry.register(7, p);
        registry.fail_all();
        assert!(!token.wait().await);
    }

    #[tokio::test]
    async fn dropped_registry_reads_as_abandoned() {
        let (p, token) = PendingChange::pair(false);
        drop(p);
        assert!(!token.wait().await);
    }
}
