//! Storage port for persistent state
//!
//! The core requires certain state to reach stable storage before it acts
//! on it: a vote must be durable before it is granted, a term bump before
//! it is acknowledged, appended entries before they are confirmed.

use async_trait::async_trait;
use thiserror::Error;

use crate::core::types::PersistentState;
use crate::state_machine::StateMachine;

/// Errors a storage implementation can surface.
///
/// Any error here is terminal for the member: the core treats a failed
/// write as a lost member and refuses further operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("storage i/o error: {0}")]
    Io(String),
    #[error("stored state is corrupt: {0}")]
    Corruption(String),
}

/// Write-through port the core uses to persist its state.
///
/// `write_persistent_state` must return only once the record is durable;
/// the record written last is what the member must be reconstructed from
/// after a restart. An append-only fast path for log-tail writes would be
/// a valid optimization but is not required by the core.
#[async_trait]
pub trait Storage<M: StateMachine>: Send + Sync + 'static {
    async fn write_persistent_state(&self, state: &PersistentState<M>)
        -> Result<(), StorageError>;
}

#[async_trait]
impl<M: StateMachine, S: Storage<M>> Storage<M> for std::sync::Arc<S> {
    async fn write_persistent_state(
        &self,
        state: &PersistentState<M>,
    ) -> Result<(), StorageError> {
        (**self).write_persistent_state(state).await
    }
}
