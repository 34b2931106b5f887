//! In-memory storage for tests
//!
//! No disk I/O and no persistence across processes; "durable" here means
//! the record survives until the test inspects it.

use std::sync::Mutex;

use async_trait::async_trait;

use super::{Storage, StorageError};
use crate::core::types::PersistentState;
use crate::state_machine::StateMachine;

#[derive(Debug, Default)]
pub struct MemoryStorage<M: StateMachine> {
    record: Mutex<Option<PersistentState<M>>>,
}

impl<M: StateMachine> MemoryStorage<M> {
    pub fn new() -> Self {
        MemoryStorage {
            record: Mutex::new(None),
        }
    }

    /// The most recently written record, for restart tests.
    pub fn last_written(&self) -> Option<PersistentState<M>> {
        self.record.lock().unwrap().clone()
    }
}

#[async_trait]
impl<M: StateMachine> Storage<M> for MemoryStorage<M> {
    async fn write_persistent_state(
        &self,
        state: &PersistentState<M>,
    ) -> Result<(), StorageError> {
        *self.record.lock().unwrap() = Some(state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ClusterConfig;
    use crate::core::types::MemberId;
    use crate::state_machine::RecordingStateMachine;

    #[tokio::test]
    async fn last_written_returns_the_latest_record() {
        let storage = MemoryStorage::new();
        assert!(storage.last_written().is_none());

        let mut ps = PersistentState::make_initial(
            RecordingStateMachine::new(),
            ClusterConfig::new([MemberId::from_raw(1)]),
        );
        storage.write_persistent_state(&ps).await.unwrap();
        ps.current_term = 3;
        storage.write_persistent_state(&ps).await.unwrap();

        assert_eq!(storage.last_written().unwrap().current_term, 3);
    }
}
