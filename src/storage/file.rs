//! File-based storage
//!
//! Stores the whole persistent record as one JSON line followed by a CRC32
//! checksum, written to a temp file, fsynced, and renamed into place. The
//! checksum detects torn writes; a torn temp file simply never replaces
//! the previous record.

use std::fs::{self, File};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{Storage, StorageError};
use crate::core::types::PersistentState;
use crate::state_machine::StateMachine;

/// CRC32 (IEEE polynomial).
fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for byte in data {
        crc ^= *byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

pub struct FileStorage<M: StateMachine> {
    path: PathBuf,
    _state: PhantomData<fn() -> M>,
}

impl<M: StateMachine> FileStorage<M> {
    /// Storage backed by `<dir>/state`. Creates the directory if needed.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(FileStorage {
            path: dir.join("state"),
            _state: PhantomData,
        })
    }

    /// Read back the record written last, if any. Called once at process
    /// start to reconstruct the member.
    pub fn load(&self) -> Result<Option<PersistentState<M>>, StorageError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content =
            fs::read_to_string(&self.path).map_err(|e| StorageError::Io(e.to_string()))?;
        let content = content.trim_end();
        if content.is_empty() {
            return Ok(None);
        }

        let (data, checksum_str) = content.rsplit_once(' ').ok_or_else(|| {
            StorageError::Corruption(format!("missing checksum in {:?}", self.path))
        })?;
        let stored = u32::from_str_radix(checksum_str, 16).map_err(|_| {
            StorageError::Corruption(format!("invalid checksum format in {:?}", self.path))
        })?;
        let computed = crc32(data.as_bytes());
        if stored != computed {
            return Err(StorageError::Corruption(format!(
                "checksum mismatch in {:?}: stored {stored:08x}, computed {computed:08x}",
                self.path
            )));
        }

        let state = serde_json::from_str(data)
            .map_err(|e| StorageError::Corruption(format!("undecodable record: {e}")))?;
        Ok(Some(state))
    }

    fn write_atomically(&self, data: &str) -> Result<(), StorageError> {
        let checksum = crc32(data.as_bytes());
        let content = format!("{data} {checksum:08x}\n");
        let temp_path = self.path.with_extension("tmp");

        let mut file = File::create(&temp_path).map_err(|e| StorageError::Io(e.to_string()))?;
        file.write_all(content.as_bytes())
            .map_err(|e| StorageError::Io(e.to_string()))?;
        file.sync_all().map_err(|e| StorageError::Io(e.to_string()))?;
        fs::rename(&temp_path, &self.path).map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl<M: StateMachine> Storage<M> for FileStorage<M> {
    async fn write_persistent_state(
        &self,
        state: &PersistentState<M>,
    ) -> Result<(), StorageError> {
        let data =
            serde_json::to_string(state).map_err(|e| StorageError::Io(e.to_string()))?;
        self.write_atomically(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ClusterConfig, MemberId};
    use crate::state_machine::RecordingStateMachine;

    fn temp_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("raft-kernel-test-{tag}-{}", rand::random::<u64>()))
    }

    fn sample_state(term: u64) -> PersistentState<RecordingStateMachine> {
        let mut ps = PersistentState::make_initial(
            RecordingStateMachine::new(),
            ClusterConfig::new([MemberId::from_raw(1), MemberId::from_raw(2)]),
        );
        ps.current_term = term;
        ps
    }

    #[tokio::test]
    async fn round_trips_the_record() {
        let dir = temp_dir("roundtrip");
        let storage = FileStorage::new(&dir).unwrap();
        assert!(storage.load().unwrap().is_none());

        storage.write_persistent_state(&sample_state(4)).await.unwrap();
        let loaded = storage.load().unwrap().unwrap();
        assert_eq!(loaded, sample_state(4));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn later_writes_replace_earlier_ones() {
        let dir = temp_dir("replace");
        let storage = FileStorage::new(&dir).unwrap();
        storage.write_persistent_state(&sample_state(1)).await.unwrap();
        storage.write_persistent_state(&sample_state(2)).await.unwrap();
        assert_eq!(storage.load().unwrap().unwrap().current_term, 2);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn corruption_is_detected() {
        let dir = temp_dir("corrupt");
        let storage = FileStorage::<RecordingStateMachine>::new(&dir).unwrap();
        storage.write_persistent_state(&sample_state(1)).await.unwrap();

        let mut content = fs::read_to_string(dir.join("state")).unwrap();
        content = content.replacen("1", "9", 1);
        fs::write(dir.join("state"), content).unwrap();

        assert!(matches!(
            storage.load(),
            Err(StorageError::Corruption(_))
        ));
        fs::remove_dir_all(&dir).unwrap();
    }
}
