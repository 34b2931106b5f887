//! Key-value store state machine
//!
//! A small map-backed state machine used by the examples and the
//! integration tests. Changes are typed `Set`/`Delete` operations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::StateMachine;

/// Operations accepted by [`KvStore`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvChange {
    Set { key: String, value: String },
    Delete { key: String },
}

impl KvChange {
    /// Convenience constructor for the common case.
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        KvChange::Set {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Replicated key-value map.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvStore {
    entries: BTreeMap<String, String>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl StateMachine for KvStore {
    type Change = KvChange;

    fn apply_change(&mut self, change: &KvChange) {
        match change {
            KvChange::Set { key, value } => {
                self.entries.insert(key.clone(), value.clone());
            }
            KvChange::Delete { key } => {
                self.entries.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get() {
        let mut kv = KvStore::new();
        kv.apply_change(&KvChange::set("x", "1"));
        assert_eq!(kv.get("x"), Some("1"));
        assert_eq!(kv.get("y"), None);
    }

    #[test]
    fn set_overwrites() {
        let mut kv = KvStore::new();
        kv.apply_change(&KvChange::set("x", "1"));
        kv.apply_change(&KvChange::set("x", "2"));
        assert_eq!(kv.get("x"), Some("2"));
        assert_eq!(kv.len(), 1);
    }

    #[test]
    fn delete_removes() {
        let mut kv = KvStore::new();
        kv.apply_change(&KvChange::set("x", "1"));
        kv.apply_change(&KvChange::Delete { key: "x".into() });
        assert_eq!(kv.get("x"), None);
        assert!(kv.is_empty());
    }

    #[test]
    fn serde_round_trip() {
        let mut kv = KvStore::new();
        kv.apply_change(&KvChange::set("a", "1"));
        kv.apply_change(&KvChange::set("b", "2"));
        let bytes = serde_json::to_vec(&kv).unwrap();
        let restored: KvStore = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(kv, restored);
    }
}
