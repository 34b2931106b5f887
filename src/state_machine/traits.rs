//! State machine abstraction for the consensus core
//!
//! The state machine is the application logic the cluster replicates. The
//! core stores `Change` values in the log and applies them, in commit
//! order, to produce the observable replicated state.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// The replicated application state.
///
/// Implementations must be deterministic: applying the same changes in the
/// same order must produce equal states on every member. Snapshots are
/// taken by cloning the state value itself, so cloning must capture the
/// complete state.
pub trait StateMachine:
    Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// The operation type stored in log entries.
    type Change: Clone
        + PartialEq
        + fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static;

    /// Apply one change to the state, mutating it in place.
    fn apply_change(&mut self, change: &Self::Change);
}

/// Test state machine that records every applied change in order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordingStateMachine {
    applied: Vec<String>,
}

impl RecordingStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Changes applied so far, in order.
    pub fn applied(&self) -> &[String] {
        &self.applied
    }
}

impl StateMachine for RecordingStateMachine {
    type Change = String;

    fn apply_change(&mut self, change: &String) {
        self.applied.push(change.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_changes_in_order() {
        let mut sm = RecordingStateMachine::new();
        sm.apply_change(&"a".to_string());
        sm.apply_change(&"b".to_string());
        assert_eq!(sm.applied(), &["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn equal_histories_compare_equal() {
        let mut a = RecordingStateMachine::new();
        let mut b = RecordingStateMachine::new();
        a.apply_change(&"x".to_string());
        b.apply_change(&"x".to_string());
        assert_eq!(a, b);
    }
}
