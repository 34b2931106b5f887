//! Log slice: the in-memory log atop a snapshot prefix
//!
//! A `LogSlice` represents the suffix of the logical log strictly after
//! `prev_index`. It shows up in two places: in each member's persistent
//! state, where `(prev_index, prev_term)` are the last index and term
//! folded into the snapshot, and inside an AppendEntries request, where
//! they are the consistency-check point preceding the carried entries.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::core::types::{LogEntry, LogIndex, Term};
use crate::state_machine::StateMachine;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct LogSlice<M: StateMachine> {
    /// Index of the entry immediately before this slice.
    pub prev_index: LogIndex,
    /// Term of the entry at `prev_index`.
    pub prev_term: Term,
    /// Entries at indexes `prev_index + 1 ..= prev_index + entries.len()`.
    pub entries: VecDeque<LogEntry<M>>,
}

impl<M: StateMachine> LogSlice<M> {
    /// An empty slice based at the given point.
    pub fn new(prev_index: LogIndex, prev_term: Term) -> Self {
        LogSlice {
            prev_index,
            prev_term,
            entries: VecDeque::new(),
        }
    }

    /// The latest index present, or the base index if the slice is empty.
    pub fn latest_index(&self) -> LogIndex {
        self.prev_index + self.entries.len() as u64
    }

    /// The term of the latest entry, or the base term if empty.
    pub fn latest_term(&self) -> Term {
        self.entries.back().map_or(self.prev_term, |e| e.term)
    }

    /// Term of the entry at `index`. Defined for
    /// `prev_index <= index <= latest_index()`; anything else is a
    /// programming error.
    pub fn entry_term(&self, index: LogIndex) -> Term {
        assert!(
            index >= self.prev_index,
            "log does not reach back to index {index} (base {})",
            self.prev_index
        );
        if index == self.prev_index {
            self.prev_term
        } else {
            self.entry(index).term
        }
    }

    /// The entry at `index`. Defined only for entries actually present,
    /// `prev_index < index <= latest_index()`.
    pub fn entry(&self, index: LogIndex) -> &LogEntry<M> {
        assert!(
            index > self.prev_index,
            "entry {index} is folded into the snapshot (base {})",
            self.prev_index
        );
        assert!(
            index <= self.latest_index(),
            "log does not reach forward to index {index} (latest {})",
            self.latest_index()
        );
        &self.entries[(index - self.prev_index - 1) as usize]
    }

    /// Delete the entry at `index` and everything after it.
    pub fn truncate_from(&mut self, index: LogIndex) {
        assert!(
            index > self.prev_index && index <= self.latest_index(),
            "cannot truncate from index {index} (base {}, latest {})",
            self.prev_index,
            self.latest_index()
        );
        self.entries.truncate((index - self.prev_index - 1) as usize);
    }

    /// Fold entries `prev_index + 1 ..= index` into the snapshot boundary,
    /// advancing `prev_index`/`prev_term`. The caller is responsible for
    /// updating the snapshot state alongside.
    pub fn compact_to(&mut self, index: LogIndex) {
        assert!(
            index > self.prev_index && index <= self.latest_index(),
            "cannot compact to index {index} (base {}, latest {})",
            self.prev_index,
            self.latest_index()
        );
        let term = self.entry_term(index);
        self.entries.drain(..(index - self.prev_index) as usize);
        self.prev_index = index;
        self.prev_term = term;
    }

    /// Append one entry at `latest_index() + 1`.
    pub fn append(&mut self, entry: LogEntry<M>) {
        self.entries.push_back(entry);
    }

    /// Build the slice sent in an AppendEntries: up to `max` entries
    /// starting at `from`, based at `from - 1`. `max` of zero produces an
    /// empty slice (a heartbeat).
    pub fn window(&self, from: LogIndex, max: usize) -> LogSlice<M> {
        assert!(
            from > self.prev_index && from <= self.latest_index() + 1,
            "window start {from} out of range (base {}, latest {})",
            self.prev_index,
            self.latest_index()
        );
        let mut window = LogSlice::new(from - 1, self.entry_term(from - 1));
        let top = self.latest_index().min(from.saturating_add(max as u64).saturating_sub(1));
        for index in from..=top {
            window.append(self.entry(index).clone());
        }
        window
    }
}
