//! A reusable Raft consensus core
//!
//! Implements the Raft algorithm (Ongaro & Ousterhout, 2014) as a
//! per-member engine parameterized over an application state machine:
//! leader election, log replication, snapshot-based compaction, and
//! on-line reconfiguration via joint consensus. Networking and durable
//! storage stay outside the crate, reached through the `Transport` and
//! `Storage` ports; an in-memory network and storage are provided for
//! testing.

pub mod core;
pub mod state_machine;
pub mod storage;
pub mod transport;

/// Testing utilities for integration tests.
pub mod testing;
