//! Storage layer for persistent state
//!
//! - `Storage`: the write-through port the core persists through
//! - `MemoryStorage`: in-memory record for testing
//! - `FileStorage`: single-file record with a CRC32 checksum

pub mod file;
pub mod memory;
pub mod traits;

pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use traits::{Storage, StorageError};
