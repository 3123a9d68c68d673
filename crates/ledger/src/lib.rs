//! State ledger snapshot and archival pipeline.
//!
//! The state ledger keeps the world state in a content-addressed trie
//! over a KV backend. This crate provides the pieces consensus relies on
//! at checkpoint boundaries:
//!
//! - [`kv`]: the `Storage`/`StorageBatch` contract with RocksDB and
//!   in-memory backends
//! - [`trie`]: trie nodes, a streaming bounded iterator and structural
//!   verification
//! - [`snapshot`]: full-trie export, flat leaf-only snapshots and the
//!   snapshot meta envelope
//! - [`archive`]: the per-block archive cycle with periodic snapshot
//!   rotation into dated directories
//!
//! All traversals are idempotently re-runnable from any height in the
//! history range; a failed run abandons its batch-in-flight and can
//! simply be retried.

pub mod archive;
pub mod kv;
pub mod snapshot;
pub mod trie;
pub mod utils;

pub use archive::{Archiver, StateJournal, TrieJournalEntry};
pub use kv::{MemoryStorage, RocksDbStorage, Storage, StorageBackend, StorageBatch, StorageError};
pub use snapshot::{
    generate_snapshot, get_snapshot_meta, iterate_trie, spawn_generate_snapshot,
    spawn_iterate_trie, verify_trie, SnapshotError, SnapshotMeta, StateAccount,
};
pub use trie::{IteratedNode, TrieBuilder, TrieError, TrieIterator, TrieNode};
