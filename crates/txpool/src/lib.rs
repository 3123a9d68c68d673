//! Transaction pool, pre-check and local tx journal.
//!
//! The pool keeps per-account nonce-ordered maps: the lowest contiguous
//! run above the account's committed nonce is the **pending** set, the
//! rest is the **queue** waiting for gap fill. Batches are formed from
//! pending transactions in admission order and evicted at stable
//! checkpoints.
//!
//! Access is serialized through the engine's event loop; the pool has no
//! internal locking. The pre-check worker and the journal writer run as
//! their own tasks and talk to the serializer over channels.

mod config;
mod pool;
mod precheck;
mod records;

pub use config::{AccountNonceFn, PoolConfig};
pub use pool::TxPool;
pub use precheck::{check_transaction, TxPreChecker, UncheckedTx};
pub use records::{load_records, TxRecords, TX_RECORDS_FILE};
