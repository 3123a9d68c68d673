//! Pool configuration.

use palisade_types::Address;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Resolves an account's committed nonce from the state ledger.
pub type AccountNonceFn = Arc<dyn Fn(&Address) -> u64 + Send + Sync>;

/// Transaction pool configuration.
#[derive(Clone)]
pub struct PoolConfig {
    /// Cap on total pooled transactions.
    pub pool_size: usize,
    /// Per-batch transaction cap.
    pub batch_size: usize,
    /// Whether the byte cap on batch payloads applies.
    pub batch_mem_limit: bool,
    /// Byte cap on a batch payload.
    pub batch_max_mem: usize,
    /// Max nonce gap accepted into the queue.
    pub tolerance_nonce_gap: u64,
    /// Age after which a remote transaction is eligible for removal.
    pub tolerance_time: Duration,
    /// Age after which any stale transaction is evicted.
    pub tolerance_remove_time: Duration,
    /// Journal rotation period.
    pub rotate_tx_locals_interval: Duration,
    /// Whether local transactions are journaled.
    pub enable_locals_persist: bool,
    /// Directory holding the journal file.
    pub repo_root: PathBuf,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 50_000,
            batch_size: 500,
            batch_mem_limit: false,
            batch_max_mem: 2 * 1024 * 1024,
            tolerance_nonce_gap: 1_000,
            tolerance_time: Duration::from_secs(300),
            tolerance_remove_time: Duration::from_secs(15 * 60),
            rotate_tx_locals_interval: Duration::from_secs(3600),
            enable_locals_persist: true,
            repo_root: PathBuf::from("."),
        }
    }
}
