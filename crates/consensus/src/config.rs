//! Engine configuration.

use crate::PeerManager;
use ed25519_dalek::SigningKey;
use palisade_core::EngineError;
use palisade_txpool::{AccountNonceFn, PoolConfig};
use palisade_types::{EpochInfo, Hash, ValidatorSet};
use std::sync::Arc;
use std::time::Duration;

/// Fetches the current epoch from the governance source of truth.
pub type EpochProviderFn = Arc<dyn Fn() -> Result<EpochInfo, EngineError> + Send + Sync>;

/// Configuration shared by both ordering engines.
#[derive(Clone)]
pub struct ConsensusConfig {
    pub chain_id: u64,
    /// Node key: signs adaptor digests and names the proposer account.
    pub signing_key: SigningKey,
    pub pool: PoolConfig,
    /// Generate-block period.
    pub batch_timeout: Duration,
    /// Empty-block period.
    pub no_tx_batch_timeout: Duration,
    /// Client `prepare` deadline.
    pub prepare_timeout: Duration,
    /// Last applied block on startup.
    pub applied_height: u64,
    pub applied_digest: Hash,
    pub validators: ValidatorSet,
    pub network: Arc<dyn PeerManager>,
    pub get_current_epoch: EpochProviderFn,
    pub get_account_nonce: AccountNonceFn,
}

impl ConsensusConfig {
    /// Sweep period for housekeeping (stale eviction) inside the
    /// serializer.
    pub(crate) fn stale_sweep_interval(&self) -> Duration {
        // Sweeping at a quarter of the eviction age keeps the error
        // bounded without a dedicated timer per entry.
        (self.pool.tolerance_time / 4).max(Duration::from_secs(1))
    }
}
