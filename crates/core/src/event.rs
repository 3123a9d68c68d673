//! Tagged events consumed by the serializer task.

use crate::{PoolError, PrecheckError, TimerId};
use palisade_types::{BatchTrigger, ChainState, SignedTransaction};
use tokio::sync::oneshot;

/// All inputs the serializer task can receive.
///
/// Events are posted by clients, the pre-check worker, timers, the pool
/// threshold notifier and the executor; the serializer processes them
/// strictly in arrival order.
#[derive(Debug)]
pub enum ConsensusEvent {
    /// A client transaction entering through `prepare`.
    ///
    /// `check_resp` resolves the stateless pre-check; `pool_resp`
    /// resolves pool admission. Both fire before `prepare` returns.
    LocalTx {
        tx: SignedTransaction,
        check_resp: oneshot::Sender<Result<(), PrecheckError>>,
        pool_resp: oneshot::Sender<Result<(), PoolError>>,
    },

    /// A transaction that passed pre-check, posted back by the worker
    /// for pool admission on the serializer.
    CheckedTx {
        tx: SignedTransaction,
        pool_resp: oneshot::Sender<Result<(), PoolError>>,
    },

    /// Marshalled transactions pushed by a peer.
    RemoteTxs { raw: Vec<Vec<u8>> },

    /// Post-commit notification from the executor.
    ChainState(ChainState),

    /// A batch timer expired. May be spurious after a stop; the
    /// serializer re-checks pool state before acting.
    Timeout(TimerId),

    /// Pool-level threshold signal (e.g. the per-batch tx cap was hit).
    GenBatchReq(BatchTrigger),

    /// Query: the agreement log low watermark (= last executed height).
    LowWatermarkReq { resp: oneshot::Sender<u64> },
}

impl ConsensusEvent {
    /// Event type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            ConsensusEvent::LocalTx { .. } => "LocalTx",
            ConsensusEvent::CheckedTx { .. } => "CheckedTx",
            ConsensusEvent::RemoteTxs { .. } => "RemoteTxs",
            ConsensusEvent::ChainState(_) => "ChainState",
            ConsensusEvent::Timeout(_) => "Timeout",
            ConsensusEvent::GenBatchReq(_) => "GenBatchReq",
            ConsensusEvent::LowWatermarkReq { .. } => "LowWatermarkReq",
        }
    }
}
