//! Error taxonomy for the consensus core.
//!
//! Four classes of failure flow through the engines:
//!
//! - **Transient**: logged and retried on the originator's next tick
//!   (network sends, spurious timer fires). These never surface as types.
//! - **Rejection**: returned synchronously to the caller
//!   ([`PrecheckError`], [`PoolError`]).
//! - **State mismatch**: handled inside the agreement adaptor via state
//!   transfer; not visible at this layer.
//! - **Fatal**: KV corruption or protocol invariant violations abort the
//!   process with a last-gasp log.

use palisade_types::{CodecError, Hash};
use thiserror::Error;

/// Stateless pre-check rejections, surfaced to `prepare` callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PrecheckError {
    #[error("invalid signature")]
    BadSignature,

    #[error("wrong chain id")]
    WrongChainId,

    #[error("intrinsic gas too low")]
    IntrinsicGasTooLow,

    #[error("oversized payload")]
    OversizedPayload,

    #[error("negative value")]
    ValueNegative,
}

/// Pool admission rejections.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("pool is full")]
    PoolFull,

    #[error("nonce {nonce} too low, committed nonce is {committed}")]
    NonceTooLow { nonce: u64, committed: u64 },

    #[error("nonce {nonce} exceeds the tolerated gap from {next_pending}")]
    NonceGapTooLarge { nonce: u64, next_pending: u64 },

    #[error("duplicate transaction {0}")]
    Duplicate(Hash),

    #[error("replacement underpriced: offered {offered}, need at least {required}")]
    ReplaceUnderpriced { offered: u64, required: u64 },
}

/// Engine-level failures returned by the node API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("pre-check failed: {0}")]
    PreCheck(#[from] PrecheckError),

    #[error("pool admission failed: {0}")]
    Pool(#[from] PoolError),

    #[error("node not ready: {0}")]
    NotReady(String),

    #[error("consensus stopped")]
    Stopped,

    #[error("request timed out")]
    Timeout,

    #[error(transparent)]
    Decode(#[from] CodecError),

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("{0}")]
    Internal(String),
}

/// Batch-timer manager failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TimerError {
    #[error("unknown timer {0:?}")]
    Unknown(crate::TimerId),
}

/// Agreement engine status, as reported by `ready()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemStatus {
    Normal,
    InConfChange,
    InViewChange,
    InRecovery,
    StateTransferring,
    PoolFull,
    Pending,
    Stopped,
}

impl SystemStatus {
    pub fn is_normal(&self) -> bool {
        matches!(self, SystemStatus::Normal)
    }

    /// Long-form description used in `ready()` errors.
    pub fn describe(&self) -> &'static str {
        match self {
            SystemStatus::Normal => "Normal",
            SystemStatus::InConfChange => "system is in conf change",
            SystemStatus::InViewChange => "system is in view change",
            SystemStatus::InRecovery => "system is in recovery",
            SystemStatus::StateTransferring => "system is in state update",
            SystemStatus::PoolFull => "system is too busy",
            SystemStatus::Pending => "system is in pending state",
            SystemStatus::Stopped => "system is stopped",
        }
    }
}

impl std::fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_descriptions() {
        assert!(SystemStatus::Normal.is_normal());
        assert!(!SystemStatus::PoolFull.is_normal());
        assert_eq!(SystemStatus::StateTransferring.to_string(), "system is in state update");
    }
}
