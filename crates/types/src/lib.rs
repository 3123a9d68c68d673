//! Foundation types for the palisade consensus core.
//!
//! This crate provides the types shared by the transaction pool, the
//! ordering engines and the state ledger:
//!
//! - **Primitives**: [`Hash`], [`Address`]
//! - **Transactions**: [`SignedTransaction`] and the [`PoolTransaction`]
//!   capability trait the pool is generic over
//! - **Consensus types**: [`Block`], [`RequestBatch`], [`EpochInfo`],
//!   [`ValidatorSet`]
//! - **Wire**: the peer [`NetworkMessage`] envelope and the shared
//!   length-prefixed [`frame`] format
//!
//! # Design Philosophy
//!
//! This crate is self-contained and does not depend on any other
//! workspace crate, making it the foundation layer.

mod batch;
mod block;
mod epoch;
mod hash;
mod transaction;
mod validator;
mod wire;

pub mod frame;

pub use batch::{batch_digest, BatchTrigger, RequestBatch};
pub use block::{Block, BlockHeader, ChainState, CommitEvent};
pub use epoch::{need_change_epoch, ConsensusParams, EpochInfo};
pub use hash::{Address, Hash, HexError};
pub use transaction::{PoolTransaction, SignedTransaction, MAX_TX_PAYLOAD_SIZE};
pub use validator::{ValidatorInfo, ValidatorSet};
pub use wire::{MessageType, NetworkMessage, WIRE_VERSION};

use thiserror::Error;

/// Errors from marshalling or unmarshalling a type.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("frame truncated: expected {expected} bytes, got {got}")]
    TruncatedFrame { expected: usize, got: usize },
}

/// Test utilities shared by downstream crates.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use super::*;
    use ed25519_dalek::SigningKey;

    /// A deterministic signing key derived from a seed byte.
    pub fn test_key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    /// A signed transaction from the account behind `key` with the given nonce.
    pub fn test_tx(key: &SigningKey, nonce: u64) -> SignedTransaction {
        SignedTransaction::sign(1, nonce, 1_000, 50_000, 0, vec![0xca, 0xfe], key)
    }

    /// A signed transaction with an explicit gas price (for replacement tests).
    pub fn test_tx_with_price(key: &SigningKey, nonce: u64, gas_price: u64) -> SignedTransaction {
        SignedTransaction::sign(1, nonce, gas_price, 50_000, 0, vec![0xca, 0xfe], key)
    }
}
