//! Blocks and the executor-facing commit/report types.

use crate::{Address, CodecError, Hash, SignedTransaction};
use serde::{Deserialize, Serialize};

/// Header of an ordered block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BlockHeader {
    pub number: u64,
    /// Block timestamp in seconds since the Unix epoch.
    pub timestamp: i64,
    pub epoch: u64,
    pub proposer_account: Address,
    pub parent_hash: Hash,
    pub state_root: Hash,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash {
        // Header fields are plain integers and fixed arrays; encoding cannot fail.
        Hash::digest(&bincode::serialize(self).expect("header encoding"))
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(|e| CodecError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// An ordered block handed to the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<SignedTransaction>,
}

impl Block {
    pub fn height(&self) -> u64 {
        self.header.number
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }
}

/// Emitted on the commit stream once a block is ordered.
///
/// `local_list[i]` records whether `block.transactions[i]` originated on
/// this node, so the executor can resolve local submitters.
#[derive(Debug, Clone)]
pub struct CommitEvent {
    pub block: Block,
    pub local_list: Vec<bool>,
}

/// Post-commit notification from the executor back into the engine.
#[derive(Debug, Clone)]
pub struct ChainState {
    pub height: u64,
    pub block_hash: Hash,
    pub tx_hash_list: Vec<Hash>,
    pub epoch_changed: bool,
}
