//! Epochs: contiguous height ranges under fixed consensus parameters.

use crate::CodecError;
use serde::{Deserialize, Serialize};

/// Consensus parameters fixed for the duration of an epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusParams {
    /// Heights between stable checkpoints.
    pub checkpoint_period: u64,
    /// Per-batch transaction cap.
    pub block_max_tx_num: u64,
    /// Whether the empty-block timer runs.
    pub enable_timed_gen_empty_block: bool,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            checkpoint_period: 10,
            block_max_tx_num: 500,
            enable_timed_gen_empty_block: false,
        }
    }
}

/// An epoch: a contiguous range of heights under a fixed validator set
/// and consensus parameters. Supplied by the epoch provider on rollover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochInfo {
    pub epoch: u64,
    pub start_block: u64,
    pub epoch_period: u64,
    pub consensus_params: ConsensusParams,
}

impl EpochInfo {
    /// Last height covered by this epoch.
    pub fn end_block(&self) -> u64 {
        self.start_block + self.epoch_period - 1
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(|e| CodecError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

impl Default for EpochInfo {
    fn default() -> Self {
        Self {
            epoch: 1,
            start_block: 1,
            epoch_period: 100,
            consensus_params: ConsensusParams::default(),
        }
    }
}

/// Whether committing `height` finishes the given epoch.
pub fn need_change_epoch(height: u64, epoch: &EpochInfo) -> bool {
    height == epoch.end_block()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_boundary_detection() {
        let epoch = EpochInfo {
            epoch: 1,
            start_block: 1,
            epoch_period: 100,
            consensus_params: ConsensusParams::default(),
        };
        assert!(!need_change_epoch(99, &epoch));
        assert!(need_change_epoch(100, &epoch));
        assert!(!need_change_epoch(101, &epoch));
    }

    #[test]
    fn encode_round_trip() {
        let epoch = EpochInfo::default();
        let decoded = EpochInfo::decode(&epoch.encode().unwrap()).unwrap();
        assert_eq!(epoch, decoded);
    }
}
