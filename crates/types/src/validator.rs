//! Validator set membership.

use crate::{Address, CodecError};
use serde::{Deserialize, Serialize};

/// One replica in the validator set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorInfo {
    pub id: u64,
    pub account: Address,
    pub public_key: [u8; 32],
}

/// The replicas participating in agreement for the current epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ValidatorSet {
    pub validators: Vec<ValidatorInfo>,
}

impl ValidatorSet {
    pub fn new(validators: Vec<ValidatorInfo>) -> Self {
        Self { validators }
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Byzantine quorum for this set: with `n` replicas tolerating
    /// `f = (n - 1) / 3` faults, agreement needs `ceil((n + f + 1) / 2)`.
    pub fn quorum(&self) -> u64 {
        let n = self.validators.len() as u64;
        if n == 0 {
            return 0;
        }
        let f = (n - 1) / 3;
        (n + f + 2) / 2
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(|e| CodecError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
