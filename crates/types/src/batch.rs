//! Request batches: ordered transaction sets proposed for one block height.

use crate::{Hash, PoolTransaction};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Why a batch is being formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchTrigger {
    /// The pool reached the per-batch transaction cap.
    Size,
    /// The batch timer expired.
    Timeout,
    /// The empty-block timer expired.
    NoTxTimeout,
}

/// Deterministic batch digest over the formation timestamp and the
/// ordered transaction hash list.
///
/// The digest is the batch's identity across the agreement protocol and
/// the pool's eviction path, so it must not depend on anything assigned
/// later (such as the committed height).
pub fn batch_digest<I>(tx_hashes: I, timestamp: i64) -> Hash
where
    I: IntoIterator<Item = Hash>,
{
    let mut hasher = Sha256::new();
    hasher.update(timestamp.to_le_bytes());
    for hash in tx_hashes {
        hasher.update(hash.as_bytes());
    }
    Hash::from_bytes(hasher.finalize().into())
}

/// An immutable, ordered set of transactions proposed for a single height.
#[derive(Debug, Clone)]
pub struct RequestBatch<T: PoolTransaction> {
    pub batch_hash: Hash,
    pub tx_list: Vec<Arc<T>>,
    pub local_flags: Vec<bool>,
    /// Formation timestamp in nanoseconds since the Unix epoch.
    pub timestamp: i64,
    /// Height the proposer formed the batch for.
    pub height: u64,
}

impl<T: PoolTransaction> RequestBatch<T> {
    pub fn new(tx_list: Vec<Arc<T>>, local_flags: Vec<bool>, height: u64, timestamp: i64) -> Self {
        debug_assert_eq!(tx_list.len(), local_flags.len());
        let batch_hash = batch_digest(tx_list.iter().map(|tx| tx.hash()), timestamp);
        Self {
            batch_hash,
            tx_list,
            local_flags,
            timestamp,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tx_list.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tx_list.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_key, test_tx};

    #[test]
    fn digest_depends_on_order_and_timestamp() {
        let key = test_key(1);
        let a = test_tx(&key, 1).hash();
        let b = test_tx(&key, 2).hash();

        let fwd = batch_digest([a, b], 5);
        let rev = batch_digest([b, a], 5);
        let other_time = batch_digest([a, b], 6);

        assert_ne!(fwd, rev);
        assert_ne!(fwd, other_time);
        assert_eq!(fwd, batch_digest([a, b], 5));
    }

    #[test]
    fn empty_batches_differ_by_timestamp() {
        let b1: RequestBatch<crate::SignedTransaction> = RequestBatch::new(vec![], vec![], 1, 10);
        let b2: RequestBatch<crate::SignedTransaction> = RequestBatch::new(vec![], vec![], 2, 20);
        assert_ne!(b1.batch_hash, b2.batch_hash);
        assert!(b1.is_empty());
    }
}
