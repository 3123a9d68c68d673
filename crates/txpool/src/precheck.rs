//! Stateless transaction pre-check.
//!
//! Runs on its own worker pool so the serializer never blocks on
//! signature verification. Transactions that pass are posted back into
//! the serializer for pool admission, carrying the submitter's response
//! channel with them.

use palisade_core::{ConsensusEvent, PoolError, PrecheckError};
use palisade_types::{SignedTransaction, MAX_TX_PAYLOAD_SIZE};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace};

/// Channel depth for unchecked transactions.
const PRECHECK_CHAN_SIZE: usize = 1_024;
/// Workers verifying signatures in parallel.
const PRECHECK_WORKERS: usize = 4;

/// A client transaction awaiting pre-check.
#[derive(Debug)]
pub struct UncheckedTx {
    pub tx: SignedTransaction,
    pub check_resp: oneshot::Sender<Result<(), PrecheckError>>,
    pub pool_resp: oneshot::Sender<Result<(), PoolError>>,
}

/// Run the stateless checks on one transaction.
pub fn check_transaction(tx: &SignedTransaction, chain_id: u64) -> Result<(), PrecheckError> {
    if tx.chain_id != chain_id {
        return Err(PrecheckError::WrongChainId);
    }
    if tx.value < 0 {
        return Err(PrecheckError::ValueNegative);
    }
    if tx.payload.len() > MAX_TX_PAYLOAD_SIZE {
        return Err(PrecheckError::OversizedPayload);
    }
    if tx.gas_limit < tx.intrinsic_gas() {
        return Err(PrecheckError::IntrinsicGasTooLow);
    }
    if !tx.verify_signature() {
        return Err(PrecheckError::BadSignature);
    }
    Ok(())
}

/// Handle to the pre-check worker pool.
pub struct TxPreChecker {
    unchecked_tx: mpsc::Sender<UncheckedTx>,
}

impl TxPreChecker {
    /// Spawn the workers. Checked transactions are posted to `event_tx`
    /// as [`ConsensusEvent::CheckedTx`].
    pub fn spawn(
        chain_id: u64,
        event_tx: mpsc::Sender<ConsensusEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (unchecked_tx, unchecked_rx) = mpsc::channel::<UncheckedTx>(PRECHECK_CHAN_SIZE);
        let unchecked_rx = Arc::new(tokio::sync::Mutex::new(unchecked_rx));

        for worker in 0..PRECHECK_WORKERS {
            let unchecked_rx = Arc::clone(&unchecked_rx);
            let event_tx = event_tx.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let unchecked = tokio::select! {
                        unchecked = async { unchecked_rx.lock().await.recv().await } => unchecked,
                        _ = shutdown.changed() => None,
                    };
                    let Some(UncheckedTx {
                        tx,
                        check_resp,
                        pool_resp,
                    }) = unchecked
                    else {
                        trace!(worker, "Pre-check worker exited");
                        return;
                    };

                    match check_transaction(&tx, chain_id) {
                        Ok(()) => {
                            let _ = check_resp.send(Ok(()));
                            if event_tx
                                .send(ConsensusEvent::CheckedTx { tx, pool_resp })
                                .await
                                .is_err()
                            {
                                trace!(worker, "Serializer gone, dropping checked tx");
                            }
                        }
                        Err(reason) => {
                            debug!(%reason, "Transaction failed pre-check");
                            let _ = check_resp.send(Err(reason));
                            // pool_resp is dropped: admission never ran.
                        }
                    }
                }
            });
        }

        Self { unchecked_tx }
    }

    /// Hand a transaction to the workers. Fails only after shutdown,
    /// returning the transaction to the caller.
    pub async fn post(&self, unchecked: UncheckedTx) -> Result<(), UncheckedTx> {
        self.unchecked_tx.send(unchecked).await.map_err(|e| e.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_types::test_utils::{test_key, test_tx};

    #[test]
    fn valid_tx_passes() {
        let key = test_key(1);
        assert_eq!(check_transaction(&test_tx(&key, 1), 1), Ok(()));
    }

    #[test]
    fn wrong_chain_id_rejected() {
        let key = test_key(1);
        assert_eq!(
            check_transaction(&test_tx(&key, 1), 2),
            Err(PrecheckError::WrongChainId)
        );
    }

    #[test]
    fn negative_value_rejected() {
        let key = test_key(1);
        let tx = SignedTransaction::sign(1, 1, 1_000, 50_000, -5, vec![], &key);
        assert_eq!(
            check_transaction(&tx, 1),
            Err(PrecheckError::ValueNegative)
        );
    }

    #[test]
    fn oversized_payload_rejected() {
        let key = test_key(1);
        let tx = SignedTransaction::sign(
            1,
            1,
            1_000,
            u64::MAX,
            0,
            vec![0xab; MAX_TX_PAYLOAD_SIZE + 1],
            &key,
        );
        assert_eq!(
            check_transaction(&tx, 1),
            Err(PrecheckError::OversizedPayload)
        );
    }

    #[test]
    fn low_gas_rejected() {
        let key = test_key(1);
        let tx = SignedTransaction::sign(1, 1, 1_000, 21_000, 0, vec![1, 2, 3], &key);
        assert_eq!(
            check_transaction(&tx, 1),
            Err(PrecheckError::IntrinsicGasTooLow)
        );
    }

    #[test]
    fn bad_signature_rejected() {
        let key = test_key(1);
        let mut tx = test_tx(&key, 1);
        tx.signature[0] ^= 0x01;
        assert_eq!(
            check_transaction(&tx, 1),
            Err(PrecheckError::BadSignature)
        );
    }

    #[tokio::test]
    async fn worker_routes_pass_and_fail() {
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let checker = TxPreChecker::spawn(1, event_tx, shutdown_rx);
        let key = test_key(2);

        // Passing tx: check resolves Ok and a CheckedTx event appears.
        let (check_tx, check_rx) = oneshot::channel();
        let (pool_tx, _pool_rx) = oneshot::channel();
        checker
            .post(UncheckedTx {
                tx: test_tx(&key, 1),
                check_resp: check_tx,
                pool_resp: pool_tx,
            })
            .await
            .unwrap();
        assert_eq!(check_rx.await.unwrap(), Ok(()));
        let event = event_rx.recv().await.unwrap();
        assert!(matches!(event, ConsensusEvent::CheckedTx { .. }));

        // Failing tx: rejection comes back on the check channel only.
        let (check_tx, check_rx) = oneshot::channel();
        let (pool_tx, pool_rx) = oneshot::channel();
        let mut bad = test_tx(&key, 2);
        bad.signature[0] ^= 0x01;
        checker
            .post(UncheckedTx {
                tx: bad,
                check_resp: check_tx,
                pool_resp: pool_tx,
            })
            .await
            .unwrap();
        assert_eq!(check_rx.await.unwrap(), Err(PrecheckError::BadSignature));
        assert!(pool_rx.await.is_err(), "pool channel dropped on check fail");
    }
}
