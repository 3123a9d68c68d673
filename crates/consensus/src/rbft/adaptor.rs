//! Host adaptor the agreement library runs against.

use super::agreement::{AgreementHost, ConfChange, ExecuteContext};
use crate::PeerManager;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use palisade_core::EngineError;
use palisade_ledger::Storage;
use palisade_types::{Hash, NetworkMessage, ValidatorSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Namespace for agreement state in the consensus KV.
const STATE_KEY_PREFIX: &[u8] = b"consensus.";

/// State-transfer progress: `Live`, or catching up to a target height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferState {
    Live,
    StateUpdating { target: u64 },
}

/// Implements every surface the agreement library depends on: network
/// send, stable storage, signatures, state transfer and execution
/// hand-off.
///
/// Ordered batches are published on a ready channel the engine's
/// serializer consumes; during state transfer, out-of-range heights are
/// silently dropped.
pub struct RbftAdaptor {
    network: Arc<dyn PeerManager>,
    storage: Arc<dyn Storage>,
    signing_key: SigningKey,
    validators: ValidatorSet,
    ready_tx: mpsc::Sender<ExecuteContext>,
    transfer: Mutex<TransferState>,
    last_published: AtomicU64,
    apply_conf_change: OnceLock<Box<dyn Fn(ConfChange) + Send + Sync>>,
}

impl RbftAdaptor {
    pub fn new(
        network: Arc<dyn PeerManager>,
        storage: Arc<dyn Storage>,
        signing_key: SigningKey,
        validators: ValidatorSet,
        applied_height: u64,
        ready_tx: mpsc::Sender<ExecuteContext>,
    ) -> Self {
        Self {
            network,
            storage,
            signing_key,
            validators,
            ready_tx,
            transfer: Mutex::new(TransferState::Live),
            last_published: AtomicU64::new(applied_height),
            apply_conf_change: OnceLock::new(),
        }
    }

    /// Second phase of construction: wire the conf-change entry point
    /// once the agreement node exists.
    pub fn set_apply_conf_change<F>(&self, apply: F)
    where
        F: Fn(ConfChange) + Send + Sync + 'static,
    {
        if self.apply_conf_change.set(Box::new(apply)).is_err() {
            warn!("Conf-change hook already wired");
        }
    }

    /// Forward a membership change into the agreement node.
    pub fn apply_conf_change(&self, change: ConfChange) {
        match self.apply_conf_change.get() {
            Some(apply) => apply(change),
            None => error!(?change, "Conf change before hook wiring, dropped"),
        }
    }

    pub fn is_state_updating(&self) -> bool {
        matches!(
            *self.transfer.lock().expect("transfer lock"),
            TransferState::StateUpdating { .. }
        )
    }

    pub fn state_update_height(&self) -> Option<u64> {
        match *self.transfer.lock().expect("transfer lock") {
            TransferState::Live => None,
            TransferState::StateUpdating { target } => Some(target),
        }
    }

    /// Reopen the live flow once the executor has reported the target
    /// height.
    pub fn finish_state_update(&self, height: u64) {
        *self.transfer.lock().expect("transfer lock") = TransferState::Live;
        self.last_published.store(height, Ordering::SeqCst);
        info!(height, "State transfer finished");
    }

    fn state_key(key: &[u8]) -> Vec<u8> {
        let mut namespaced = STATE_KEY_PREFIX.to_vec();
        namespaced.extend_from_slice(key);
        namespaced
    }
}

impl AgreementHost for RbftAdaptor {
    fn broadcast(&self, msg: Vec<u8>) {
        if let Err(e) = self.network.broadcast(NetworkMessage::consensus(msg)) {
            warn!(error = %e, "Consensus broadcast failed");
        }
    }

    fn unicast(&self, to: u64, msg: Vec<u8>) {
        if let Err(e) = self.network.unicast(to, NetworkMessage::consensus(msg)) {
            warn!(to, error = %e, "Consensus unicast failed");
        }
    }

    fn persist(&self, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        self.storage
            .put(&Self::state_key(key), value)
            .map_err(|e| EngineError::Internal(e.to_string()))
    }

    fn read_state(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.storage.get(&Self::state_key(key))
    }

    fn sign(&self, digest: &[u8]) -> Vec<u8> {
        self.signing_key.sign(digest).to_bytes().to_vec()
    }

    fn verify(&self, node_id: u64, digest: &[u8], signature: &[u8]) -> bool {
        let Some(validator) = self.validators.validators.iter().find(|v| v.id == node_id) else {
            return false;
        };
        let Ok(key) = VerifyingKey::from_bytes(&validator.public_key) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
            return false;
        };
        key.verify(digest, &Signature::from_bytes(&sig_bytes)).is_ok()
    }

    fn state_update(&self, target_height: u64, digest: Hash, peers: Vec<u64>) {
        info!(target_height, %digest, ?peers, "State transfer requested");
        *self.transfer.lock().expect("transfer lock") =
            TransferState::StateUpdating { target: target_height };
        // Catch-up itself runs in the executor/sync path; the executor
        // reports the target height back through `ReportState`.
    }

    fn execute(&self, batch: ExecuteContext) {
        if self.is_state_updating() {
            debug!(height = batch.height, "Dropping execute during state transfer");
            return;
        }
        let expected = self.last_published.load(Ordering::SeqCst) + 1;
        if batch.height != expected {
            error!(
                height = batch.height,
                expected, "Out-of-order execute from agreement, dropped"
            );
            return;
        }
        self.last_published.store(batch.height, Ordering::SeqCst);
        if let Err(e) = self.ready_tx.try_send(batch) {
            error!(error = %e, "Ready channel rejected executed batch");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_ledger::MemoryStorage;
    use palisade_types::{Address, ValidatorInfo};

    struct NullNetwork;
    impl PeerManager for NullNetwork {
        fn broadcast(&self, _msg: NetworkMessage) -> Result<(), EngineError> {
            Ok(())
        }
        fn unicast(&self, _to: u64, _msg: NetworkMessage) -> Result<(), EngineError> {
            Ok(())
        }
        fn count_connected_peers(&self) -> u64 {
            0
        }
    }

    fn adaptor(applied: u64) -> (RbftAdaptor, mpsc::Receiver<ExecuteContext>) {
        let key = SigningKey::from_bytes(&[9; 32]);
        let validators = ValidatorSet::new(vec![ValidatorInfo {
            id: 1,
            account: Address::ZERO,
            public_key: key.verifying_key().to_bytes(),
        }]);
        let (ready_tx, ready_rx) = mpsc::channel(16);
        let adaptor = RbftAdaptor::new(
            Arc::new(NullNetwork),
            Arc::new(MemoryStorage::new()),
            key,
            validators,
            applied,
            ready_tx,
        );
        (adaptor, ready_rx)
    }

    fn context(height: u64) -> ExecuteContext {
        ExecuteContext {
            batch_hash: Hash::digest(&height.to_le_bytes()),
            txs: vec![],
            local_list: vec![],
            height,
            timestamp: 0,
        }
    }

    #[test]
    fn persist_and_read_are_namespaced() {
        let (adaptor, _rx) = adaptor(0);
        adaptor.persist(b"view", b"3").unwrap();
        assert_eq!(adaptor.read_state(b"view"), Some(b"3".to_vec()));
        // The raw key is not visible outside the namespace.
        assert!(adaptor.storage.get(b"view").is_none());
        assert!(adaptor.storage.get(b"consensus.view").is_some());
    }

    #[test]
    fn sign_verify_round_trip() {
        let (adaptor, _rx) = adaptor(0);
        let signature = adaptor.sign(b"digest");
        assert!(adaptor.verify(1, b"digest", &signature));
        assert!(!adaptor.verify(1, b"other", &signature));
        assert!(!adaptor.verify(42, b"digest", &signature));
    }

    #[tokio::test]
    async fn execute_enforces_height_order() {
        let (adaptor, mut ready_rx) = adaptor(0);
        adaptor.execute(context(1));
        // A gap is dropped.
        adaptor.execute(context(3));
        adaptor.execute(context(2));

        assert_eq!(ready_rx.recv().await.unwrap().height, 1);
        assert_eq!(ready_rx.recv().await.unwrap().height, 2);
        assert!(ready_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn execute_dropped_during_state_transfer() {
        let (adaptor, mut ready_rx) = adaptor(0);
        adaptor.state_update(10, Hash::ZERO, vec![1, 2]);
        assert!(adaptor.is_state_updating());
        assert_eq!(adaptor.state_update_height(), Some(10));

        adaptor.execute(context(1));
        assert!(ready_rx.try_recv().is_err());

        adaptor.finish_state_update(10);
        assert!(!adaptor.is_state_updating());
        adaptor.execute(context(11));
        assert_eq!(ready_rx.recv().await.unwrap().height, 11);
    }

    #[test]
    fn conf_change_requires_wiring() {
        let (adaptor, _rx) = adaptor(0);
        // Dropped silently before wiring.
        adaptor.apply_conf_change(ConfChange { node_id: 7 });

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        adaptor.set_apply_conf_change(move |change| {
            sink.lock().unwrap().push(change.node_id);
        });
        adaptor.apply_conf_change(ConfChange { node_id: 7 });
        assert_eq!(*seen.lock().unwrap(), vec![7]);
    }
}
