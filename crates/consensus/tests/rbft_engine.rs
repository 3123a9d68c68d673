//! Replicated engine flow against a loopback agreement.

mod common;

use common::ConfigBuilder;
use palisade_consensus::rbft::{
    Agreement, AgreementHost, BatchProposal, ConfChange, ExecuteContext, RbftNode, ServiceState,
};
use palisade_consensus::ConsensusEngine;
use palisade_core::{EngineError, PoolError, SystemStatus};
use palisade_ledger::MemoryStorage;
use palisade_types::test_utils::{test_key, test_tx};
use palisade_types::{CommitEvent, Hash, MessageType, PoolTransaction, SignedTransaction};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Orders every proposal immediately: a one-replica stand-in for the
/// external agreement library, driving the host contract the way the
/// real protocol would.
struct LoopbackAgreement {
    host: Arc<dyn AgreementHost>,
    status: Mutex<SystemStatus>,
    next_height: AtomicU64,
    stepped: Mutex<Vec<Vec<u8>>>,
    executed_reports: Mutex<Vec<u64>>,
    state_updated_reports: Mutex<Vec<u64>>,
    stable_checkpoints: Mutex<Vec<u64>>,
    conf_changes: Mutex<Vec<ConfChange>>,
}

impl LoopbackAgreement {
    fn new(host: Arc<dyn AgreementHost>, applied: u64) -> Self {
        Self {
            host,
            status: Mutex::new(SystemStatus::Normal),
            next_height: AtomicU64::new(applied),
            stepped: Mutex::new(Vec::new()),
            executed_reports: Mutex::new(Vec::new()),
            state_updated_reports: Mutex::new(Vec::new()),
            stable_checkpoints: Mutex::new(Vec::new()),
            conf_changes: Mutex::new(Vec::new()),
        }
    }

    fn set_status(&self, status: SystemStatus) {
        *self.status.lock().unwrap() = status;
    }
}

impl Agreement for LoopbackAgreement {
    fn start(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn stop(&self) {}

    fn status(&self) -> SystemStatus {
        *self.status.lock().unwrap()
    }

    fn step(&self, msg: Vec<u8>) -> Result<(), EngineError> {
        self.stepped.lock().unwrap().push(msg);
        Ok(())
    }

    fn propose(&self, batch: BatchProposal) -> Result<(), EngineError> {
        let txs = batch
            .requests
            .iter()
            .map(|bytes| SignedTransaction::decode(bytes))
            .collect::<Result<Vec<_>, _>>()
            .map_err(EngineError::Decode)?;
        let height = self.next_height.fetch_add(1, Ordering::SeqCst) + 1;
        self.host.execute(ExecuteContext {
            batch_hash: batch.batch_hash,
            txs,
            local_list: batch.local_flags,
            height,
            timestamp: batch.timestamp,
        });
        Ok(())
    }

    fn report_executed(&self, state: ServiceState) {
        self.executed_reports.lock().unwrap().push(state.height);
    }

    fn report_state_updated(&self, state: ServiceState) {
        self.state_updated_reports.lock().unwrap().push(state.height);
    }

    fn report_stable_checkpoint_finished(&self, height: u64) {
        self.stable_checkpoints.lock().unwrap().push(height);
    }

    fn apply_conf_change(&self, change: ConfChange) {
        self.conf_changes.lock().unwrap().push(change);
    }
}

struct Fixture {
    node: Arc<RbftNode>,
    agreement: Arc<LoopbackAgreement>,
    network: Arc<common::MockNetwork>,
    commit_rx: mpsc::Receiver<CommitEvent>,
}

async fn start_fixture(dir: &TempDir, mut builder: ConfigBuilder) -> Fixture {
    builder.validators = 4;
    builder.connected_peers = 3;
    let (config, network) = builder.build(dir.path());
    let slot: Arc<Mutex<Option<Arc<LoopbackAgreement>>>> = Arc::new(Mutex::new(None));
    let slot_clone = Arc::clone(&slot);
    let node = RbftNode::start(config, Arc::new(MemoryStorage::new()), move |adaptor| {
        let agreement = Arc::new(LoopbackAgreement::new(adaptor, 0));
        *slot_clone.lock().unwrap() = Some(Arc::clone(&agreement));
        agreement
    })
    .await
    .unwrap();
    let agreement = slot.lock().unwrap().take().unwrap();
    let commit_rx = node.take_commit_receiver().unwrap();
    Fixture {
        node,
        agreement,
        network,
        commit_rx,
    }
}

async fn recv_commit(rx: &mut mpsc::Receiver<CommitEvent>, within: Duration) -> CommitEvent {
    tokio::time::timeout(within, rx.recv())
        .await
        .expect("commit within deadline")
        .expect("commit stream open")
}

#[tokio::test]
async fn prepare_orders_through_agreement_and_checkpoints() {
    let dir = TempDir::new().unwrap();
    let mut builder = ConfigBuilder::default();
    builder.epoch.consensus_params.checkpoint_period = 1;
    let mut fx = start_fixture(&dir, builder).await;

    // Startup reported the applied state to the library.
    assert_eq!(*fx.agreement.executed_reports.lock().unwrap(), vec![0]);

    let key = test_key(1);
    let tx = test_tx(&key, 1);
    fx.node.prepare(tx.clone()).await.unwrap();

    // The admitted tx was pushed to peers.
    let pushed = fx
        .network
        .broadcasts
        .lock()
        .unwrap()
        .iter()
        .filter(|m| m.msg_type == MessageType::PushTxs)
        .count();
    assert_eq!(pushed, 1);

    // The batch timer proposes; the loopback library orders at height 1.
    let commit = recv_commit(&mut fx.commit_rx, Duration::from_secs(2)).await;
    assert_eq!(commit.block.height(), 1);
    assert_eq!(commit.block.transactions[0].hash(), tx.hash());
    assert_eq!(commit.local_list, vec![true]);

    // Executor acknowledges; checkpoint period 1 → stable checkpoint
    // finished and the batch is evicted from the pool.
    fx.node.report_state(1, commit.block.hash(), vec![tx.hash()]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*fx.agreement.stable_checkpoints.lock().unwrap(), vec![1]);
    assert_eq!(
        fx.agreement.executed_reports.lock().unwrap().as_slice(),
        &[0, 1]
    );
    assert_eq!(fx.node.get_low_watermark().await.unwrap(), 1);

    // The evicted nonce is now committed.
    let err = fx.node.prepare(test_tx(&key, 1)).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Pool(PoolError::NonceTooLow { nonce: 1, committed: 1 })
    ));

    fx.node.stop();
}

#[tokio::test]
async fn quorum_and_status_surface() {
    let dir = TempDir::new().unwrap();
    let fx = start_fixture(&dir, ConfigBuilder::default()).await;

    // n = 4, f = 1 → quorum 3.
    assert_eq!(fx.node.quorum(), 3);
    assert!(fx.node.ready().is_ok());

    fx.agreement.set_status(SystemStatus::InViewChange);
    let err = fx.node.ready().unwrap_err();
    assert!(matches!(err, EngineError::NotReady(ref s) if s == "system is in view change"));

    fx.agreement.set_status(SystemStatus::PoolFull);
    let err = fx.node.prepare(test_tx(&test_key(2), 1)).await.unwrap_err();
    assert!(matches!(err, EngineError::NotReady(ref s) if s == "system is too busy"));

    fx.node.stop();
}

#[tokio::test]
async fn step_passes_the_payload_byte_exact() {
    let dir = TempDir::new().unwrap();
    let fx = start_fixture(&dir, ConfigBuilder::default()).await;

    let payload = vec![0x00, 0xff, 0x13, 0x37, 0x00];
    fx.node.step(payload.clone()).unwrap();
    assert_eq!(*fx.agreement.stepped.lock().unwrap(), vec![payload]);

    fx.node.stop();
}

#[tokio::test]
async fn state_transfer_suppresses_batches_and_reopens() {
    let dir = TempDir::new().unwrap();
    let mut fx = start_fixture(&dir, ConfigBuilder::default()).await;

    // The library requests catch-up to height 5.
    fx.node
        .adaptor()
        .state_update(5, Hash::digest(b"target"), vec![1, 2]);
    assert!(fx.node.adaptor().is_state_updating());

    // Pool has work, timers fire, but no batch is formed mid-transfer.
    let key = test_key(3);
    fx.node.prepare(test_tx(&key, 1)).await.unwrap();
    let quiet = tokio::time::timeout(Duration::from_millis(400), fx.commit_rx.recv()).await;
    assert!(quiet.is_err(), "no commit during state transfer");

    // Reports for intervening heights are ignored.
    fx.node.report_state(3, Hash::digest(b"mid"), vec![]);
    assert!(fx.node.adaptor().is_state_updating());
    assert!(fx.agreement.state_updated_reports.lock().unwrap().is_empty());

    // The target height reopens the flow.
    fx.node.report_state(5, Hash::digest(b"target"), vec![]);
    assert!(!fx.node.adaptor().is_state_updating());
    assert_eq!(*fx.agreement.state_updated_reports.lock().unwrap(), vec![5]);

    fx.node.stop();
}

#[tokio::test]
async fn conf_change_round_trips_through_the_adaptor() {
    let dir = TempDir::new().unwrap();
    let fx = start_fixture(&dir, ConfigBuilder::default()).await;

    fx.node.adaptor().apply_conf_change(ConfChange { node_id: 9 });
    assert_eq!(
        *fx.agreement.conf_changes.lock().unwrap(),
        vec![ConfChange { node_id: 9 }]
    );

    // Membership reduction stays unsupported.
    assert!(matches!(
        fx.node.remove_node(9),
        Err(EngineError::Unsupported(_))
    ));

    fx.node.stop();
}

#[tokio::test]
async fn remote_txs_are_admitted_and_ordered() {
    let dir = TempDir::new().unwrap();
    let mut fx = start_fixture(&dir, ConfigBuilder::default()).await;

    let key = test_key(4);
    let txs = vec![test_tx(&key, 1), test_tx(&key, 2)];
    let raw = txs.iter().map(|tx| tx.encode().unwrap()).collect();
    fx.node.submit_txs_from_remote(raw).await.unwrap();

    let commit = recv_commit(&mut fx.commit_rx, Duration::from_secs(2)).await;
    assert_eq!(commit.block.transactions.len(), 2);
    assert_eq!(commit.local_list, vec![false, false]);

    fx.node.stop();
}
