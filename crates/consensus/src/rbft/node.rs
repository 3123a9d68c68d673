//! The replicated engine: pool + timers + adaptor wired around the
//! external agreement library.

use super::adaptor::RbftAdaptor;
use super::agreement::{Agreement, BatchProposal, ExecuteContext, ServiceState};
use crate::config::{ConsensusConfig, EpochProviderFn};
use crate::engine::ConsensusEngine;
use crate::feed::TxFeed;
use crate::metrics::{metrics, trigger_label};
use crate::solo::unix_nanos;
use crate::PeerManager;
use async_trait::async_trait;
use palisade_core::{
    BatchTimerManager, ConsensusEvent, EngineError, SystemStatus, TimerId,
};
use palisade_ledger::Storage;
use palisade_txpool::{load_records, TxPool, TxPreChecker, TxRecords, UncheckedTx, TX_RECORDS_FILE};
use palisade_types::{
    need_change_epoch, Address, BatchTrigger, Block, BlockHeader, ChainState, CommitEvent,
    EpochInfo, Hash, NetworkMessage, PoolTransaction, RequestBatch, SignedTransaction,
    ValidatorSet,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

const MAX_CHAN_SIZE: usize = 1_024;

/// The replicated ordering engine.
pub struct RbftNode {
    agreement: Arc<dyn Agreement>,
    adaptor: Arc<RbftAdaptor>,
    event_tx: mpsc::Sender<ConsensusEvent>,
    commit_rx: Mutex<Option<mpsc::Receiver<CommitEvent>>>,
    epoch: Arc<RwLock<EpochInfo>>,
    tx_feed: Arc<TxFeed>,
    timers: Arc<BatchTimerManager>,
    validators: ValidatorSet,
    started: AtomicBool,
    stopped: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    prepare_timeout: Duration,
}

impl RbftNode {
    /// Build and start the engine around an agreement library.
    ///
    /// Construction is two-phase to break the node↔adaptor cycle: the
    /// adaptor is built first, `build_agreement` receives it as the
    /// library's host, and the conf-change hook is injected afterwards.
    /// Startup blocks until `connected + 1 >= quorum()`, retrying once
    /// per second, unbounded.
    pub async fn start<F>(
        config: ConsensusConfig,
        storage: Arc<dyn Storage>,
        build_agreement: F,
    ) -> Result<Arc<Self>, EngineError>
    where
        F: FnOnce(Arc<RbftAdaptor>) -> Arc<dyn Agreement>,
    {
        let epoch_info = (config.get_current_epoch)()?;

        let (event_tx, event_rx) = mpsc::channel(MAX_CHAN_SIZE);
        let (commit_tx, commit_rx) = mpsc::channel(MAX_CHAN_SIZE);
        let (ready_tx, ready_rx) = mpsc::channel(MAX_CHAN_SIZE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let adaptor = Arc::new(RbftAdaptor::new(
            config.network.clone(),
            storage,
            config.signing_key.clone(),
            config.validators.clone(),
            config.applied_height,
            ready_tx,
        ));
        let agreement = build_agreement(Arc::clone(&adaptor));
        {
            let agreement = Arc::clone(&agreement);
            adaptor.set_apply_conf_change(move |change| agreement.apply_conf_change(change));
        }
        agreement.report_executed(ServiceState {
            height: config.applied_height,
            digest: config.applied_digest,
            epoch: epoch_info.epoch,
        });

        let mut pool = TxPool::new(config.pool.clone(), config.get_account_nonce.clone());
        pool.set_notifier(event_tx.clone());
        let journaling = config.pool.enable_locals_persist;
        if journaling {
            let path = config.pool.repo_root.join(TX_RECORDS_FILE);
            let replayed = pool.replay_locals(load_records(&path));
            info!(replayed, "Replayed local transactions from journal");
            let records = TxRecords::spawn(path, shutdown_rx.clone())
                .map_err(|e| EngineError::Internal(format!("open journal: {e}")))?;
            pool.set_journal(records);
        }
        pool.set_batch_size(epoch_info.consensus_params.block_max_tx_num as usize);

        let precheck = TxPreChecker::spawn(config.chain_id, event_tx.clone(), shutdown_rx.clone());

        let timers = Arc::new(BatchTimerManager::new(event_tx.clone()));
        timers.create(TimerId::Batch, config.batch_timeout);
        timers.create(TimerId::NoTxBatch, config.no_tx_batch_timeout);

        let epoch = Arc::new(RwLock::new(epoch_info.clone()));
        let tx_feed = Arc::new(TxFeed::default());
        let proposer_account =
            Address::from_public_key(&config.signing_key.verifying_key().to_bytes());

        let worker = RbftWorker {
            pool,
            precheck,
            timers: Arc::clone(&timers),
            epoch: Arc::clone(&epoch),
            batch_digests: BTreeMap::new(),
            last_exec: config.applied_height,
            last_batch_time: None,
            proposer_account,
            commit_tx,
            get_current_epoch: config.get_current_epoch.clone(),
            tx_feed: Arc::clone(&tx_feed),
            journaling,
            agreement: Arc::clone(&agreement),
            adaptor: Arc::clone(&adaptor),
            network: config.network.clone(),
        };
        let rotate_interval = config.pool.rotate_tx_locals_interval;
        let stale_interval = config.stale_sweep_interval();
        tokio::spawn(worker.run(event_rx, ready_rx, shutdown_rx, rotate_interval, stale_interval));

        // Quorum connectivity gate: retry once per second until enough
        // peers are reachable.
        let quorum = config.validators.quorum();
        loop {
            let connected = config.network.count_connected_peers() + 1;
            if connected >= quorum {
                break;
            }
            info!(quorum, connected, "Waiting for quorum connectivity");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        agreement.start()?;
        timers
            .start(TimerId::Batch)
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        if epoch_info.consensus_params.enable_timed_gen_empty_block {
            timers
                .start(TimerId::NoTxBatch)
                .map_err(|e| EngineError::Internal(e.to_string()))?;
        }
        info!(
            last_exec = config.applied_height,
            quorum,
            epoch = epoch_info.epoch,
            "Replicated engine started"
        );

        Ok(Arc::new(Self {
            agreement,
            adaptor,
            event_tx,
            commit_rx: Mutex::new(Some(commit_rx)),
            epoch,
            tx_feed,
            timers,
            validators: config.validators,
            started: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            shutdown_tx,
            prepare_timeout: config.prepare_timeout,
        }))
    }

    /// The host adaptor, for wiring external collaborators.
    pub fn adaptor(&self) -> &Arc<RbftAdaptor> {
        &self.adaptor
    }
}

#[async_trait]
impl ConsensusEngine for RbftNode {
    async fn prepare(&self, tx: SignedTransaction) -> Result<(), EngineError> {
        self.ready()?;
        let (check_tx, check_rx) = oneshot::channel();
        let (pool_tx, pool_rx) = oneshot::channel();
        self.event_tx
            .send(ConsensusEvent::LocalTx {
                tx: tx.clone(),
                check_resp: check_tx,
                pool_resp: pool_tx,
            })
            .await
            .map_err(|_| EngineError::Stopped)?;

        tokio::time::timeout(self.prepare_timeout, check_rx)
            .await
            .map_err(|_| EngineError::Timeout)?
            .map_err(|_| EngineError::Stopped)??;
        tokio::time::timeout(self.prepare_timeout, pool_rx)
            .await
            .map_err(|_| EngineError::Timeout)?
            .map_err(|_| EngineError::Stopped)??;

        self.tx_feed.send(vec![tx]);
        Ok(())
    }

    async fn submit_txs_from_remote(&self, txs: Vec<Vec<u8>>) -> Result<(), EngineError> {
        self.event_tx
            .send(ConsensusEvent::RemoteTxs { raw: txs })
            .await
            .map_err(|_| EngineError::Stopped)
    }

    fn step(&self, msg: Vec<u8>) -> Result<(), EngineError> {
        self.agreement.step(msg)
    }

    fn take_commit_receiver(&self) -> Option<mpsc::Receiver<CommitEvent>> {
        self.commit_rx.lock().expect("commit lock").take()
    }

    fn report_state(&self, height: u64, block_hash: Hash, tx_hash_list: Vec<Hash>) {
        if self.adaptor.is_state_updating() {
            // Reports for intervening heights are ignored until the
            // transfer target lands.
            if self.adaptor.state_update_height() == Some(height) {
                let epoch = self.epoch.read().expect("epoch lock").epoch;
                self.agreement.report_state_updated(ServiceState {
                    height,
                    digest: block_hash,
                    epoch,
                });
                self.adaptor.finish_state_update(height);
            }
            return;
        }

        let epoch_changed = need_change_epoch(height, &self.epoch.read().expect("epoch lock"));
        let state = ChainState {
            height,
            block_hash,
            tx_hash_list,
            epoch_changed,
        };
        if let Err(e) = self.event_tx.try_send(ConsensusEvent::ChainState(state)) {
            error!(height, error = %e, "Dropping chain state report");
        }
    }

    fn subscribe_tx_event(&self, ch: mpsc::UnboundedSender<Vec<SignedTransaction>>) {
        self.tx_feed.subscribe(ch);
    }

    fn ready(&self) -> Result<(), EngineError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(EngineError::Stopped);
        }
        if !self.started.load(Ordering::SeqCst) {
            return Err(EngineError::NotReady(
                SystemStatus::Pending.describe().to_string(),
            ));
        }
        let status = self.agreement.status();
        if !status.is_normal() {
            return Err(EngineError::NotReady(status.describe().to_string()));
        }
        Ok(())
    }

    fn quorum(&self) -> u64 {
        self.validators.quorum()
    }

    async fn get_low_watermark(&self) -> Result<u64, EngineError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.event_tx
            .send(ConsensusEvent::LowWatermarkReq { resp: resp_tx })
            .await
            .map_err(|_| EngineError::Stopped)?;
        tokio::time::timeout(self.prepare_timeout, resp_rx)
            .await
            .map_err(|_| EngineError::Timeout)?
            .map_err(|_| EngineError::Stopped)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.started.store(false, Ordering::SeqCst);
        self.agreement.stop();
        self.timers.stop_all();
        let _ = self.shutdown_tx.send(true);
        info!("Consensus stopped");
    }
}

/// Serializer task of the replicated engine.
struct RbftWorker {
    pool: TxPool<SignedTransaction>,
    precheck: TxPreChecker,
    timers: Arc<BatchTimerManager>,
    epoch: Arc<RwLock<EpochInfo>>,
    batch_digests: BTreeMap<u64, Hash>,
    last_exec: u64,
    last_batch_time: Option<Instant>,
    proposer_account: Address,
    commit_tx: mpsc::Sender<CommitEvent>,
    get_current_epoch: EpochProviderFn,
    tx_feed: Arc<TxFeed>,
    journaling: bool,
    agreement: Arc<dyn Agreement>,
    adaptor: Arc<RbftAdaptor>,
    network: Arc<dyn PeerManager>,
}

impl RbftWorker {
    async fn run(
        mut self,
        mut event_rx: mpsc::Receiver<ConsensusEvent>,
        mut ready_rx: mpsc::Receiver<ExecuteContext>,
        mut shutdown: watch::Receiver<bool>,
        rotate_interval: Duration,
        stale_interval: Duration,
    ) {
        let mut rotate_tick =
            tokio::time::interval_at(tokio::time::Instant::now() + rotate_interval, rotate_interval);
        let mut stale_tick =
            tokio::time::interval_at(tokio::time::Instant::now() + stale_interval, stale_interval);
        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    self.timers.stop_all();
                    break;
                }

                Some(executed) = ready_rx.recv() => self.on_executed(executed).await,

                Some(event) = event_rx.recv() => self.handle_event(event).await,

                _ = rotate_tick.tick(), if self.journaling => {
                    self.pool.rotate_journal().await;
                }

                _ = stale_tick.tick() => {
                    self.pool.remove_stale(Instant::now());
                    metrics().pool_size.set(self.pool.len() as i64);
                }

                else => break,
            }
        }
        info!("Exit replicated event loop");
    }

    async fn handle_event(&mut self, event: ConsensusEvent) {
        match event {
            ConsensusEvent::LocalTx {
                tx,
                check_resp,
                pool_resp,
            } => {
                let _ = self
                    .precheck
                    .post(UncheckedTx {
                        tx,
                        check_resp,
                        pool_resp,
                    })
                    .await;
            }

            ConsensusEvent::CheckedTx { tx, pool_resp } => {
                let result = self.pool.add_local(tx.clone());
                metrics().pool_size.set(self.pool.len() as i64);
                if result.is_ok() {
                    // Push the admitted tx to peers so their pools see it.
                    match NetworkMessage::push_txs(std::slice::from_ref(&tx)) {
                        Ok(msg) => {
                            if let Err(e) = self.network.broadcast(msg) {
                                warn!(error = %e, "Push-txs broadcast failed");
                            }
                        }
                        Err(e) => warn!(error = %e, "Push-txs encode failed"),
                    }
                }
                let _ = pool_resp.send(result);
            }

            ConsensusEvent::RemoteTxs { raw } => {
                let mut decoded = Vec::with_capacity(raw.len());
                for bytes in &raw {
                    match SignedTransaction::decode(bytes) {
                        Ok(tx) => decoded.push(tx),
                        Err(e) => debug!(error = %e, "Dropping undecodable remote transaction"),
                    }
                }
                self.tx_feed.send(decoded.clone());
                self.pool.add_remotes(decoded);
                metrics().pool_size.set(self.pool.len() as i64);
            }

            ConsensusEvent::ChainState(state) => self.on_chain_state(state).await,

            ConsensusEvent::Timeout(timer) => self.on_timeout(timer).await,

            ConsensusEvent::GenBatchReq(trigger) => {
                self.timers.stop(TimerId::Batch);
                self.timers.stop(TimerId::NoTxBatch);
                self.try_propose(trigger);
                if self.enable_empty_block() && !self.pool.has_pending_request_in_pool() {
                    if let Err(e) = self.timers.restart(TimerId::NoTxBatch) {
                        error!(error = %e, "Restart no-tx batch timer failed");
                    }
                }
                if let Err(e) = self.timers.restart(TimerId::Batch) {
                    error!(error = %e, "Restart batch timer failed");
                }
            }

            ConsensusEvent::LowWatermarkReq { resp } => {
                let _ = resp.send(self.last_exec);
            }
        }
    }

    async fn on_timeout(&mut self, timer: TimerId) {
        match timer {
            TimerId::Batch => {
                self.timers.stop(TimerId::Batch);
                if self.pool.has_pending_request_in_pool() {
                    self.timers.stop(TimerId::NoTxBatch);
                    self.try_propose(BatchTrigger::Timeout);
                    if self.enable_empty_block() {
                        if let Err(e) = self.timers.restart(TimerId::NoTxBatch) {
                            error!(error = %e, "Restart no-tx batch timer failed");
                        }
                    }
                }
                if let Err(e) = self.timers.restart(TimerId::Batch) {
                    error!(error = %e, "Restart batch timer failed");
                }
            }
            TimerId::NoTxBatch => {
                self.timers.stop(TimerId::NoTxBatch);
                if self.pool.has_pending_request_in_pool() {
                    debug!("Pool not empty, skipping no-tx batch timeout");
                } else if self.enable_empty_block() {
                    self.try_propose(BatchTrigger::NoTxTimeout);
                }
                if self.enable_empty_block() {
                    if let Err(e) = self.timers.restart(TimerId::NoTxBatch) {
                        error!(error = %e, "Restart no-tx batch timer failed");
                    }
                }
            }
        }
    }

    async fn on_chain_state(&mut self, state: ChainState) {
        let epoch_snapshot = self.epoch.read().expect("epoch lock").clone();
        let checkpoint_period = epoch_snapshot.consensus_params.checkpoint_period;
        if checkpoint_period > 0 && state.height % checkpoint_period == 0 {
            info!(height = state.height, hash = %state.block_hash, "Report checkpoint");
            let heights: Vec<u64> = self
                .batch_digests
                .range(..=state.height)
                .map(|(height, _)| *height)
                .collect();
            let digests: Vec<Hash> = heights
                .iter()
                .filter_map(|height| self.batch_digests.remove(height))
                .collect();
            self.pool.remove_batches(&digests);
            metrics().pool_size.set(self.pool.len() as i64);
            self.agreement.report_stable_checkpoint_finished(state.height);
        }

        if state.epoch_changed {
            match (self.get_current_epoch)() {
                Ok(next) => self.apply_epoch(next),
                Err(e) => {
                    error!(height = state.height, error = %e, "Get current epoch info failed");
                }
            }
        }

        let epoch = self.epoch.read().expect("epoch lock").epoch;
        self.agreement.report_executed(ServiceState {
            height: state.height,
            digest: state.block_hash,
            epoch,
        });
    }

    fn apply_epoch(&mut self, next: EpochInfo) {
        info!(
            epoch = next.epoch,
            start = next.start_block,
            period = next.epoch_period,
            batch_size = next.consensus_params.block_max_tx_num,
            checkpoint = next.consensus_params.checkpoint_period,
            enable_gen_empty_block = next.consensus_params.enable_timed_gen_empty_block,
            "Report epoch changed"
        );
        self.pool
            .set_batch_size(next.consensus_params.block_max_tx_num as usize);
        let enable = next.consensus_params.enable_timed_gen_empty_block;
        *self.epoch.write().expect("epoch lock") = next;
        if enable && !self.timers.is_active(TimerId::NoTxBatch) {
            if let Err(e) = self.timers.start(TimerId::NoTxBatch) {
                error!(error = %e, "Start no-tx batch timer failed");
            }
        } else if !enable {
            self.timers.stop(TimerId::NoTxBatch);
        }
    }

    fn enable_empty_block(&self) -> bool {
        self.epoch
            .read()
            .expect("epoch lock")
            .consensus_params
            .enable_timed_gen_empty_block
    }

    /// Form a batch and hand it to the agreement protocol. During state
    /// transfer, timeouts are processed but yield no batch.
    fn try_propose(&mut self, trigger: BatchTrigger) {
        if self.adaptor.is_state_updating() {
            debug!(?trigger, "State transfer in progress, no batch formed");
            return;
        }
        let height = self.last_exec + 1;
        let timestamp = unix_nanos();
        let Some(batch) = self.pool.generate_request_batch(trigger, height, timestamp) else {
            return;
        };
        metrics()
            .batches_formed
            .with_label_values(&[trigger_label(trigger)])
            .inc();
        if let Some(prev) = self.last_batch_time {
            metrics().batch_interval.observe(prev.elapsed().as_secs_f64());
        }
        self.last_batch_time = Some(Instant::now());

        let RequestBatch {
            batch_hash,
            tx_list,
            local_flags,
            timestamp,
            ..
        } = batch;
        let mut requests = Vec::with_capacity(tx_list.len());
        for tx in &tx_list {
            match tx.encode() {
                Ok(bytes) => requests.push(bytes),
                Err(e) => {
                    error!(error = %e, "Batch tx encode failed, dropping proposal");
                    return;
                }
            }
        }
        debug!(batch_hash = %batch_hash, tx_count = requests.len(), "Posting proposal");
        if let Err(e) = self.agreement.propose(BatchProposal {
            batch_hash,
            requests,
            local_flags,
            timestamp,
        }) {
            error!(error = %e, "Propose failed");
        }
    }

    /// An ordered batch came back from the agreement protocol: record
    /// its digest for checkpoint eviction and hand the block to the
    /// executor.
    async fn on_executed(&mut self, executed: ExecuteContext) {
        let epoch = self.epoch.read().expect("epoch lock").epoch;
        self.batch_digests.insert(executed.height, executed.batch_hash);
        self.last_exec = executed.height;
        metrics().committed_height.set(executed.height as i64);

        let block = Block {
            header: BlockHeader {
                number: executed.height,
                timestamp: executed.timestamp / 1_000_000_000,
                epoch,
                proposer_account: self.proposer_account,
                parent_hash: Hash::ZERO,
                state_root: Hash::ZERO,
            },
            transactions: executed.txs,
        };
        info!(
            height = executed.height,
            batch_hash = %executed.batch_hash,
            tx_count = block.transactions.len(),
            "Call execute"
        );
        if self
            .commit_tx
            .send(CommitEvent {
                block,
                local_list: executed.local_list,
            })
            .await
            .is_err()
        {
            warn!(height = executed.height, "Commit stream closed, block dropped");
        }
    }
}
