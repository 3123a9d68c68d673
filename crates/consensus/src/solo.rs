//! Single-sequencer engine used in development.
//!
//! This node is the sole proposer: batches formed from the pool are
//! committed directly, `quorum() == 1` and inbound consensus messages
//! are no-ops. The serializer task owns the pool, the batch store and
//! the epoch config; timers, the pre-check worker and the executor talk
//! to it through the event channel.

use crate::config::{ConsensusConfig, EpochProviderFn};
use crate::engine::ConsensusEngine;
use crate::feed::TxFeed;
use crate::metrics::{metrics, trigger_label};
use async_trait::async_trait;
use palisade_core::{
    BatchTimerManager, ConsensusEvent, EngineError, SystemStatus, TimerId,
};
use palisade_txpool::{load_records, TxPool, TxPreChecker, TxRecords, UncheckedTx, TX_RECORDS_FILE};
use palisade_types::{
    need_change_epoch, Address, BatchTrigger, Block, BlockHeader, ChainState, CommitEvent,
    EpochInfo, Hash, PoolTransaction, RequestBatch, SignedTransaction,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

const MAX_CHAN_SIZE: usize = 1_024;

pub(crate) fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

/// The solo ordering engine.
pub struct SoloNode {
    proposer_account: Address,
    event_tx: mpsc::Sender<ConsensusEvent>,
    commit_rx: Mutex<Option<mpsc::Receiver<CommitEvent>>>,
    epoch: Arc<RwLock<EpochInfo>>,
    tx_feed: Arc<TxFeed>,
    timers: Arc<BatchTimerManager>,
    started: AtomicBool,
    stopped: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    prepare_timeout: Duration,
}

impl SoloNode {
    /// Build and start the engine: replay the journal, spawn the
    /// pre-check workers, the journal writer and the serializer, and arm
    /// the batch timers.
    pub async fn start(config: ConsensusConfig) -> Result<Arc<Self>, EngineError> {
        let epoch_info = (config.get_current_epoch)()?;
        let proposer_account =
            Address::from_public_key(&config.signing_key.verifying_key().to_bytes());

        let (event_tx, event_rx) = mpsc::channel(MAX_CHAN_SIZE);
        let (commit_tx, commit_rx) = mpsc::channel(MAX_CHAN_SIZE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

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

        let worker = SoloWorker {
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
        };
        let rotate_interval = config.pool.rotate_tx_locals_interval;
        let stale_interval = config.stale_sweep_interval();
        tokio::spawn(worker.run(event_rx, shutdown_rx, rotate_interval, stale_interval));

        timers
            .start(TimerId::Batch)
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        if epoch_info.consensus_params.enable_timed_gen_empty_block
            && !timers.is_active(TimerId::NoTxBatch)
        {
            timers
                .start(TimerId::NoTxBatch)
                .map_err(|e| EngineError::Internal(e.to_string()))?;
        }

        info!(last_exec = config.applied_height, "SOLO engine started");
        info!(epoch_period = epoch_info.epoch_period, "SOLO epoch period");
        info!(
            checkpoint = epoch_info.consensus_params.checkpoint_period,
            "SOLO checkpoint period"
        );
        info!(
            enabled = epoch_info.consensus_params.enable_timed_gen_empty_block,
            "SOLO gen empty block"
        );
        info!(
            batch_timeout = ?config.batch_timeout,
            no_tx_batch_timeout = ?config.no_tx_batch_timeout,
            batch_size = epoch_info.consensus_params.block_max_tx_num,
            pool_size = config.pool.pool_size,
            "SOLO batching parameters"
        );

        let node = Arc::new(Self {
            proposer_account,
            event_tx,
            commit_rx: Mutex::new(Some(commit_rx)),
            epoch,
            tx_feed,
            timers,
            started: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            shutdown_tx,
            prepare_timeout: config.prepare_timeout,
        });
        Ok(node)
    }

    /// Account that signs the blocks this node proposes.
    pub fn proposer_account(&self) -> Address {
        self.proposer_account
    }
}

#[async_trait]
impl ConsensusEngine for SoloNode {
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

    fn step(&self, _msg: Vec<u8>) -> Result<(), EngineError> {
        // No peers, nothing to agree on.
        Ok(())
    }

    fn take_commit_receiver(&self) -> Option<mpsc::Receiver<CommitEvent>> {
        self.commit_rx.lock().expect("commit lock").take()
    }

    fn report_state(&self, height: u64, block_hash: Hash, tx_hash_list: Vec<Hash>) {
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
        Ok(())
    }

    fn quorum(&self) -> u64 {
        1
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
        self.timers.stop_all();
        let _ = self.shutdown_tx.send(true);
        info!("Consensus stopped");
    }
}

/// Serializer task state: everything consensus-affecting lives here.
struct SoloWorker {
    pool: TxPool<SignedTransaction>,
    precheck: TxPreChecker,
    timers: Arc<BatchTimerManager>,
    epoch: Arc<RwLock<EpochInfo>>,
    /// height → batch digest, evicted at stable checkpoints.
    batch_digests: BTreeMap<u64, Hash>,
    last_exec: u64,
    last_batch_time: Option<Instant>,
    proposer_account: Address,
    commit_tx: mpsc::Sender<CommitEvent>,
    get_current_epoch: EpochProviderFn,
    tx_feed: Arc<TxFeed>,
    journaling: bool,
}

impl SoloWorker {
    async fn run(
        mut self,
        mut event_rx: mpsc::Receiver<ConsensusEvent>,
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
        info!("Exit solo event loop");
    }

    async fn handle_event(&mut self, event: ConsensusEvent) {
        match event {
            ConsensusEvent::LocalTx {
                tx,
                check_resp,
                pool_resp,
            } => {
                // Forward to the pre-check workers; a dropped channel
                // resolves the waiting client with `Stopped`.
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
                let result = self.pool.add_local(tx);
                metrics().pool_size.set(self.pool.len() as i64);
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
                self.try_propose(trigger).await;
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
                // A spurious fire after stop lands here with an empty
                // pool and is a no-op.
                if self.pool.has_pending_request_in_pool() {
                    self.timers.stop(TimerId::NoTxBatch);
                    self.try_propose(BatchTrigger::Timeout).await;
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
                    debug!("Prepare create empty block");
                    self.try_propose(BatchTrigger::NoTxTimeout).await;
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
        let checkpoint_period = self
            .epoch
            .read()
            .expect("epoch lock")
            .consensus_params
            .checkpoint_period;
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
        }

        if state.epoch_changed {
            match (self.get_current_epoch)() {
                Ok(next) => self.apply_epoch(next),
                Err(e) => {
                    error!(height = state.height, error = %e, "Get current epoch info failed");
                }
            }
        }
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

    async fn try_propose(&mut self, trigger: BatchTrigger) {
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
        let epoch = self.epoch.read().expect("epoch lock").epoch;
        let block = Block {
            header: BlockHeader {
                number: height,
                timestamp: timestamp / 1_000_000_000,
                epoch,
                proposer_account: self.proposer_account,
                parent_hash: Hash::ZERO,
                state_root: Hash::ZERO,
            },
            transactions: tx_list.iter().map(|tx| (**tx).clone()).collect(),
        };
        self.batch_digests.insert(height, batch_hash);
        self.last_exec = height;
        info!(height, batch_hash = %batch_hash, tx_count = tx_list.len(), "Call execute");
        metrics().committed_height.set(height as i64);
        if self
            .commit_tx
            .send(CommitEvent {
                block,
                local_list: local_flags,
            })
            .await
            .is_err()
        {
            warn!(height, "Commit stream closed, block dropped");
        }
    }
}
