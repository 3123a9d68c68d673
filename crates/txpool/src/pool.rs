//! The transaction pool.

use crate::{AccountNonceFn, PoolConfig, TxRecords};
use palisade_core::{ConsensusEvent, PoolError};
use palisade_types::{Address, BatchTrigger, Hash, PoolTransaction, RequestBatch};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, warn};

struct PoolItem<T> {
    tx: Arc<T>,
    hash: Hash,
    local: bool,
    /// Global admission sequence, used for FIFO batch formation.
    seq: u64,
    arrived: Instant,
}

/// Per-account nonce-ordered transactions.
///
/// The contiguous run above `committed_nonce` is the pending set; any
/// entries behind a gap form the queue.
struct AccountQueue<T> {
    committed_nonce: u64,
    items: BTreeMap<u64, PoolItem<T>>,
}

impl<T> AccountQueue<T> {
    fn new(committed_nonce: u64) -> Self {
        Self {
            committed_nonce,
            items: BTreeMap::new(),
        }
    }

    /// Next nonce that would extend the pending run.
    fn next_pending_nonce(&self) -> u64 {
        let mut next = self.committed_nonce + 1;
        while self.items.contains_key(&next) {
            next += 1;
        }
        next
    }
}

/// The global transaction pool.
///
/// Owned and mutated exclusively by the engine's serializer task. Holds
/// the per-account maps, a hash index for dedup, and the store of formed
/// batches awaiting checkpoint eviction.
pub struct TxPool<T: PoolTransaction> {
    config: PoolConfig,
    account_nonce: AccountNonceFn,
    accounts: HashMap<Address, AccountQueue<T>>,
    /// hash → (account, nonce) for dedup and eviction.
    lookup: HashMap<Hash, (Address, u64)>,
    /// digest → formed batch, kept until its height is checkpointed.
    batches: HashMap<Hash, RequestBatch<T>>,
    /// Hashes currently sealed in a batch; not pending for the next one.
    batched: HashSet<Hash>,
    seq: u64,
    journal: Option<TxRecords<T>>,
    notifier: Option<mpsc::Sender<ConsensusEvent>>,
}

impl<T: PoolTransaction> TxPool<T> {
    pub fn new(config: PoolConfig, account_nonce: AccountNonceFn) -> Self {
        Self {
            config,
            account_nonce,
            accounts: HashMap::new(),
            lookup: HashMap::new(),
            batches: HashMap::new(),
            batched: HashSet::new(),
            seq: 0,
            journal: None,
            notifier: None,
        }
    }

    /// Attach the local tx journal. Admitted local transactions are
    /// appended from here on.
    pub fn set_journal(&mut self, journal: TxRecords<T>) {
        self.journal = Some(journal);
    }

    /// Attach the serializer channel for pool-threshold notifications.
    pub fn set_notifier(&mut self, notifier: mpsc::Sender<ConsensusEvent>) {
        self.notifier = Some(notifier);
    }

    /// Update the per-batch transaction cap on epoch rollover.
    pub fn set_batch_size(&mut self, batch_size: usize) {
        self.config.batch_size = batch_size;
    }

    /// Admit a locally submitted transaction.
    pub fn add_local(&mut self, tx: T) -> Result<(), PoolError> {
        self.add(tx, true, true)
    }

    /// Admit transactions received from peers. Rejections are logged,
    /// not surfaced.
    pub fn add_remotes(&mut self, txs: Vec<T>) {
        for tx in txs {
            let hash = tx.hash();
            if let Err(e) = self.add(tx, false, false) {
                debug!(%hash, error = %e, "Remote transaction rejected");
            }
        }
    }

    /// Replay journaled local transactions through normal admission
    /// without re-journaling them.
    pub fn replay_locals(&mut self, txs: Vec<T>) -> usize {
        let mut admitted = 0;
        for tx in txs {
            let hash = tx.hash();
            match self.add(tx, true, false) {
                Ok(()) => admitted += 1,
                Err(e) => debug!(%hash, error = %e, "Journal replay rejected"),
            }
        }
        admitted
    }

    fn add(&mut self, tx: T, local: bool, journal: bool) -> Result<(), PoolError> {
        let hash = tx.hash();
        if self.lookup.contains_key(&hash) {
            return Err(PoolError::Duplicate(hash));
        }

        let sender = tx.sender();
        let nonce = tx.nonce();
        let committed = match self.accounts.get(&sender) {
            Some(account) => account.committed_nonce,
            None => (self.account_nonce)(&sender),
        };
        if nonce <= committed {
            return Err(PoolError::NonceTooLow { nonce, committed });
        }

        // Same-nonce replacement: allowed only with a >= 10% price bump,
        // and never for a tx already sealed in a batch.
        let replaces = match self.accounts.get(&sender).and_then(|a| a.items.get(&nonce)) {
            Some(existing) => {
                if self.batched.contains(&existing.hash) {
                    return Err(PoolError::Duplicate(existing.hash));
                }
                let old_price = existing.tx.gas_price();
                let required = old_price + old_price / 10;
                if tx.gas_price() < required {
                    return Err(PoolError::ReplaceUnderpriced {
                        offered: tx.gas_price(),
                        required,
                    });
                }
                Some(existing.hash)
            }
            None => {
                if self.lookup.len() >= self.config.pool_size {
                    return Err(PoolError::PoolFull);
                }
                let next_pending = self
                    .accounts
                    .get(&sender)
                    .map(|a| a.next_pending_nonce())
                    .unwrap_or(committed + 1);
                if nonce > next_pending + self.config.tolerance_nonce_gap {
                    return Err(PoolError::NonceGapTooLarge { nonce, next_pending });
                }
                None
            }
        };

        let account = self
            .accounts
            .entry(sender)
            .or_insert_with(|| AccountQueue::new(committed));
        if let Some(old_hash) = replaces {
            self.lookup.remove(&old_hash);
        }
        let seq = self.seq;
        self.seq += 1;
        let tx = Arc::new(tx);
        account.items.insert(
            nonce,
            PoolItem {
                tx: Arc::clone(&tx),
                hash,
                local,
                seq,
                arrived: Instant::now(),
            },
        );
        self.lookup.insert(hash, (sender, nonce));

        if journal && local && self.config.enable_locals_persist {
            if let Some(records) = &self.journal {
                records.append(tx);
            }
        }

        if self.ready_count_at_least(self.config.batch_size) {
            if let Some(notifier) = &self.notifier {
                if let Err(e) = notifier.try_send(ConsensusEvent::GenBatchReq(BatchTrigger::Size)) {
                    warn!(error = %e, "Batch threshold notification dropped");
                }
            }
        }
        Ok(())
    }

    /// Form a batch from pending transactions.
    ///
    /// Across accounts, admission order wins; within an account, strict
    /// nonce order. Bounded by the per-batch tx cap and, when enabled,
    /// the byte cap. A tx already sealed in a batch is not pending again
    /// until that batch is removed.
    ///
    /// Returns `None` when nothing is eligible, except for the
    /// `NoTxTimeout` trigger which yields an empty batch for empty-block
    /// generation.
    pub fn generate_request_batch(
        &mut self,
        trigger: BatchTrigger,
        height: u64,
        timestamp: i64,
    ) -> Option<RequestBatch<T>> {
        let mut candidates: Vec<(u64, Address, u64)> = Vec::new();
        for (addr, account) in &self.accounts {
            let mut nonce = account.committed_nonce + 1;
            while let Some(item) = account.items.get(&nonce) {
                if !self.batched.contains(&item.hash) {
                    candidates.push((item.seq, *addr, nonce));
                }
                nonce += 1;
            }
        }
        candidates.sort_unstable_by_key(|(seq, ..)| *seq);

        let cap = self.config.batch_size;
        let mem_cap = self.config.batch_mem_limit.then_some(self.config.batch_max_mem);
        let mut selected: Vec<(Address, u64)> = Vec::new();
        let mut mem = 0usize;
        let mut next_needed: HashMap<Address, u64> = HashMap::new();
        let mut held: HashMap<Address, BTreeMap<u64, ()>> = HashMap::new();

        'outer: for (_, addr, nonce) in candidates {
            let need = *next_needed.entry(addr).or_insert_with(|| {
                let account = &self.accounts[&addr];
                let mut n = account.committed_nonce + 1;
                // First nonce not already sealed in a batch.
                while account
                    .items
                    .get(&n)
                    .is_some_and(|item| self.batched.contains(&item.hash))
                {
                    n += 1;
                }
                n
            });
            match nonce.cmp(&need) {
                std::cmp::Ordering::Equal => {
                    let mut emit = nonce;
                    loop {
                        let item = &self.accounts[&addr].items[&emit];
                        if selected.len() >= cap
                            || mem_cap.is_some_and(|limit| mem + item.tx.size() > limit)
                        {
                            break 'outer;
                        }
                        mem += item.tx.size();
                        selected.push((addr, emit));
                        next_needed.insert(addr, emit + 1);
                        emit += 1;
                        // Pull forward any held-back successors.
                        let was_held =
                            held.get_mut(&addr).is_some_and(|h| h.remove(&emit).is_some());
                        if !was_held {
                            break;
                        }
                    }
                }
                std::cmp::Ordering::Greater => {
                    held.entry(addr).or_default().insert(nonce, ());
                }
                std::cmp::Ordering::Less => {}
            }
        }

        if selected.is_empty() && trigger != BatchTrigger::NoTxTimeout {
            return None;
        }

        let mut tx_list = Vec::with_capacity(selected.len());
        let mut local_flags = Vec::with_capacity(selected.len());
        for (addr, nonce) in &selected {
            let item = &self.accounts[addr].items[nonce];
            tx_list.push(Arc::clone(&item.tx));
            local_flags.push(item.local);
            self.batched.insert(item.hash);
        }

        let batch = RequestBatch::new(tx_list, local_flags, height, timestamp);
        debug!(
            batch_hash = %batch.batch_hash,
            tx_count = batch.len(),
            ?trigger,
            height,
            "Generated request batch"
        );
        self.batches.insert(batch.batch_hash, batch.clone());
        Some(batch)
    }

    /// Drop the referenced batches and evict their transactions.
    /// Unknown digests are skipped; calling twice is a no-op.
    pub fn remove_batches(&mut self, digests: &[Hash]) {
        for digest in digests {
            let Some(batch) = self.batches.remove(digest) else {
                continue;
            };
            for tx in &batch.tx_list {
                let hash = tx.hash();
                self.batched.remove(&hash);
                if let Some((addr, nonce)) = self.lookup.remove(&hash) {
                    if let Some(account) = self.accounts.get_mut(&addr) {
                        account.items.remove(&nonce);
                        if nonce > account.committed_nonce {
                            account.committed_nonce = nonce;
                        }
                    }
                }
            }
            debug!(batch_hash = %digest, height = batch.height, "Removed batch from pool");
        }

        // Sweep entries the committed nonce has moved past.
        let lookup = &mut self.lookup;
        let batched = &mut self.batched;
        for account in self.accounts.values_mut() {
            let committed = account.committed_nonce;
            let stale: Vec<u64> = account.items.range(..=committed).map(|(n, _)| *n).collect();
            for nonce in stale {
                if let Some(item) = account.items.remove(&nonce) {
                    lookup.remove(&item.hash);
                    batched.remove(&item.hash);
                }
            }
        }
    }

    /// Whether any transaction is eligible for the next batch.
    pub fn has_pending_request_in_pool(&self) -> bool {
        self.ready_count_at_least(1)
    }

    fn ready_count_at_least(&self, threshold: usize) -> bool {
        if threshold == 0 {
            return true;
        }
        let mut count = 0;
        for account in self.accounts.values() {
            let mut nonce = account.committed_nonce + 1;
            while let Some(item) = account.items.get(&nonce) {
                if !self.batched.contains(&item.hash) {
                    count += 1;
                    if count >= threshold {
                        return true;
                    }
                }
                nonce += 1;
            }
        }
        false
    }

    /// Evict stale transactions: remote entries past `tolerance_time`,
    /// anything past `tolerance_remove_time`. Batched entries are
    /// untouched; their batch owns them until checkpoint.
    pub fn remove_stale(&mut self, now: Instant) {
        let mut evict: Vec<Hash> = Vec::new();
        for account in self.accounts.values() {
            for item in account.items.values() {
                if self.batched.contains(&item.hash) {
                    continue;
                }
                let limit = if item.local {
                    self.config.tolerance_remove_time
                } else {
                    self.config.tolerance_time
                };
                if now.duration_since(item.arrived) > limit {
                    evict.push(item.hash);
                }
            }
        }
        for hash in &evict {
            if let Some((addr, nonce)) = self.lookup.remove(hash) {
                if let Some(account) = self.accounts.get_mut(&addr) {
                    account.items.remove(&nonce);
                }
            }
        }
        if !evict.is_empty() {
            debug!(count = evict.len(), "Evicted stale transactions");
        }
    }

    /// Rewrite the journal from the current local set. A no-op without
    /// an attached journal.
    pub async fn rotate_journal(&self) {
        let Some(records) = &self.journal else {
            return;
        };
        let snapshot = self.local_snapshot();
        if let Err(e) = records.rotate(snapshot).await {
            warn!(error = %e, "Journal rotation failed, keeping previous file");
        }
    }

    /// Read-only snapshot of all live local transactions, for journal
    /// rotation.
    pub fn local_snapshot(&self) -> Vec<Arc<T>> {
        self.accounts
            .values()
            .flat_map(|account| account.items.values())
            .filter(|item| item.local)
            .map(|item| Arc::clone(&item.tx))
            .collect()
    }

    /// Total pooled transactions (batched included).
    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }

    /// Whether the pool is at capacity.
    pub fn is_full(&self) -> bool {
        self.lookup.len() >= self.config.pool_size
    }

    /// Next expected nonce for an account (committed + pending run).
    pub fn pending_nonce(&self, account: &Address) -> u64 {
        match self.accounts.get(account) {
            Some(queue) => queue.next_pending_nonce() - 1,
            None => (self.account_nonce)(account),
        }
    }

    /// Nonces in the pending (contiguous) run of an account.
    pub fn pending_nonces(&self, account: &Address) -> Vec<u64> {
        let Some(queue) = self.accounts.get(account) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut nonce = queue.committed_nonce + 1;
        while queue.items.contains_key(&nonce) {
            out.push(nonce);
            nonce += 1;
        }
        out
    }

    /// Nonces parked behind a gap for an account.
    pub fn queue_nonces(&self, account: &Address) -> Vec<u64> {
        let Some(queue) = self.accounts.get(account) else {
            return Vec::new();
        };
        let pending_end = queue.next_pending_nonce();
        queue
            .items
            .range(pending_end..)
            .map(|(nonce, _)| *nonce)
            .collect()
    }

    /// Look up a pooled transaction by hash.
    pub fn get(&self, hash: &Hash) -> Option<Arc<T>> {
        let (addr, nonce) = self.lookup.get(hash)?;
        let item = self.accounts.get(addr)?.items.get(nonce)?;
        Some(Arc::clone(&item.tx))
    }
}
