//! Per-block archival of state history.
//!
//! Every committed block yields a [`StateJournal`]. The archiver fans it
//! out to three stores: the journal KV (keyed by height), the history KV
//! (every dirty node, never pruned) and the live snapshot KV (dirty
//! puts, prune deletes). Once `archive_block_num` heights have passed
//! since the last rotation, the live snapshot is sealed with its
//! [`SnapshotMeta`], its directory is copied into a dated
//! `snapshot-<height>-<timestamp>/` folder and the origin path is
//! reopened for the next cycle.

use crate::kv::{StorageBackend, StorageBatch};
use crate::snapshot::{SnapshotError, SnapshotMeta};
use crate::utils;
use palisade_types::{BlockHeader, CodecError, EpochInfo, Hash, ValidatorSet};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info};

/// Errors from the archive cycle.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error(transparent)]
    Storage(#[from] crate::kv::StorageError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("archive writer panicked")]
    WriterPanicked,

    #[error("snapshot backend is closed")]
    Closed,
}

/// Dirty and pruned nodes of one trie for one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TrieJournalEntry {
    pub root_hash: Hash,
    pub root_node_key: Vec<u8>,
    pub dirty_set: HashMap<Vec<u8>, Vec<u8>>,
    pub prune_set: HashSet<Vec<u8>>,
}

/// The state delta produced by executing one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StateJournal {
    pub trie_journal: Vec<TrieJournalEntry>,
    pub code_journal: HashMap<Vec<u8>, Vec<u8>>,
}

impl StateJournal {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(|e| CodecError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Drives the per-block archive cycle.
pub struct Archiver<S: StorageBackend> {
    history: Arc<S>,
    journal: Arc<S>,
    snapshot: Option<S>,
    snapshot_path: PathBuf,
    origin_path: PathBuf,
    archive_block_num: u64,
    last_archive_block: u64,
}

impl<S: StorageBackend> Archiver<S> {
    /// Open the live snapshot under `<snapshot_path>/origin` and restore
    /// the last rotation height from it.
    pub fn new(
        snapshot_path: PathBuf,
        history: Arc<S>,
        journal: Arc<S>,
        archive_block_num: u64,
    ) -> Result<Self, ArchiveError> {
        let origin_path = snapshot_path.join("origin");
        std::fs::create_dir_all(&origin_path)?;
        let snapshot = S::open(&origin_path)?;
        let last_archive_block = snapshot
            .get(&utils::composite_key(utils::ARCHIVE_KEY_PREFIX, utils::MAX_HEIGHT))
            .map(|bytes| utils::unmarshal_u64(&bytes))
            .unwrap_or(0);
        Ok(Self {
            history,
            journal,
            snapshot: Some(snapshot),
            snapshot_path,
            origin_path,
            archive_block_num,
            last_archive_block,
        })
    }

    /// Height of the last sealed snapshot.
    pub fn last_archive_block(&self) -> u64 {
        self.last_archive_block
    }

    /// Archive one block's state delta, rotating the snapshot when due.
    pub fn archive(
        &mut self,
        header: &BlockHeader,
        state_journal: &StateJournal,
        epoch_info: &EpochInfo,
        nodes: &ValidatorSet,
    ) -> Result<(), ArchiveError> {
        let snapshot = self.snapshot.as_ref().ok_or(ArchiveError::Closed)?;
        let height = header.number;
        let encoded_journal = state_journal.encode()?;

        std::thread::scope(|scope| -> Result<(), ArchiveError> {
            let journal_write = scope.spawn(|| -> Result<(), ArchiveError> {
                let mut batch = self.journal.new_batch();
                batch.put(
                    &utils::composite_key(utils::JOURNAL_KEY_PREFIX, height),
                    &encoded_journal,
                );
                batch.commit()?;
                Ok(())
            });

            let history_write = scope.spawn(|| -> Result<(), ArchiveError> {
                let mut batch = self.history.new_batch();
                for entry in &state_journal.trie_journal {
                    batch.put(entry.root_hash.as_bytes(), &entry.root_node_key);
                    for (key, value) in &entry.dirty_set {
                        batch.put(key, value);
                    }
                }
                for (key, value) in &state_journal.code_journal {
                    batch.put(key, value);
                }
                batch.commit()?;
                Ok(())
            });

            let snapshot_write = scope.spawn(|| -> Result<(), ArchiveError> {
                let mut batch = snapshot.new_batch();
                for entry in &state_journal.trie_journal {
                    batch.put(entry.root_hash.as_bytes(), &entry.root_node_key);
                    for (key, value) in &entry.dirty_set {
                        batch.put(key, value);
                    }
                    for key in &entry.prune_set {
                        batch.delete(key);
                    }
                }
                for (key, value) in &state_journal.code_journal {
                    batch.put(key, value);
                }
                batch.commit()?;
                Ok(())
            });

            for handle in [journal_write, history_write, snapshot_write] {
                handle.join().map_err(|_| ArchiveError::WriterPanicked)??;
            }
            Ok(())
        })?;
        debug!(height, "Archived state journal");

        if height.saturating_sub(self.last_archive_block) < self.archive_block_num {
            return Ok(());
        }
        self.rotate(header, epoch_info, nodes)
    }

    /// Seal the live snapshot, copy it into a dated folder and reopen
    /// the origin path.
    fn rotate(
        &mut self,
        header: &BlockHeader,
        epoch_info: &EpochInfo,
        nodes: &ValidatorSet,
    ) -> Result<(), ArchiveError> {
        let height = header.number;
        let meta = SnapshotMeta {
            block_header: header.clone(),
            epoch_info: epoch_info.clone(),
            nodes: nodes.clone(),
        };

        {
            let snapshot = self.snapshot.as_ref().ok_or(ArchiveError::Closed)?;
            let mut batch = snapshot.new_batch();
            batch.put(utils::SNAPSHOT_META_KEY, &meta.marshal()?);
            batch.put(
                &utils::composite_key(utils::JOURNAL_KEY_PREFIX, utils::MIN_HEIGHT),
                &utils::marshal_u64(height),
            );
            batch.put(
                &utils::composite_key(utils::JOURNAL_KEY_PREFIX, utils::MAX_HEIGHT),
                &utils::marshal_u64(height),
            );
            batch.put(
                &utils::composite_key(utils::ARCHIVE_KEY_PREFIX, utils::MAX_HEIGHT),
                &utils::marshal_u64(height),
            );
            batch.commit()?;
        }

        // Close the live snapshot before copying its directory.
        drop(self.snapshot.take());

        let timestamp = format_utc_timestamp(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        );
        let target = self
            .snapshot_path
            .join(format!("snapshot-{height}-{timestamp}"));
        std::fs::create_dir_all(&target)?;
        copy_dir(&self.origin_path, &target)?;

        self.snapshot = Some(S::open(&self.origin_path)?);
        self.last_archive_block = height;
        info!(height, target = %target.display(), "Rotated archive snapshot");
        Ok(())
    }
}

/// `YYYY-MM-DDTHH-MM-SS` in UTC from Unix seconds.
fn format_utc_timestamp(secs: u64) -> String {
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;
    let (hour, minute, second) = (rem / 3_600, rem % 3_600 / 60, rem % 60);

    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);

    format!("{year:04}-{month:02}-{day:02}T{hour:02}-{minute:02}-{second:02}")
}

fn copy_dir(src: &Path, dest: &Path) -> io::Result<()> {
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dest_path = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            std::fs::create_dir_all(&dest_path)?;
            copy_dir(&src_path, &dest_path)?;
        } else {
            std::fs::copy(&src_path, &dest_path)?;
        }
    }
    Ok(())
}
