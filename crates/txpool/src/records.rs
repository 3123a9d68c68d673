//! Local transaction journal.
//!
//! An append-only file of length-prefixed records, one marshalled local
//! transaction per record. Appends are buffered and flushed every 100
//! records or once a second; rotation rewrites the file from the live
//! local set and swaps it in with a rename so a crash mid-rotate leaves
//! the old journal intact.

use palisade_types::{frame, PoolTransaction};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Journal file name.
pub const TX_RECORDS_FILE: &str = "tx_records.pb";

/// Records buffered before a forced flush.
const TX_RECORDS_BATCH_WRITE: usize = 100;
/// Command channel depth.
const TX_RECORDS_CHAN_SIZE: usize = 1_024;
/// Flush interval for a partially filled buffer.
const WRITE_TIMEOUT_DURATION: Duration = Duration::from_secs(1);

enum RecordsCmd<T> {
    Append(Arc<T>),
    Rotate {
        locals: Vec<Arc<T>>,
        resp: oneshot::Sender<io::Result<()>>,
    },
}

/// Handle to the journal writer task.
pub struct TxRecords<T: PoolTransaction> {
    cmd_tx: mpsc::Sender<RecordsCmd<T>>,
}

impl<T: PoolTransaction> TxRecords<T> {
    /// Open (or create) the journal and spawn its writer task.
    pub fn spawn(path: PathBuf, mut shutdown: watch::Receiver<bool>) -> io::Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let (cmd_tx, mut cmd_rx) = mpsc::channel(TX_RECORDS_CHAN_SIZE);

        tokio::spawn(async move {
            let mut writer = BufWriter::new(file);
            let mut buffer: Vec<Arc<T>> = Vec::new();
            let mut tick = tokio::time::interval(WRITE_TIMEOUT_DURATION);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(RecordsCmd::Append(tx)) => {
                            buffer.push(tx);
                            if buffer.len() >= TX_RECORDS_BATCH_WRITE {
                                flush(&mut writer, &mut buffer);
                            }
                        }
                        Some(RecordsCmd::Rotate { locals, resp }) => {
                            // Buffered entries are part of the live set the
                            // snapshot was taken from; the rewrite covers them.
                            buffer.clear();
                            let result = rotate(&path, &locals).map(|file| {
                                writer = BufWriter::new(file);
                            });
                            let _ = resp.send(result);
                        }
                        None => break,
                    },
                    _ = tick.tick() => {
                        if !buffer.is_empty() {
                            flush(&mut writer, &mut buffer);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            if !buffer.is_empty() {
                flush(&mut writer, &mut buffer);
            }
            if let Err(e) = writer.flush() {
                error!(error = %e, "Journal final flush failed");
            }
            debug!("Journal writer exited");
        });

        Ok(Self { cmd_tx })
    }

    /// Queue a local transaction for appending. Never blocks the
    /// serializer; a full command channel is logged and the record is
    /// picked up by the next rotation.
    pub fn append(&self, tx: Arc<T>) {
        if let Err(e) = self.cmd_tx.try_send(RecordsCmd::Append(tx)) {
            warn!(error = %e, "Journal append queue full, record deferred to rotation");
        }
    }

    /// Atomically rewrite the journal from the surviving local set.
    pub async fn rotate(&self, locals: Vec<Arc<T>>) -> io::Result<()> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.cmd_tx
            .send(RecordsCmd::Rotate {
                locals,
                resp: resp_tx,
            })
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "journal writer stopped"))?;
        resp_rx
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "journal writer stopped"))?
    }
}

/// Flush buffered records; on error the buffer is kept for the next try.
fn flush<T: PoolTransaction>(writer: &mut BufWriter<File>, buffer: &mut Vec<Arc<T>>) {
    let result = (|| -> io::Result<()> {
        for tx in buffer.iter() {
            let bytes = tx
                .encode()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            frame::write_frame(writer, &bytes)?;
        }
        writer.flush()
    })();
    match result {
        Ok(()) => buffer.clear(),
        Err(e) => error!(error = %e, pending = buffer.len(), "Journal flush failed, will retry"),
    }
}

/// Rewrite the journal into `path + ".new"`, fsync, rename over `path`
/// and reopen for append. A failure before the rename leaves the old
/// file untouched.
fn rotate<T: PoolTransaction>(path: &Path, locals: &[Arc<T>]) -> io::Result<File> {
    let mut new_path = path.as_os_str().to_owned();
    new_path.push(".new");
    let new_path = PathBuf::from(new_path);
    let mut replacement = BufWriter::new(File::create(&new_path)?);
    let mut written = 0usize;
    for tx in locals {
        match tx.encode() {
            Ok(bytes) => {
                frame::write_frame(&mut replacement, &bytes)?;
                written += 1;
            }
            Err(e) => error!(error = %e, "Journal rotate skipped unencodable transaction"),
        }
    }
    replacement.flush()?;
    replacement.get_ref().sync_all()?;
    drop(replacement);

    std::fs::rename(&new_path, path)?;
    let file = OpenOptions::new().append(true).open(path)?;
    info!(records = written, "Journal rotated");
    Ok(file)
}

/// Scan the journal, yielding every decodable record.
///
/// A record with a broken frame ends the scan (there is no boundary to
/// resynchronize on); a record that frames correctly but fails to decode
/// is skipped and scanning continues. A missing file yields nothing.
pub fn load_records<T: PoolTransaction>(path: &Path) -> Vec<T> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            error!(error = %e, path = %path.display(), "Journal open failed");
            return Vec::new();
        }
    };
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    let mut skipped = 0usize;
    loop {
        match frame::read_frame(&mut reader) {
            Ok(Some(payload)) => match T::decode(&payload) {
                Ok(tx) => records.push(tx),
                Err(e) => {
                    skipped += 1;
                    warn!(error = %e, "Journal record undecodable, skipping");
                }
            },
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Journal truncated, stopping scan");
                break;
            }
        }
    }
    info!(
        loaded = records.len(),
        skipped,
        path = %path.display(),
        "Journal loaded"
    );
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_types::test_utils::{test_key, test_tx};
    use palisade_types::SignedTransaction;

    fn journal_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join(TX_RECORDS_FILE)
    }

    #[tokio::test]
    async fn append_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = journal_path(&dir);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let records = TxRecords::spawn(path.clone(), shutdown_rx).unwrap();

        let key = test_key(1);
        let txs: Vec<_> = (1..=5).map(|n| test_tx(&key, n)).collect();
        for tx in &txs {
            records.append(Arc::new(tx.clone()));
        }
        // Below the batch threshold, so wait for the interval flush.
        tokio::time::sleep(Duration::from_millis(1_200)).await;

        let loaded: Vec<SignedTransaction> = load_records(&path);
        assert_eq!(loaded, txs);
    }

    #[tokio::test]
    async fn batch_threshold_forces_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = journal_path(&dir);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let records = TxRecords::spawn(path.clone(), shutdown_rx).unwrap();

        let key = test_key(2);
        for n in 1..=(TX_RECORDS_BATCH_WRITE as u64) {
            records.append(Arc::new(test_tx(&key, n)));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let loaded: Vec<SignedTransaction> = load_records(&path);
        assert_eq!(loaded.len(), TX_RECORDS_BATCH_WRITE);
    }

    #[tokio::test]
    async fn rotate_keeps_exactly_the_surviving_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = journal_path(&dir);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let records = TxRecords::spawn(path.clone(), shutdown_rx).unwrap();

        let key = test_key(3);
        for n in 1..=10 {
            records.append(Arc::new(test_tx(&key, n)));
        }
        tokio::time::sleep(Duration::from_millis(1_200)).await;

        // Only odd nonces survive in the pool snapshot.
        let survivors: Vec<Arc<SignedTransaction>> = (1..=10)
            .filter(|n| n % 2 == 1)
            .map(|n| Arc::new(test_tx(&key, n)))
            .collect();
        records.rotate(survivors.clone()).await.unwrap();

        let loaded: Vec<SignedTransaction> = load_records(&path);
        assert_eq!(loaded.len(), 5);
        let nonces: Vec<u64> = loaded.iter().map(|tx| tx.nonce).collect();
        assert_eq!(nonces, vec![1, 3, 5, 7, 9]);

        // Appends after rotation land in the reopened file.
        records.append(Arc::new(test_tx(&key, 11)));
        tokio::time::sleep(Duration::from_millis(1_200)).await;
        let loaded: Vec<SignedTransaction> = load_records(&path);
        assert_eq!(loaded.len(), 6);
    }

    #[tokio::test]
    async fn load_skips_undecodable_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = journal_path(&dir);

        let key = test_key(4);
        let good = test_tx(&key, 1);
        let mut file = File::create(&path).unwrap();
        frame::write_frame(&mut file, &good.encode().unwrap()).unwrap();
        frame::write_frame(&mut file, b"not a transaction").unwrap();
        let also_good = test_tx(&key, 2);
        frame::write_frame(&mut file, &also_good.encode().unwrap()).unwrap();
        drop(file);

        let loaded: Vec<SignedTransaction> = load_records(&path);
        assert_eq!(loaded, vec![good, also_good]);
    }

    #[tokio::test]
    async fn load_stops_at_truncated_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = journal_path(&dir);

        let key = test_key(5);
        let good = test_tx(&key, 1);
        let mut bytes = Vec::new();
        frame::write_frame(&mut bytes, &good.encode().unwrap()).unwrap();
        frame::write_frame(&mut bytes, &test_tx(&key, 2).encode().unwrap()).unwrap();
        bytes.truncate(bytes.len() - 3);
        std::fs::write(&path, bytes).unwrap();

        let loaded: Vec<SignedTransaction> = load_records(&path);
        assert_eq!(loaded, vec![good]);
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: Vec<SignedTransaction> = load_records(&journal_path(&dir));
        assert!(loaded.is_empty());
    }
}
