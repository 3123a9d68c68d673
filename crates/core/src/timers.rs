//! Named batch timers.
//!
//! Two timers drive block production: `Batch` (generate-block period)
//! and `NoTxBatch` (empty-block period). On expiry exactly one
//! [`ConsensusEvent::Timeout`] is posted to the serializer; timers are
//! never auto-rearmed. A timeout may still be delivered after `stop` if
//! the stop raced the fire, so the serializer must tolerate spurious
//! expiries.

use crate::{ConsensusEvent, TimerError};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Named timers owned by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Generate-block period.
    Batch,
    /// Empty-block period.
    NoTxBatch,
}

struct TimerEntry {
    duration: Duration,
    handle: Option<JoinHandle<()>>,
}

/// Manages the batch timers for one engine.
///
/// Thread-safe by construction: timer handles are guarded by an
/// internal mutex, so callbacks and the serializer may start and stop
/// timers concurrently.
pub struct BatchTimerManager {
    event_tx: mpsc::Sender<ConsensusEvent>,
    timers: Mutex<HashMap<TimerId, TimerEntry>>,
}

impl BatchTimerManager {
    pub fn new(event_tx: mpsc::Sender<ConsensusEvent>) -> Self {
        Self {
            event_tx,
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a timer with its period. Must be called before
    /// `start`/`restart`; re-creating replaces the period and stops any
    /// running instance.
    pub fn create(&self, id: TimerId, duration: Duration) {
        let mut timers = self.timers.lock().expect("timer lock");
        if let Some(existing) = timers.insert(
            id,
            TimerEntry {
                duration,
                handle: None,
            },
        ) {
            if let Some(handle) = existing.handle {
                handle.abort();
            }
        }
        debug!(?id, ?duration, "Timer created");
    }

    /// Arm a timer for one expiry. A no-op if it is already running.
    pub fn start(&self, id: TimerId) -> Result<(), TimerError> {
        let mut timers = self.timers.lock().expect("timer lock");
        let entry = timers.get_mut(&id).ok_or(TimerError::Unknown(id))?;
        if entry.handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }
        entry.handle = Some(self.spawn_timer(id, entry.duration));
        trace!(?id, "Timer started");
        Ok(())
    }

    /// Disarm a timer. The expiry may already be in flight.
    pub fn stop(&self, id: TimerId) {
        let mut timers = self.timers.lock().expect("timer lock");
        if let Some(entry) = timers.get_mut(&id) {
            if let Some(handle) = entry.handle.take() {
                handle.abort();
                trace!(?id, "Timer stopped");
            }
        }
    }

    /// Stop-then-start. Safe to call while the timer is active.
    pub fn restart(&self, id: TimerId) -> Result<(), TimerError> {
        let mut timers = self.timers.lock().expect("timer lock");
        let entry = timers.get_mut(&id).ok_or(TimerError::Unknown(id))?;
        if let Some(handle) = entry.handle.take() {
            handle.abort();
        }
        entry.handle = Some(self.spawn_timer(id, entry.duration));
        trace!(?id, "Timer restarted");
        Ok(())
    }

    /// Whether the timer is armed and has not yet fired.
    pub fn is_active(&self, id: TimerId) -> bool {
        let timers = self.timers.lock().expect("timer lock");
        timers
            .get(&id)
            .and_then(|e| e.handle.as_ref())
            .is_some_and(|h| !h.is_finished())
    }

    /// Stop every timer; used on shutdown.
    pub fn stop_all(&self) {
        let mut timers = self.timers.lock().expect("timer lock");
        for (id, entry) in timers.iter_mut() {
            if let Some(handle) = entry.handle.take() {
                handle.abort();
                trace!(?id, "Timer stopped (shutdown)");
            }
        }
    }

    fn spawn_timer(&self, id: TimerId, duration: Duration) -> JoinHandle<()> {
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if event_tx.send(ConsensusEvent::Timeout(id)).await.is_err() {
                trace!(?id, "Timer fired after serializer shutdown");
            }
        })
    }
}

impl Drop for BatchTimerManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timer_fires_once() {
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let mgr = BatchTimerManager::new(event_tx);
        mgr.create(TimerId::Batch, Duration::from_millis(10));
        mgr.start(TimerId::Batch).unwrap();

        let event = tokio::time::timeout(Duration::from_millis(200), event_rx.recv())
            .await
            .expect("timer should fire")
            .expect("channel open");
        assert!(matches!(event, ConsensusEvent::Timeout(TimerId::Batch)));

        // Not auto-rearmed.
        let second = tokio::time::timeout(Duration::from_millis(50), event_rx.recv()).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn stop_cancels_pending_expiry() {
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let mgr = BatchTimerManager::new(event_tx);
        mgr.create(TimerId::NoTxBatch, Duration::from_millis(50));
        mgr.start(TimerId::NoTxBatch).unwrap();
        mgr.stop(TimerId::NoTxBatch);

        let fired = tokio::time::timeout(Duration::from_millis(120), event_rx.recv()).await;
        assert!(fired.is_err(), "stopped timer should not fire");
        assert!(!mgr.is_active(TimerId::NoTxBatch));
    }

    #[tokio::test]
    async fn restart_while_active_rearms() {
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let mgr = BatchTimerManager::new(event_tx);
        mgr.create(TimerId::Batch, Duration::from_millis(40));
        mgr.start(TimerId::Batch).unwrap();
        assert!(mgr.is_active(TimerId::Batch));
        mgr.restart(TimerId::Batch).unwrap();

        let event = tokio::time::timeout(Duration::from_millis(200), event_rx.recv())
            .await
            .expect("restarted timer should fire")
            .expect("channel open");
        assert!(matches!(event, ConsensusEvent::Timeout(TimerId::Batch)));
    }

    #[tokio::test]
    async fn start_unknown_timer_errors() {
        let (event_tx, _event_rx) = mpsc::channel(8);
        let mgr = BatchTimerManager::new(event_tx);
        assert_eq!(
            mgr.start(TimerId::Batch),
            Err(TimerError::Unknown(TimerId::Batch))
        );
    }

    #[tokio::test]
    async fn start_is_idempotent_while_active() {
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let mgr = BatchTimerManager::new(event_tx);
        mgr.create(TimerId::Batch, Duration::from_millis(20));
        mgr.start(TimerId::Batch).unwrap();
        mgr.start(TimerId::Batch).unwrap();

        let _ = tokio::time::timeout(Duration::from_millis(200), event_rx.recv())
            .await
            .expect("timer should fire");
        let second = tokio::time::timeout(Duration::from_millis(60), event_rx.recv()).await;
        assert!(second.is_err(), "double start must not arm two timers");
    }
}
