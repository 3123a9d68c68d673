//! Event, timer and error plumbing for the palisade consensus engines.
//!
//! Each ordering engine runs one **serializer task** that owns all
//! mutable consensus state (pool, batch store, epoch config). Everything
//! else — client API, pre-check workers, timers, executor callbacks —
//! talks to it by posting a tagged [`ConsensusEvent`] on a single
//! multi-producer channel:
//!
//! ```text
//! clients / network / timers / executor ──▶ mpsc ──▶ serializer ──▶ pool, agreement, commit stream
//! ```
//!
//! The serializer never holds a lock across I/O; queries round-trip
//! through the channel with a oneshot reply.

mod error;
mod event;
mod timers;

pub use error::{EngineError, PoolError, PrecheckError, SystemStatus, TimerError};
pub use event::ConsensusEvent;
pub use timers::{BatchTimerManager, TimerId};
