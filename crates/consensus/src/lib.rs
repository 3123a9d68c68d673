//! Ordering engines for the palisade consensus core.
//!
//! Two interchangeable engines present one uniform [`ConsensusEngine`]
//! contract to the rest of the node:
//!
//! - [`solo::SoloNode`]: a single-sequencer engine used in development.
//!   This node is the sole proposer, `quorum() == 1` and consensus
//!   messages are no-ops.
//! - [`rbft::RbftNode`]: a Byzantine-fault-tolerant replicated engine
//!   wrapping an external agreement library behind the
//!   [`rbft::Agreement`] contract, with [`rbft::RbftAdaptor`] as the
//!   host surface the library calls back into.
//!
//! Both engines share the transaction pool, pre-check worker, journal
//! and batch timers, and both run one serializer task that owns all
//! consensus-affecting state.

mod config;
mod engine;
mod feed;
mod metrics;
mod network;

pub mod rbft;
pub mod solo;

pub use config::{ConsensusConfig, EpochProviderFn};
pub use engine::ConsensusEngine;
pub use network::PeerManager;
