//! The two-sided contract between the node and the agreement library.

use palisade_core::{EngineError, SystemStatus};
use palisade_types::{Hash, SignedTransaction};

/// Execution state reported to the agreement library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceState {
    pub height: u64,
    pub digest: Hash,
    pub epoch: u64,
}

/// A batch proposal handed to the agreement library for ordering.
///
/// Requests are the marshalled transactions in batch order; the digest
/// and timestamp travel with the proposal so the executed batch can be
/// evicted from the pool by the same identity.
#[derive(Debug, Clone)]
pub struct BatchProposal {
    pub batch_hash: Hash,
    pub requests: Vec<Vec<u8>>,
    pub local_flags: Vec<bool>,
    pub timestamp: i64,
}

/// A membership change applied through the agreement protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfChange {
    pub node_id: u64,
}

/// Surface the node consumes from the external agreement library.
pub trait Agreement: Send + Sync {
    fn start(&self) -> Result<(), EngineError>;

    fn stop(&self);

    fn status(&self) -> SystemStatus;

    /// Feed an inbound agreement message. The payload is the library's
    /// own wire format and round-trips byte-exact.
    fn step(&self, msg: Vec<u8>) -> Result<(), EngineError>;

    /// Hand a batch to the protocol for ordering.
    fn propose(&self, batch: BatchProposal) -> Result<(), EngineError>;

    /// The block at `state.height` has been executed and applied.
    fn report_executed(&self, state: ServiceState);

    /// State transfer finished at `state.height`.
    fn report_state_updated(&self, state: ServiceState);

    /// The checkpoint at `height` is stable; logs below it may go.
    fn report_stable_checkpoint_finished(&self, height: u64);

    fn apply_conf_change(&self, change: ConfChange);
}

/// Surface the agreement library calls back into — the host contract
/// the adaptor implements.
pub trait AgreementHost: Send + Sync {
    /// Fire-and-forget broadcast of an agreement payload to all peers.
    fn broadcast(&self, msg: Vec<u8>);

    /// Fire-and-forget send to one peer.
    fn unicast(&self, to: u64, msg: Vec<u8>);

    /// Durably store view/checkpoint state.
    fn persist(&self, key: &[u8], value: &[u8]) -> Result<(), EngineError>;

    /// Read back persisted state.
    fn read_state(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Sign a digest with the node key.
    fn sign(&self, digest: &[u8]) -> Vec<u8>;

    /// Verify a replica's signature over a digest.
    fn verify(&self, node_id: u64, digest: &[u8], signature: &[u8]) -> bool;

    /// Begin asynchronous ledger catch-up towards `target_height`.
    fn state_update(&self, target_height: u64, digest: Hash, peers: Vec<u64>);

    /// Deliver an ordered batch for execution. Calls arrive in strict
    /// height order.
    fn execute(&self, batch: ExecuteContext);
}

/// Arguments of one `execute` callback.
#[derive(Debug, Clone)]
pub struct ExecuteContext {
    pub batch_hash: Hash,
    pub txs: Vec<SignedTransaction>,
    pub local_list: Vec<bool>,
    pub height: u64,
    pub timestamp: i64,
}
