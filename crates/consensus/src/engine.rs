//! The uniform contract both ordering engines present to the node.

use async_trait::async_trait;
use palisade_core::EngineError;
use palisade_types::{CommitEvent, Hash, SignedTransaction};
use tokio::sync::mpsc;

/// Node-facing API of an ordering engine.
#[async_trait]
pub trait ConsensusEngine: Send + Sync {
    /// Submit a client transaction. Resolves once the pre-check and the
    /// pool admission have both answered, or after the prepare timeout.
    async fn prepare(&self, tx: SignedTransaction) -> Result<(), EngineError>;

    /// Submit marshalled transactions received from a peer.
    async fn submit_txs_from_remote(&self, txs: Vec<Vec<u8>>) -> Result<(), EngineError>;

    /// Feed an inbound consensus message (the opaque agreement payload).
    fn step(&self, msg: Vec<u8>) -> Result<(), EngineError>;

    /// Take the committed-block stream. Yields `Some` exactly once.
    fn take_commit_receiver(&self) -> Option<mpsc::Receiver<CommitEvent>>;

    /// Executor callback: the block at `height` has been applied.
    fn report_state(&self, height: u64, block_hash: Hash, tx_hash_list: Vec<Hash>);

    /// Subscribe to admitted transactions.
    fn subscribe_tx_event(&self, ch: mpsc::UnboundedSender<Vec<SignedTransaction>>);

    /// `Ok` when the engine can accept work; otherwise the status string.
    fn ready(&self) -> Result<(), EngineError>;

    /// Votes required for agreement.
    fn quorum(&self) -> u64;

    /// The agreement log low watermark (= last executed height).
    async fn get_low_watermark(&self) -> Result<u64, EngineError>;

    /// Remove a replica from the validator set. Membership reduction is
    /// not supported.
    fn remove_node(&self, _node_id: u64) -> Result<(), EngineError> {
        Err(EngineError::Unsupported("remove node"))
    }

    /// Stop the engine. Pending `prepare` calls fail with `Stopped`.
    fn stop(&self);
}
