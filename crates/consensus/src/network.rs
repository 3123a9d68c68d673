//! Peer manager contract.
//!
//! Peer discovery and transport are external collaborators; the engines
//! only need fire-and-forget delivery of wire envelopes.

use palisade_core::EngineError;
use palisade_types::NetworkMessage;

/// Outbound messaging surface the engines depend on.
pub trait PeerManager: Send + Sync {
    /// Send to every connected peer.
    fn broadcast(&self, msg: NetworkMessage) -> Result<(), EngineError>;

    /// Send to one peer by validator id.
    fn unicast(&self, to: u64, msg: NetworkMessage) -> Result<(), EngineError>;

    /// Connected peer count, used by the startup quorum check.
    fn count_connected_peers(&self) -> u64;
}
