//! Peer wire envelope.
//!
//! Every peer message is wrapped in `{Type, Version, Data}`. `PushTxs`
//! data is the shared length-prefixed framing of marshalled
//! transactions; `Consensus` data is the agreement library's opaque
//! payload and round-trips byte-exact.

use crate::{frame, CodecError, PoolTransaction};
use serde::{Deserialize, Serialize};

/// Current wire format version.
pub const WIRE_VERSION: &str = "0.1.0";

/// Kinds of peer messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    PushTxs,
    Consensus,
}

/// Envelope for a message to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkMessage {
    pub msg_type: MessageType,
    pub version: String,
    pub data: Vec<u8>,
}

impl NetworkMessage {
    /// Wrap a set of transactions for gossip to peers.
    pub fn push_txs<T: PoolTransaction>(txs: &[T]) -> Result<Self, CodecError> {
        let payloads = txs.iter().map(|tx| tx.encode()).collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            msg_type: MessageType::PushTxs,
            version: WIRE_VERSION.to_string(),
            data: frame::encode_frames(&payloads),
        })
    }

    /// Wrap an opaque agreement payload.
    pub fn consensus(data: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Consensus,
            version: WIRE_VERSION.to_string(),
            data,
        }
    }

    /// Unpack a `PushTxs` payload back into transactions.
    pub fn decode_txs<T: PoolTransaction>(&self) -> Result<Vec<T>, CodecError> {
        frame::decode_frames(&self.data)?
            .iter()
            .map(|bytes| T::decode(bytes))
            .collect()
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(|e| CodecError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
