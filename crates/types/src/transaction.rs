//! Transactions and the capability trait the pool is generic over.

use crate::{Address, CodecError, Hash};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

/// Maximum accepted transaction payload, in bytes.
pub const MAX_TX_PAYLOAD_SIZE: usize = 128 * 1024;

/// Base intrinsic gas charged for any transaction.
const INTRINSIC_GAS_BASE: u64 = 21_000;
/// Intrinsic gas per zero payload byte.
const INTRINSIC_GAS_ZERO_BYTE: u64 = 4;
/// Intrinsic gas per non-zero payload byte.
const INTRINSIC_GAS_NONZERO_BYTE: u64 = 16;

/// Capabilities the transaction pool requires from its transaction type.
///
/// The pool itself never inspects payloads; it orders by `(sender, nonce)`,
/// deduplicates by `hash` and accounts for memory by `size`.
pub trait PoolTransaction: Clone + Send + Sync + 'static {
    /// Stable content fingerprint.
    fn hash(&self) -> Hash;

    /// Originating account.
    fn sender(&self) -> Address;

    /// Per-account sequence number.
    fn nonce(&self) -> u64;

    /// Price offered per unit of gas, used by the replacement policy.
    fn gas_price(&self) -> u64;

    /// Approximate in-memory/wire size in bytes.
    fn size(&self) -> usize;

    /// Marshal to bytes.
    fn encode(&self) -> Result<Vec<u8>, CodecError>;

    /// Unmarshal from bytes.
    fn decode(bytes: &[u8]) -> Result<Self, CodecError>
    where
        Self: Sized;
}

/// An Ed25519-signed transaction with an opaque payload.
///
/// The signable portion is everything except the signature; the content
/// hash covers the full encoding including the signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub chain_id: u64,
    pub nonce: u64,
    pub gas_price: u64,
    pub gas_limit: u64,
    pub value: i128,
    pub payload: Vec<u8>,
    pub public_key: [u8; 32],
    pub signature: Vec<u8>,
}

#[derive(Serialize)]
struct Signable<'a> {
    chain_id: u64,
    nonce: u64,
    gas_price: u64,
    gas_limit: u64,
    value: i128,
    payload: &'a [u8],
    public_key: &'a [u8; 32],
}

impl SignedTransaction {
    /// Build and sign a transaction with the given account key.
    pub fn sign(
        chain_id: u64,
        nonce: u64,
        gas_price: u64,
        gas_limit: u64,
        value: i128,
        payload: Vec<u8>,
        key: &SigningKey,
    ) -> Self {
        let public_key = key.verifying_key().to_bytes();
        let mut tx = Self {
            chain_id,
            nonce,
            gas_price,
            gas_limit,
            value,
            payload,
            public_key,
            signature: Vec::new(),
        };
        let signature: Signature = key.sign(&tx.signable_bytes());
        tx.signature = signature.to_bytes().to_vec();
        tx
    }

    fn signable_bytes(&self) -> Vec<u8> {
        let signable = Signable {
            chain_id: self.chain_id,
            nonce: self.nonce,
            gas_price: self.gas_price,
            gas_limit: self.gas_limit,
            value: self.value,
            payload: &self.payload,
            public_key: &self.public_key,
        };
        // Serializing a flat struct of integers and byte slices cannot fail.
        bincode::serialize(&signable).expect("signable encoding")
    }

    /// Check the Ed25519 signature against the embedded public key.
    pub fn verify_signature(&self) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(&self.public_key) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(self.signature.as_slice()) else {
            return false;
        };
        let signature = Signature::from_bytes(&sig_bytes);
        verifying_key
            .verify(&self.signable_bytes(), &signature)
            .is_ok()
    }

    /// Intrinsic gas for this transaction: a fixed base plus a per-byte
    /// charge that discounts zero bytes.
    pub fn intrinsic_gas(&self) -> u64 {
        let zeros = self.payload.iter().filter(|b| **b == 0).count() as u64;
        let nonzeros = self.payload.len() as u64 - zeros;
        INTRINSIC_GAS_BASE
            + zeros * INTRINSIC_GAS_ZERO_BYTE
            + nonzeros * INTRINSIC_GAS_NONZERO_BYTE
    }
}

impl PoolTransaction for SignedTransaction {
    fn hash(&self) -> Hash {
        let mut bytes = self.signable_bytes();
        bytes.extend_from_slice(&self.signature);
        Hash::digest(&bytes)
    }

    fn sender(&self) -> Address {
        Address::from_public_key(&self.public_key)
    }

    fn nonce(&self) -> u64 {
        self.nonce
    }

    fn gas_price(&self) -> u64 {
        self.gas_price
    }

    fn size(&self) -> usize {
        // Fixed fields plus payload and signature.
        8 * 4 + 16 + 32 + self.payload.len() + self.signature.len()
    }

    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
