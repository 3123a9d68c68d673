//! Key layout helpers for the ledger KV namespaces.

use palisade_types::{Address, Hash};

/// Key of the snapshot meta blob.
pub const SNAPSHOT_META_KEY: &[u8] = b"snapshot_meta";

/// Prefix for per-height state journal records.
pub const JOURNAL_KEY_PREFIX: &str = "state_journal.";
/// Prefix for archive bookkeeping.
pub const ARCHIVE_KEY_PREFIX: &str = "archive.";
/// Suffix naming the lowest covered height.
pub const MIN_HEIGHT: &str = "minHeight";
/// Suffix naming the highest covered height.
pub const MAX_HEIGHT: &str = "maxHeight";

/// `{prefix}{suffix}` as bytes.
pub fn composite_key(prefix: &str, suffix: impl std::fmt::Display) -> Vec<u8> {
    format!("{prefix}{suffix}").into_bytes()
}

/// Key of a contract code blob: `code.{address}.{code_hash}`.
pub fn code_key(address: &Address, code_hash: &Hash) -> Vec<u8> {
    let mut key = b"code.".to_vec();
    key.extend_from_slice(address.as_bytes());
    key.push(b'.');
    key.extend_from_slice(code_hash.as_bytes());
    key
}

pub fn marshal_u64(value: u64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

pub fn unmarshal_u64(bytes: &[u8]) -> u64 {
    let mut out = [0u8; 8];
    let n = bytes.len().min(8);
    out[8 - n..].copy_from_slice(&bytes[bytes.len() - n..]);
    u64::from_be_bytes(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_keys() {
        assert_eq!(
            composite_key(JOURNAL_KEY_PREFIX, 7),
            b"state_journal.7".to_vec()
        );
        assert_eq!(
            composite_key(ARCHIVE_KEY_PREFIX, MAX_HEIGHT),
            b"archive.maxHeight".to_vec()
        );
    }

    #[test]
    fn u64_round_trip() {
        for value in [0u64, 1, 255, 1 << 40, u64::MAX] {
            assert_eq!(unmarshal_u64(&marshal_u64(value)), value);
        }
    }
}
