//! Content-addressed state trie.
//!
//! Nodes are stored at the SHA-256 hash of their encoding, so the key
//! of every node doubles as its integrity check. Internal nodes hold up
//! to 16 children, indexed by the nibbles of the hashed entry key;
//! leaves hold the entry key and value.

use crate::kv::Storage;
use palisade_types::Hash;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors from trie traversal or construction.
#[derive(Debug, Error)]
pub enum TrieError {
    #[error("missing trie node {0}")]
    MissingNode(Hash),

    #[error("corrupt trie node: {0}")]
    Corrupt(String),

    #[error("trie iteration timed out")]
    Timeout,

    #[error("storage error: {0}")]
    Storage(#[from] crate::kv::StorageError),
}

/// A trie node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrieNode {
    Internal { children: Vec<Option<Hash>> },
    Leaf { key: Vec<u8>, value: Vec<u8> },
}

impl TrieNode {
    pub fn encode(&self) -> Vec<u8> {
        // Enum of plain fields; encoding cannot fail.
        bincode::serialize(self).expect("trie node encoding")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TrieError> {
        bincode::deserialize(bytes).map_err(|e| TrieError::Corrupt(e.to_string()))
    }

    pub fn hash(&self) -> Hash {
        Hash::digest(&self.encode())
    }
}

/// Nibble of the hashed entry key at `depth`.
fn nibble(path: &Hash, depth: usize) -> usize {
    let byte = path.as_bytes()[depth / 2];
    if depth % 2 == 0 {
        (byte >> 4) as usize
    } else {
        (byte & 0x0f) as usize
    }
}

/// Writes a trie into storage from a flat entry set.
pub struct TrieBuilder<'a> {
    storage: &'a dyn Storage,
}

impl<'a> TrieBuilder<'a> {
    pub fn new(storage: &'a dyn Storage) -> Self {
        Self { storage }
    }

    /// Build a trie over the entries and return its root hash.
    /// Entry keys must be unique.
    pub fn build(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<Hash, TrieError> {
        let items: Vec<(Hash, &[u8], &[u8])> = entries
            .iter()
            .map(|(key, value)| (Hash::digest(key), key.as_slice(), value.as_slice()))
            .collect();
        self.build_subtree(&items, 0)
    }

    fn build_subtree(&self, items: &[(Hash, &[u8], &[u8])], depth: usize) -> Result<Hash, TrieError> {
        let node = match items {
            [] => TrieNode::Internal {
                children: vec![None; 16],
            },
            [(_, key, value)] => TrieNode::Leaf {
                key: key.to_vec(),
                value: value.to_vec(),
            },
            _ => {
                let mut buckets: Vec<Vec<(Hash, &[u8], &[u8])>> = vec![Vec::new(); 16];
                for item in items {
                    buckets[nibble(&item.0, depth)].push(*item);
                }
                let mut children = vec![None; 16];
                for (slot, bucket) in buckets.iter().enumerate() {
                    if !bucket.is_empty() {
                        children[slot] = Some(self.build_subtree(bucket, depth + 1)?);
                    }
                }
                TrieNode::Internal { children }
            }
        };
        let hash = node.hash();
        self.storage.put(hash.as_bytes(), &node.encode())?;
        Ok(hash)
    }
}

/// One node yielded by a [`TrieIterator`].
#[derive(Debug, Clone)]
pub struct IteratedNode {
    /// Storage key of the node (its content hash).
    pub raw_key: Vec<u8>,
    /// Encoded node bytes.
    pub raw_value: Vec<u8>,
    /// `(key, value)` when the node is a leaf.
    pub leaf: Option<(Vec<u8>, Vec<u8>)>,
}

/// Streaming BFS over one trie.
///
/// The walk runs on its own thread and hands nodes over a channel
/// bounded by `buffer` entries; a consumer that stalls for longer than
/// `timeout` aborts the iteration with [`TrieError::Timeout`].
pub struct TrieIterator {
    rx: Receiver<Result<IteratedNode, TrieError>>,
    timeout: Duration,
}

impl TrieIterator {
    pub fn new(
        root: Hash,
        storage: Arc<dyn Storage>,
        buffer: usize,
        timeout: Duration,
        leaf_only: bool,
    ) -> Self {
        let (tx, rx) = sync_channel(buffer);
        std::thread::spawn(move || {
            if root.is_zero() {
                return;
            }
            let mut queue = VecDeque::from([root]);
            while let Some(hash) = queue.pop_front() {
                let Some(bytes) = storage.get(hash.as_bytes()) else {
                    let _ = tx.send(Err(TrieError::MissingNode(hash)));
                    return;
                };
                let node = match TrieNode::decode(&bytes) {
                    Ok(node) => node,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };
                let leaf = match &node {
                    TrieNode::Internal { children } => {
                        queue.extend(children.iter().flatten().copied());
                        None
                    }
                    TrieNode::Leaf { key, value } => Some((key.clone(), value.clone())),
                };
                if leaf_only && leaf.is_none() {
                    continue;
                }
                let item = IteratedNode {
                    raw_key: hash.as_bytes().to_vec(),
                    raw_value: bytes,
                    leaf,
                };
                if tx.send(Ok(item)).is_err() {
                    // Consumer went away; abandon the walk.
                    return;
                }
            }
        });
        Self { rx, timeout }
    }

    /// Next node, `Ok(None)` once the walk is exhausted.
    pub fn next(&mut self) -> Result<Option<IteratedNode>, TrieError> {
        match self.rx.recv_timeout(self.timeout) {
            Ok(Ok(item)) => Ok(Some(item)),
            Ok(Err(e)) => Err(e),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
            Err(RecvTimeoutError::Timeout) => Err(TrieError::Timeout),
        }
    }
}

/// Structural re-walk: every referenced child must exist and every
/// node's bytes must hash back to its storage key.
pub fn verify_trie(root: Hash, storage: &dyn Storage) -> Result<bool, TrieError> {
    if root.is_zero() {
        return Ok(true);
    }
    let mut stack = vec![root];
    while let Some(hash) = stack.pop() {
        let Some(bytes) = storage.get(hash.as_bytes()) else {
            return Ok(false);
        };
        if Hash::digest(&bytes) != hash {
            return Ok(false);
        }
        match TrieNode::decode(&bytes) {
            Ok(TrieNode::Internal { children }) => {
                stack.extend(children.iter().flatten().copied());
            }
            Ok(TrieNode::Leaf { .. }) => {}
            Err(_) => return Ok(false),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStorage;

    fn entries(count: u64) -> Vec<(Vec<u8>, Vec<u8>)> {
        (0..count)
            .map(|i| (format!("key-{i}").into_bytes(), format!("value-{i}").into_bytes()))
            .collect()
    }

    fn iter(root: Hash, storage: &MemoryStorage, leaf_only: bool) -> TrieIterator {
        TrieIterator::new(
            root,
            Arc::new(storage.clone()),
            16,
            Duration::from_secs(5),
            leaf_only,
        )
    }

    #[test]
    fn build_iterate_all_leaves() {
        let storage = MemoryStorage::new();
        let entries = entries(50);
        let root = TrieBuilder::new(&storage).build(&entries).unwrap();

        let mut it = iter(root, &storage, true);
        let mut seen = Vec::new();
        while let Some(node) = it.next().unwrap() {
            let (key, value) = node.leaf.expect("leaf-only iteration");
            seen.push((key, value));
        }
        assert_eq!(seen.len(), entries.len());
        let mut expected = entries.clone();
        expected.sort();
        seen.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn full_iteration_includes_internal_nodes() {
        let storage = MemoryStorage::new();
        let root = TrieBuilder::new(&storage).build(&entries(50)).unwrap();

        let mut it = iter(root, &storage, false);
        let mut nodes = 0;
        let mut leaves = 0;
        while let Some(node) = it.next().unwrap() {
            nodes += 1;
            if node.leaf.is_some() {
                leaves += 1;
            }
            assert_eq!(Hash::digest(&node.raw_value), Hash::from_slice(&node.raw_key));
        }
        assert_eq!(leaves, 50);
        assert!(nodes > leaves, "internal nodes must be visited too");
    }

    #[test]
    fn verify_accepts_intact_trie() {
        let storage = MemoryStorage::new();
        let root = TrieBuilder::new(&storage).build(&entries(30)).unwrap();
        assert!(verify_trie(root, &storage).unwrap());
    }

    #[test]
    fn verify_rejects_missing_node() {
        let storage = MemoryStorage::new();
        let root = TrieBuilder::new(&storage).build(&entries(30)).unwrap();

        // Drop one node.
        let victim = storage.keys().into_iter().nth(7).unwrap();
        storage.delete(&victim).unwrap();
        assert!(!verify_trie(root, &storage).unwrap());
    }

    #[test]
    fn verify_rejects_tampered_node() {
        let storage = MemoryStorage::new();
        let root = TrieBuilder::new(&storage).build(&entries(30)).unwrap();

        let victim = storage.keys().into_iter().nth(3).unwrap();
        storage.put(&victim, b"garbage").unwrap();
        assert!(!verify_trie(root, &storage).unwrap());
    }

    #[test]
    fn iterate_missing_node_is_an_error() {
        let storage = MemoryStorage::new();
        let root = TrieBuilder::new(&storage).build(&entries(30)).unwrap();
        let victim = storage.keys().into_iter().nth(5).unwrap();
        storage.delete(&victim).unwrap();

        let mut it = iter(root, &storage, false);
        let mut result = Ok(());
        loop {
            match it.next() {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        assert!(matches!(result, Err(TrieError::MissingNode(_))));
    }

    #[test]
    fn zero_root_iterates_nothing_and_verifies() {
        let storage = MemoryStorage::new();
        let mut it = iter(Hash::ZERO, &storage, false);
        assert!(it.next().unwrap().is_none());
        assert!(verify_trie(Hash::ZERO, &storage).unwrap());
    }
}
