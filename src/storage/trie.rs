//! Persisted hashed trie
//!
//! A 256-way trie keyed by bytes. Every node is stored under the SHA-256 of
//! its encoding, so a root hash pins down the whole key/value set and old
//! roots stay readable after later merges. Empty subtrees are pruned, which
//! makes the root a pure function of the contents.

use crate::core::hash::ChainHash;
use crate::error::{BlockchainError, Result};
use crate::utils::{deserialize, serialize};
use serde::{Deserialize, Serialize};
use sled::Tree;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

/// Pending writes: `None` deletes the key
pub type TrieUpdates = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

/// Where trie nodes live
pub trait NodeStore: Send + Sync {
    fn get_node(&self, hash: &ChainHash) -> Result<Option<Vec<u8>>>;

    /// Writes all nodes atomically
    fn put_nodes(&self, nodes: HashMap<ChainHash, Vec<u8>>) -> Result<()>;
}

pub struct SledNodeStore {
    tree: Tree,
}

impl SledNodeStore {
    pub fn new(tree: Tree) -> Self {
        SledNodeStore { tree }
    }
}

impl NodeStore for SledNodeStore {
    fn get_node(&self, hash: &ChainHash) -> Result<Option<Vec<u8>>> {
        let data = self
            .tree
            .get(hash.as_bytes())
            .map_err(|e| BlockchainError::Database(format!("Failed to read trie node: {e}")))?;
        Ok(data.map(|v| v.to_vec()))
    }

    fn put_nodes(&self, nodes: HashMap<ChainHash, Vec<u8>>) -> Result<()> {
        let mut batch = sled::Batch::default();
        for (hash, data) in nodes {
            batch.insert(hash.as_bytes(), data);
        }
        self.tree
            .apply_batch(batch)
            .map_err(|e| BlockchainError::Database(format!("Failed to write trie nodes: {e}")))
    }
}

#[derive(Default)]
pub struct MemNodeStore {
    nodes: RwLock<HashMap<ChainHash, Vec<u8>>>,
}

impl MemNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().map(|n| n.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NodeStore for MemNodeStore {
    fn get_node(&self, hash: &ChainHash) -> Result<Option<Vec<u8>>> {
        Ok(self.nodes.read()?.get(hash).cloned())
    }

    fn put_nodes(&self, nodes: HashMap<ChainHash, Vec<u8>>) -> Result<()> {
        self.nodes.write()?.extend(nodes);
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
struct TrieNode {
    prefix: Vec<u8>,
    data: Option<Vec<u8>>,
    /// Sorted by the branch byte
    children: Vec<(u8, ChainHash)>,
}

impl TrieNode {
    fn child(&self, b: u8) -> Option<ChainHash> {
        self.children
            .binary_search_by_key(&b, |(k, _)| *k)
            .ok()
            .map(|i| self.children[i].1)
    }

    fn set_child(&mut self, b: u8, hash: Option<ChainHash>) {
        match (self.children.binary_search_by_key(&b, |(k, _)| *k), hash) {
            (Ok(i), Some(h)) => self.children[i].1 = h,
            (Ok(i), None) => {
                self.children.remove(i);
            }
            (Err(i), Some(h)) => self.children.insert(i, (b, h)),
            (Err(_), None) => {}
        }
    }
}

#[derive(Clone)]
pub struct HashedTrie {
    store: Arc<dyn NodeStore>,
    empty_root: ChainHash,
}

impl HashedTrie {
    pub fn new(store: Arc<dyn NodeStore>) -> Result<HashedTrie> {
        let empty_root = ChainHash::digest(&serialize(&TrieNode::default())?);
        Ok(HashedTrie { store, empty_root })
    }

    /// Trie whose nodes live in a sled tree
    pub fn sled(tree: Tree) -> Result<HashedTrie> {
        Self::new(Arc::new(SledNodeStore::new(tree)))
    }

    /// In-memory trie, handy for tests and throwaway simulations
    pub fn in_memory() -> Result<HashedTrie> {
        Self::new(Arc::new(MemNodeStore::new()))
    }

    /// Root hash of the trie with no keys
    pub fn empty_root(&self) -> ChainHash {
        self.empty_root
    }

    fn load(&self, hash: &ChainHash) -> Result<TrieNode> {
        if *hash == self.empty_root {
            return Ok(TrieNode::default());
        }
        let data = self.store.get_node(hash)?.ok_or_else(|| {
            BlockchainError::Database(format!("Missing trie node {hash}"))
        })?;
        deserialize(&data)
    }

    pub fn get(&self, root: &ChainHash, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut hash = *root;
        loop {
            let node = self.load(&hash)?;
            let depth = node.prefix.len();
            if depth == key.len() {
                return Ok(node.data);
            }
            match node.child(key[depth]) {
                Some(child) => hash = child,
                None => return Ok(None),
            }
        }
    }

    /// Up to `max` entries whose key starts with `prefix`, in key order
    pub fn get_data_map(
        &self,
        root: &ChainHash,
        prefix: &[u8],
        max: usize,
    ) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        let mut result = BTreeMap::new();
        let mut hash = *root;
        let node = loop {
            let node = self.load(&hash)?;
            let depth = node.prefix.len();
            if depth == prefix.len() {
                break node;
            }
            match node.child(prefix[depth]) {
                Some(child) => hash = child,
                None => return Ok(result),
            }
        };

        let mut pending = vec![node];
        while let Some(node) = pending.pop() {
            if result.len() >= max {
                break;
            }
            // Children are pushed in reverse so they pop in key order
            for (_, child) in node.children.iter().rev() {
                pending.push(self.load(child)?);
            }
            if let Some(data) = node.data {
                result.insert(node.prefix, data);
            }
        }
        Ok(result)
    }

    fn merge_node(
        &self,
        node_hash: Option<ChainHash>,
        prefix: &[u8],
        updates: &[(&Vec<u8>, &Option<Vec<u8>>)],
        new_nodes: &mut HashMap<ChainHash, Vec<u8>>,
    ) -> Result<Option<ChainHash>> {
        if updates.is_empty() {
            return Ok(node_hash);
        }
        let mut node = match node_hash {
            Some(hash) => self.load(&hash)?,
            None => TrieNode {
                prefix: prefix.to_vec(),
                ..Default::default()
            },
        };

        let depth = prefix.len();
        let mut idx = 0;
        // Sorted input puts the key equal to the prefix first
        while idx < updates.len() && updates[idx].0.len() == depth {
            node.data = updates[idx].1.clone();
            idx += 1;
        }
        while idx < updates.len() {
            let branch = updates[idx].0[depth];
            let mut end = idx;
            while end < updates.len() && updates[end].0[depth] == branch {
                end += 1;
            }
            let mut child_prefix = prefix.to_vec();
            child_prefix.push(branch);
            let child = self.merge_node(
                node.child(branch),
                &child_prefix,
                &updates[idx..end],
                new_nodes,
            )?;
            node.set_child(branch, child);
            idx = end;
        }

        if node.data.is_none() && node.children.is_empty() {
            return Ok(None);
        }
        let encoded = serialize(&node)?;
        let hash = ChainHash::digest(&encoded);
        new_nodes.insert(hash, encoded);
        Ok(Some(hash))
    }

    fn compute_merge(
        &self,
        root: &ChainHash,
        updates: &TrieUpdates,
    ) -> Result<(ChainHash, HashMap<ChainHash, Vec<u8>>)> {
        let mut new_nodes = HashMap::new();
        let list: Vec<(&Vec<u8>, &Option<Vec<u8>>)> = updates.iter().collect();
        let start = if *root == self.empty_root {
            None
        } else {
            Some(*root)
        };
        let new_root = self
            .merge_node(start, &[], &list, &mut new_nodes)?
            .unwrap_or(self.empty_root);
        Ok((new_root, new_nodes))
    }

    /// Root the trie would have after `updates`, without writing anything
    pub fn simulate_merge(&self, root: &ChainHash, updates: &TrieUpdates) -> Result<ChainHash> {
        Ok(self.compute_merge(root, updates)?.0)
    }

    /// Applies `updates` only if the resulting root equals `expected_root`.
    /// Nothing is written when it does not.
    pub fn merge_if_root_equals(
        &self,
        root: &ChainHash,
        updates: &TrieUpdates,
        expected_root: &ChainHash,
    ) -> Result<bool> {
        let (new_root, new_nodes) = self.compute_merge(root, updates)?;
        if new_root != *expected_root {
            return Ok(false);
        }
        self.store.put_nodes(new_nodes)?;
        Ok(true)
    }

    pub fn merge(&self, root: &ChainHash, updates: &TrieUpdates) -> Result<ChainHash> {
        let (new_root, new_nodes) = self.compute_merge(root, updates)?;
        self.store.put_nodes(new_nodes)?;
        Ok(new_root)
    }
}
