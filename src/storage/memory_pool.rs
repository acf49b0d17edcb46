//! Unconfirmed transaction pool
//!
//! Transactions that spend other unconfirmed transactions are grouped into
//! clusters: the transaction plus every ancestor still missing from the UTXO
//! set, ordered so they can go into a block as listed. Clusters are ranked by
//! combined fee over combined size, which lets a child pay for its parent.
//!
//! The first transaction seen spending an output owns it. Later transactions
//! claiming the same output are dropped as double spends.

use crate::core::hash::{AddressSpecHash, ChainHash};
use crate::core::ingestor::ChainStateSource;
use crate::core::transaction::{Transaction, TransactionInner};
use crate::core::validation::{check_transaction_basics, deep_transaction_check, TxContext};
use crate::error::{BlockchainError, Result};
use crate::storage::trie::HashedTrie;
use crate::storage::utxo_buffer::{utxo_key, UtxoUpdateBuffer};
use crate::utils::current_timestamp;
use log::{debug, error};
use rand::seq::IteratorRandom;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Most transactions the pool will hold
pub const MEM_POOL_MAX: usize = 20000;
pub const MAX_CLUSTER_SIZE: usize = 256;
pub const MAX_CLUSTER_DEPTH: i32 = 64;

/// Fee per byte, compared exactly by cross multiplication
#[derive(Debug, Clone, Copy)]
pub struct FeeDensity {
    fee: u64,
    size: u64,
}

impl FeeDensity {
    pub fn new(fee: u64, size: u64) -> Self {
        FeeDensity {
            fee,
            size: size.max(1),
        }
    }
}

impl Ord for FeeDensity {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = self.fee as u128 * other.size as u128;
        let rhs = other.fee as u128 * self.size as u128;
        lhs.cmp(&rhs)
    }
}

impl PartialOrd for FeeDensity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for FeeDensity {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FeeDensity {}

/// Dependent unconfirmed transactions in an order valid for a block. The
/// transaction the cluster was built for is last.
#[derive(Debug, Clone)]
pub struct TXCluster {
    tx_list: Vec<Transaction>,
    tx_set: HashSet<ChainHash>,
    total_size: usize,
    total_fee: u64,
}

impl TXCluster {
    fn new(entries: Vec<&MempoolEntry>) -> TXCluster {
        let mut total_size = 0usize;
        let mut total_fee = 0u64;
        let mut tx_set = HashSet::new();
        let mut tx_list = Vec::with_capacity(entries.len());
        for entry in entries {
            total_size += entry.size;
            total_fee = total_fee.saturating_add(entry.inner.fee);
            tx_set.insert(entry.tx.get_tx_hash());
            tx_list.push(entry.tx.clone());
        }
        TXCluster {
            tx_list,
            tx_set,
            total_size,
            total_fee,
        }
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.tx_list
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn total_fee(&self) -> u64 {
        self.total_fee
    }

    pub fn fee_density(&self) -> FeeDensity {
        FeeDensity::new(self.total_fee, self.total_size as u64)
    }
}

struct MempoolEntry {
    tx: Transaction,
    inner: TransactionInner,
    size: usize,
    seen_ms: i64,
    involved_addresses: HashSet<AddressSpecHash>,
}

impl MempoolEntry {
    fn new(tx: Transaction, inner: TransactionInner, seen_ms: i64) -> Result<MempoolEntry> {
        let size = tx.size()?;
        let involved_addresses = inner
            .inputs
            .iter()
            .map(|i| i.spec_hash)
            .chain(inner.outputs.iter().map(|o| o.recipient_spec_hash))
            .collect();
        Ok(MempoolEntry {
            tx,
            inner,
            size,
            seen_ms,
            involved_addresses,
        })
    }

    fn output_refs(&self) -> impl Iterator<Item = (ChainHash, u32)> + '_ {
        self.inner
            .inputs
            .iter()
            .map(|i| (i.src_tx_id, i.src_tx_out_idx))
    }
}

#[derive(Default)]
struct PoolState {
    known_transactions: HashMap<ChainHash, MempoolEntry>,
    claimed_outputs: HashMap<(ChainHash, u32), ChainHash>,
    address_tx_map: HashMap<AddressSpecHash, HashSet<ChainHash>>,
    utxo_for_pri_map: Option<ChainHash>,
    priority_map: BTreeMap<FeeDensity, Vec<TXCluster>>,
}

impl PoolState {
    fn insert_cluster(&mut self, cluster: TXCluster) {
        self.priority_map
            .entry(cluster.fee_density())
            .or_default()
            .push(cluster);
    }

    fn forget(&mut self, tx_hash: &ChainHash) {
        if let Some(entry) = self.known_transactions.remove(tx_hash) {
            for out in entry.output_refs() {
                if self.claimed_outputs.get(&out) == Some(tx_hash) {
                    self.claimed_outputs.remove(&out);
                }
            }
            for spec_hash in &entry.involved_addresses {
                if let Some(set) = self.address_tx_map.get_mut(spec_hash) {
                    set.remove(tx_hash);
                    if set.is_empty() {
                        self.address_tx_map.remove(spec_hash);
                    }
                }
            }
        }
    }
}

pub struct MemPool {
    trie: HashedTrie,
    chain: Arc<dyn ChainStateSource>,
    eviction_grace_ms: i64,
    state: Mutex<PoolState>,
}

impl MemPool {
    /// `eviction_grace_ms` is how long a transaction that currently fits no
    /// cluster is kept before a rebuild drops it.
    pub fn new(
        trie: HashedTrie,
        chain: Arc<dyn ChainStateSource>,
        eviction_grace_ms: i64,
    ) -> MemPool {
        MemPool {
            trie,
            chain,
            eviction_grace_ms,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Returns true when `tx` is new and was accepted
    pub fn add_transaction(&self, tx: &Transaction) -> Result<bool> {
        let inner = check_transaction_basics(tx)?;
        if inner.is_coinbase {
            return Err(BlockchainError::validation(
                "Coinbase transactions only belong in blocks",
            ));
        }
        let tx_hash = tx.get_tx_hash();

        let mut state = self.state.lock()?;
        if state.known_transactions.contains_key(&tx_hash) {
            return Ok(false);
        }
        if state.known_transactions.len() >= MEM_POOL_MAX {
            return Err(BlockchainError::validation("Mempool is full"));
        }

        let entry = MempoolEntry::new(tx.clone(), inner, current_timestamp()?)?;
        for out in entry.output_refs() {
            if let Some(owner) = state.claimed_outputs.get(&out) {
                if *owner != tx_hash {
                    debug!("Rejecting {tx_hash}: output {}:{} already claimed by {owner}", out.0, out.1);
                    return Err(BlockchainError::validation("Discarding as double-spend"));
                }
            }
        }

        if let Some(root) = state.utxo_for_pri_map {
            let cluster = self
                .build_cluster(&state.known_transactions, &root, &entry)
                .map_err(|e| {
                    debug!("No cluster for {tx_hash}: {e}");
                    BlockchainError::validation(format!(
                        "Unable to find a tx cluster that makes this work: {e}"
                    ))
                })?;
            state.insert_cluster(cluster);
        }

        for out in entry.output_refs() {
            state.claimed_outputs.insert(out, tx_hash);
        }
        for spec_hash in &entry.involved_addresses {
            state
                .address_tx_map
                .entry(*spec_hash)
                .or_default()
                .insert(tx_hash);
        }
        state.known_transactions.insert(tx_hash, entry);
        Ok(true)
    }

    /// Highest fee-density clusters that fit in `max_size` bytes, in an
    /// order valid for a block built on `utxo_root`.
    pub fn get_transactions_for_block(
        &self,
        utxo_root: &ChainHash,
        max_size: usize,
    ) -> Result<Vec<Transaction>> {
        let mut state = self.state.lock()?;
        if state.utxo_for_pri_map != Some(*utxo_root) {
            self.rebuild_locked(&mut state, utxo_root)?;
        }

        let mut block_list = Vec::new();
        let mut included = HashSet::new();
        let mut size = 0usize;
        for clusters in state.priority_map.values().rev() {
            for cluster in clusters {
                if size + cluster.total_size > max_size {
                    continue;
                }
                for tx in &cluster.tx_list {
                    if included.insert(tx.get_tx_hash()) {
                        size += tx.size()?;
                        block_list.push(tx.clone());
                    }
                }
            }
        }
        Ok(block_list)
    }

    /// Throws away the priority map and clusters every known transaction
    /// again against `utxo_root`. Transactions that no longer fit are
    /// evicted once they are older than the grace period.
    pub fn rebuild_priority_map(&self, utxo_root: &ChainHash) -> Result<()> {
        let mut state = self.state.lock()?;
        self.rebuild_locked(&mut state, utxo_root)
    }

    fn rebuild_locked(&self, state: &mut PoolState, utxo_root: &ChainHash) -> Result<()> {
        debug!("Rebuilding mempool priority map for {utxo_root}");
        state.utxo_for_pri_map = Some(*utxo_root);
        state.priority_map.clear();

        let now = current_timestamp()?;
        let mut clusters = Vec::new();
        let mut remove_list = Vec::new();
        for (tx_hash, entry) in &state.known_transactions {
            match self.build_cluster(&state.known_transactions, utxo_root, entry) {
                Ok(cluster) => clusters.push(cluster),
                Err(e) => {
                    if now - entry.seen_ms >= self.eviction_grace_ms {
                        debug!("Evicting {tx_hash} from mempool: {e}");
                        remove_list.push(*tx_hash);
                    }
                }
            }
        }

        for cluster in clusters {
            state.insert_cluster(cluster);
        }
        for tx_hash in &remove_list {
            state.forget(tx_hash);
        }
        debug!(
            "Mempool rebuilt: {} removed, {} remaining",
            remove_list.len(),
            state.known_transactions.len()
        );
        Ok(())
    }

    fn build_cluster(
        &self,
        known: &HashMap<ChainHash, MempoolEntry>,
        utxo_root: &ChainHash,
        target: &MempoolEntry,
    ) -> Result<TXCluster> {
        let target_hash = target.tx.get_tx_hash();
        let mut working: HashMap<ChainHash, &MempoolEntry> = HashMap::new();
        let mut depends_on: HashMap<ChainHash, HashSet<ChainHash>> = HashMap::new();
        let mut needed = Vec::new();

        working.insert(target_hash, target);
        for input in &target.inner.inputs {
            depends_on.entry(target_hash).or_default().insert(input.src_tx_id);
            needed.push(input.clone());
        }

        while let Some(input) = needed.pop() {
            if working.contains_key(&input.src_tx_id) {
                continue;
            }
            let key = utxo_key(&input.spec_hash, &input.src_tx_id, input.src_tx_out_idx);
            if self.trie.get(utxo_root, &key)?.is_some() {
                continue;
            }
            let source = known.get(&input.src_tx_id).ok_or_else(|| {
                BlockchainError::validation(format!("Can't find source tx {}", input.src_tx_id))
            })?;
            if working.len() >= MAX_CLUSTER_SIZE {
                return Err(BlockchainError::validation(format!(
                    "Cluster would exceed {MAX_CLUSTER_SIZE} transactions"
                )));
            }
            working.insert(input.src_tx_id, source);
            for parent_input in &source.inner.inputs {
                depends_on
                    .entry(input.src_tx_id)
                    .or_default()
                    .insert(parent_input.src_tx_id);
                needed.push(parent_input.clone());
            }
        }

        let ordered = order_by_level(&working, &depends_on, target_hash)?;

        let ctx = TxContext {
            block_height: self.chain.height().map(|h| h + 1).unwrap_or(0),
            timestamp: current_timestamp()?,
        };
        let mut buffer = UtxoUpdateBuffer::new(self.trie.clone(), *utxo_root);
        for entry in &ordered {
            deep_transaction_check(&entry.tx, &mut buffer, ctx)?;
        }
        Ok(TXCluster::new(ordered))
    }

    pub fn get_transaction(&self, tx_hash: &ChainHash) -> Option<Transaction> {
        match self.state.lock() {
            Ok(state) => state.known_transactions.get(tx_hash).map(|e| e.tx.clone()),
            Err(_) => {
                error!("Failed to acquire lock on memory pool");
                None
            }
        }
    }

    /// The prioritized cluster containing `tx_hash`, if any
    pub fn get_tx_cluster_for_transaction(&self, tx_hash: &ChainHash) -> Option<Vec<Transaction>> {
        match self.state.lock() {
            Ok(state) => state
                .priority_map
                .values()
                .flatten()
                .find(|c| c.tx_set.contains(tx_hash))
                .map(|c| c.tx_list.clone()),
            Err(_) => {
                error!("Failed to acquire lock on memory pool");
                None
            }
        }
    }

    /// Hashes of pooled transactions paying or spending from `spec_hash`
    pub fn get_transactions_for_address(&self, spec_hash: &AddressSpecHash) -> Vec<ChainHash> {
        match self.state.lock() {
            Ok(state) => state
                .address_tx_map
                .get(spec_hash)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default(),
            Err(_) => {
                error!("Failed to acquire lock on memory pool");
                Vec::new()
            }
        }
    }

    /// Used for periodic rebroadcast
    pub fn get_random_transaction(&self) -> Option<Transaction> {
        match self.state.lock() {
            Ok(state) => state
                .known_transactions
                .values()
                .choose(&mut rand::thread_rng())
                .map(|e| e.tx.clone()),
            Err(_) => {
                error!("Failed to acquire lock on memory pool");
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        match self.state.lock() {
            Ok(state) => state.known_transactions.len(),
            Err(_) => {
                error!("Failed to acquire lock on memory pool");
                0
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Parents get lower levels than children; ties break on hash
fn order_by_level<'a>(
    working: &HashMap<ChainHash, &'a MempoolEntry>,
    depends_on: &HashMap<ChainHash, HashSet<ChainHash>>,
    target: ChainHash,
) -> Result<Vec<&'a MempoolEntry>> {
    let mut level_map: HashMap<ChainHash, i32> = HashMap::new();
    let mut stack = vec![(target, 0i32)];
    while let Some((tx_hash, level)) = stack.pop() {
        if !working.contains_key(&tx_hash) {
            continue;
        }
        if let Some(existing) = level_map.get(&tx_hash) {
            if *existing <= level {
                continue;
            }
        }
        if -level > MAX_CLUSTER_DEPTH {
            return Err(BlockchainError::validation(format!(
                "Cluster deeper than {MAX_CLUSTER_DEPTH} levels"
            )));
        }
        level_map.insert(tx_hash, level);
        if let Some(parents) = depends_on.get(&tx_hash) {
            for parent in parents {
                stack.push((*parent, level - 1));
            }
        }
    }

    let mut levels: Vec<(i32, ChainHash)> = level_map.into_iter().map(|(h, l)| (l, h)).collect();
    levels.sort();
    Ok(levels
        .into_iter()
        .filter_map(|(_, h)| working.get(&h).copied())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::Block;
    use crate::core::ingestor::BlockIngestor;
    use crate::core::transaction::AddressSpec;
    use crate::testnet::{build_block, open_test_ingestor, reward_key, spend_output};
    use tempfile::TempDir;

    fn funded_pool() -> (Arc<BlockIngestor>, MemPool, Block, TempDir) {
        let (ingestor, dir) = open_test_ingestor().unwrap();
        let block = build_block(&ingestor, &ingestor.head_or_start(), 1_000_000, vec![]).unwrap();
        ingestor.ingest_block(&block).unwrap();
        let ingestor = Arc::new(ingestor);
        let pool = MemPool::new(ingestor.trie().clone(), ingestor.clone(), 60_000);
        (ingestor, pool, block, dir)
    }

    fn tip_root(ingestor: &BlockIngestor) -> ChainHash {
        ingestor.head_or_start().header.utxo_root_hash
    }

    #[test]
    fn test_fee_density_orders_exactly() {
        assert!(FeeDensity::new(1, 3) < FeeDensity::new(1, 2));
        assert_eq!(FeeDensity::new(2, 4), FeeDensity::new(1, 2));
        assert!(FeeDensity::new(u64::MAX, 1) > FeeDensity::new(u64::MAX - 1, 1));
    }

    #[test]
    fn test_add_is_idempotent() {
        let (_ingestor, pool, block, _dir) = funded_pool();
        let spec = AddressSpec::single(reward_key()).spec_hash();
        let tx = spend_output(reward_key(), &block.get_transactions()[0], 0, 10, &spec).unwrap();
        assert!(pool.add_transaction(&tx).unwrap());
        assert!(!pool.add_transaction(&tx).unwrap());
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.get_transactions_for_address(&spec), vec![tx.get_tx_hash()]);
    }

    #[test]
    fn test_double_spend_rejected() {
        let (_ingestor, pool, block, _dir) = funded_pool();
        let spec = AddressSpec::single(reward_key()).spec_hash();
        let coinbase = &block.get_transactions()[0];
        let first = spend_output(reward_key(), coinbase, 0, 10, &spec).unwrap();
        let second = spend_output(reward_key(), coinbase, 0, 20, &spec).unwrap();
        pool.add_transaction(&first).unwrap();
        assert_eq!(
            pool.add_transaction(&second).unwrap_err(),
            BlockchainError::validation("Discarding as double-spend")
        );
    }

    #[test]
    fn test_parent_selected_with_child() {
        let (ingestor, pool, block, _dir) = funded_pool();
        let spec = AddressSpec::single(reward_key()).spec_hash();
        let parent = spend_output(reward_key(), &block.get_transactions()[0], 0, 0, &spec).unwrap();
        let child = spend_output(reward_key(), &parent, 0, 5000, &spec).unwrap();

        let root = tip_root(&ingestor);
        pool.rebuild_priority_map(&root).unwrap();
        pool.add_transaction(&parent).unwrap();
        pool.add_transaction(&child).unwrap();

        let cluster = pool.get_tx_cluster_for_transaction(&child.get_tx_hash()).unwrap();
        assert_eq!(cluster, vec![parent.clone(), child.clone()]);

        let selected = pool.get_transactions_for_block(&root, 1_000_000).unwrap();
        assert_eq!(selected, vec![parent, child]);
    }

    #[test]
    fn test_child_without_parent_rejected_once_prioritizing() {
        let (ingestor, pool, block, _dir) = funded_pool();
        let spec = AddressSpec::single(reward_key()).spec_hash();
        let parent = spend_output(reward_key(), &block.get_transactions()[0], 0, 0, &spec).unwrap();
        let child = spend_output(reward_key(), &parent, 0, 10, &spec).unwrap();

        pool.rebuild_priority_map(&tip_root(&ingestor)).unwrap();
        let err = pool.add_transaction(&child).unwrap_err();
        assert!(err
            .to_string()
            .contains("Unable to find a tx cluster that makes this work"));
        assert!(err.to_string().contains("Can't find source tx"));
    }

    #[test]
    fn test_budget_skips_clusters_that_do_not_fit() {
        let (ingestor, pool, block, _dir) = funded_pool();
        let spec = AddressSpec::single(reward_key()).spec_hash();
        let tx = spend_output(reward_key(), &block.get_transactions()[0], 0, 10, &spec).unwrap();
        pool.add_transaction(&tx).unwrap();

        let root = tip_root(&ingestor);
        assert!(pool.get_transactions_for_block(&root, 10).unwrap().is_empty());
        assert_eq!(pool.get_transactions_for_block(&root, 100_000).unwrap(), vec![tx]);
    }

    #[test]
    fn test_confirmed_transactions_evicted_after_grace() {
        let (ingestor, _pool, block, _dir) = funded_pool();
        let pool = MemPool::new(ingestor.trie().clone(), ingestor.clone(), 0);
        let spec = AddressSpec::single(reward_key()).spec_hash();
        let tx = spend_output(reward_key(), &block.get_transactions()[0], 0, 10, &spec).unwrap();
        pool.add_transaction(&tx).unwrap();

        let next = build_block(&ingestor, &ingestor.head_or_start(), 1_001_000, vec![tx]).unwrap();
        ingestor.ingest_block(&next).unwrap();

        pool.rebuild_priority_map(&tip_root(&ingestor)).unwrap();
        assert!(pool.is_empty());
    }
}
