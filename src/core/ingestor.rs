// The block ingestor owns the canonical chain tip. Every block, whether mined
// locally or received from a peer, comes through ingest_block. Validation runs
// without holding any lock; only the persist and tip-switch steps are
// serialized so the tip and the height index always move together.

use crate::core::block::{Block, BlockHeader, BlockSummary};
use crate::core::difficulty::DifficultyAdjustment;
use crate::core::hash::ChainHash;
use crate::core::params::NetworkParams;
use crate::core::validation::{check_block_basics, deep_block_validation};
use crate::core::Transaction;
use crate::error::{BlockchainError, Result};
use crate::storage::chain_store::{ChainStore, HEAD_KEY};
use crate::storage::trie::HashedTrie;
use crate::utils::current_timestamp;
use log::{debug, error, info};
use num_bigint::BigInt;
use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Mutex, RwLock};

// Limits for the recently-requested block map
const RESERVE_MAX_ENTRIES: usize = 2000;
const RESERVE_WINDOW_MS: i64 = 15_000;

/// What happened to a block handed to [`BlockIngestor::ingest_block`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Already stored; nothing was done
    Duplicate,
    /// Validated and stored
    Accepted { tip_advanced: bool },
}

/// Read access to the chain state the mempool needs to build spend contexts
pub trait ChainStateSource: Send + Sync {
    /// Height of the current tip, if there is one
    fn height(&self) -> Option<u32>;

    fn params(&self) -> &NetworkParams;
}

pub struct BlockIngestor {
    params: NetworkParams,
    store: ChainStore,
    trie: HashedTrie,
    tx_index: bool,
    start_summary: BlockSummary,
    head: RwLock<Option<BlockSummary>>,
    ingest_lock: Mutex<()>,
    reserved: Mutex<HashMap<ChainHash, i64>>,
    subscribers: Mutex<Vec<Sender<BlockSummary>>>,
}

impl BlockIngestor {
    /// Loads the tip from the `head` key if the database has one
    pub fn new(
        params: NetworkParams,
        store: ChainStore,
        trie: HashedTrie,
        tx_index: bool,
    ) -> Result<BlockIngestor> {
        let start_header = BlockHeader {
            utxo_root_hash: trie.empty_root(),
            ..Default::default()
        };
        let start_summary = BlockSummary::new(
            start_header,
            &BigInt::from(0),
            params.block_time_target,
            &params.max_target,
            0,
        );

        let head = match store.get_special(HEAD_KEY)? {
            Some(bytes) => {
                let hash = ChainHash::from_slice(&bytes)?;
                let summary = store.get_summary(&hash)?.ok_or_else(|| {
                    BlockchainError::Database(format!("Head {hash} has no stored summary"))
                })?;
                info!(
                    "Loaded chain tip {} at height {}",
                    hash,
                    summary.get_height()
                );
                Some(summary)
            }
            None => {
                info!("No chain tip stored yet");
                None
            }
        };

        Ok(BlockIngestor {
            params,
            store,
            trie,
            tx_index,
            start_summary,
            head: RwLock::new(head),
            ingest_lock: Mutex::new(()),
            reserved: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Validates and stores `block`, switching the tip if it carries more
    /// work. An unknown parent is reported as [`BlockchainError::Orphan`].
    pub fn ingest_block(&self, block: &Block) -> Result<IngestOutcome> {
        check_block_basics(&self.params, block)?;

        let hash = block.get_hash();
        if self.store.has_summary(&hash)? {
            return Ok(IngestOutcome::Duplicate);
        }

        let header = block.get_header();
        let prev = self.resolve_parent(header)?;

        // Commits the UTXO nodes on success. Nodes are content addressed so a
        // concurrent ingest of the same block writes identical data.
        deep_block_validation(&self.params, &self.trie, block, &prev)?;
        let summary = DifficultyAdjustment::new_summary(header, &prev, &self.params);

        let _guard = self.ingest_lock.lock()?;
        if self.store.has_summary(&hash)? {
            return Ok(IngestOutcome::Duplicate);
        }

        if self.tx_index {
            for tx in block.get_transactions() {
                self.store.put_transaction(tx)?;
            }
        }
        self.store.put_block(block)?;
        self.store.put_summary(&summary)?;

        let old_tip = {
            let mut head = self.head.write()?;
            let advances = match head.as_ref() {
                Some(tip) => summary.work_sum() > tip.work_sum(),
                None => true,
            };
            if !advances {
                debug!(
                    "Stored block {hash} at height {} without moving the tip",
                    summary.get_height()
                );
                return Ok(IngestOutcome::Accepted {
                    tip_advanced: false,
                });
            }
            head.replace(summary.clone())
        };

        self.store.put_special(HEAD_KEY, hash.as_bytes())?;
        self.update_heights(&summary, old_tip.as_ref())?;

        info!(
            "New tip {} at height {} ({} transactions, work {})",
            hash,
            summary.get_height(),
            block.get_transactions().len(),
            summary.work_sum()
        );
        self.notify_subscribers(&summary)?;

        Ok(IngestOutcome::Accepted { tip_advanced: true })
    }

    fn resolve_parent(&self, header: &BlockHeader) -> Result<BlockSummary> {
        if header.prev_block_hash.is_zero() {
            return Ok(self.start_summary.clone());
        }
        self.store
            .get_summary(&header.prev_block_hash)?
            .ok_or_else(|| {
                BlockchainError::Orphan(format!(
                    "Parent {} of block at height {} is unknown",
                    header.prev_block_hash, header.block_height
                ))
            })
    }

    // Rewrites the height index from the new tip back to the fork point
    fn update_heights(&self, tip: &BlockSummary, old_tip: Option<&BlockSummary>) -> Result<()> {
        if let Some(old) = old_tip {
            for height in (tip.get_height() + 1)..=old.get_height() {
                self.store.remove_height(height)?;
            }
        }

        let mut current = tip.clone();
        loop {
            let height = current.get_height();
            if self.store.get_hash_at_height(height)? == Some(current.get_hash()) {
                break;
            }
            self.store.put_height(height, &current.get_hash())?;
            if height == 0 {
                break;
            }
            let prev_hash = current.header.prev_block_hash;
            current = self.store.get_summary(&prev_hash)?.ok_or_else(|| {
                BlockchainError::Database(format!("Missing summary for ancestor {prev_hash}"))
            })?;
        }
        Ok(())
    }

    fn notify_subscribers(&self, summary: &BlockSummary) -> Result<()> {
        let mut subscribers = self.subscribers.lock()?;
        subscribers.retain(|s| s.send(summary.clone()).is_ok());
        Ok(())
    }

    /// Channel that receives every new tip summary
    pub fn subscribe(&self) -> Result<Receiver<BlockSummary>> {
        let (tx, rx) = channel();
        self.subscribers.lock()?.push(tx);
        Ok(rx)
    }

    /// Marks `hash` as requested. Returns false when it was already
    /// requested within the last fifteen seconds.
    pub fn reserve_block(&self, hash: &ChainHash) -> Result<bool> {
        let now = current_timestamp()?;
        let mut reserved = self.reserved.lock()?;
        if let Some(at) = reserved.get(hash) {
            if now - at < RESERVE_WINDOW_MS {
                return Ok(false);
            }
        }
        reserved.insert(*hash, now);

        if reserved.len() > RESERVE_MAX_ENTRIES {
            reserved.retain(|_, at| now - *at < RESERVE_WINDOW_MS);
            while reserved.len() > RESERVE_MAX_ENTRIES {
                let oldest = reserved.iter().min_by_key(|(_, at)| **at).map(|(h, _)| *h);
                match oldest {
                    Some(h) => {
                        reserved.remove(&h);
                    }
                    None => break,
                }
            }
        }
        Ok(true)
    }

    pub fn head(&self) -> Option<BlockSummary> {
        match self.head.read() {
            Ok(head) => head.clone(),
            Err(_) => {
                error!("Failed to acquire read lock on chain tip");
                None
            }
        }
    }

    /// Parent for the next block: the tip, or the start summary on an empty chain
    pub fn head_or_start(&self) -> BlockSummary {
        self.head().unwrap_or_else(|| self.start_summary.clone())
    }

    pub fn start_summary(&self) -> &BlockSummary {
        &self.start_summary
    }

    pub fn get_summary(&self, hash: &ChainHash) -> Result<Option<BlockSummary>> {
        self.store.get_summary(hash)
    }

    pub fn has_block(&self, hash: &ChainHash) -> Result<bool> {
        self.store.has_summary(hash)
    }

    pub fn get_block(&self, hash: &ChainHash) -> Result<Option<Block>> {
        self.store.get_block(hash)
    }

    /// Canonical block hash at `height`
    pub fn get_hash_at_height(&self, height: u32) -> Result<Option<ChainHash>> {
        self.store.get_hash_at_height(height)
    }

    pub fn get_header_at_height(&self, height: u32) -> Result<Option<BlockHeader>> {
        match self.get_hash_at_height(height)? {
            Some(hash) => Ok(self.get_summary(&hash)?.map(|s| s.header)),
            None => Ok(None),
        }
    }

    /// Only finds anything when the transaction index is enabled
    pub fn get_transaction(&self, hash: &ChainHash) -> Result<Option<Transaction>> {
        self.store.get_transaction(hash)
    }

    pub fn trie(&self) -> &HashedTrie {
        &self.trie
    }

    pub fn store(&self) -> &ChainStore {
        &self.store
    }
}

impl ChainStateSource for BlockIngestor {
    fn height(&self) -> Option<u32> {
        self.head().map(|h| h.get_height())
    }

    fn params(&self) -> &NetworkParams {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::AddressSpec;
    use crate::testnet::{build_block, open_test_ingestor, reward_key};

    #[test]
    fn test_first_block_becomes_tip() {
        let (ingestor, _dir) = open_test_ingestor().unwrap();
        assert!(ingestor.head().is_none());
        assert_eq!(ingestor.height(), None);

        let block = build_block(&ingestor, &ingestor.head_or_start(), 1_000_000, vec![]).unwrap();
        let outcome = ingestor.ingest_block(&block).unwrap();
        assert_eq!(outcome, IngestOutcome::Accepted { tip_advanced: true });
        assert_eq!(ingestor.height(), Some(0));
        assert_eq!(
            ingestor.get_hash_at_height(0).unwrap(),
            Some(block.get_hash())
        );
    }

    #[test]
    fn test_ingest_is_idempotent() {
        let (ingestor, _dir) = open_test_ingestor().unwrap();
        let block = build_block(&ingestor, &ingestor.head_or_start(), 1_000_000, vec![]).unwrap();
        ingestor.ingest_block(&block).unwrap();
        let head = ingestor.head();
        assert_eq!(
            ingestor.ingest_block(&block).unwrap(),
            IngestOutcome::Duplicate
        );
        assert_eq!(ingestor.head(), head);
    }

    #[test]
    fn test_orphan_is_reported() {
        let (source, _source_dir) = open_test_ingestor().unwrap();
        let b0 = build_block(&source, &source.head_or_start(), 1_000_000, vec![]).unwrap();
        source.ingest_block(&b0).unwrap();
        let b1 = build_block(&source, &source.head_or_start(), 1_001_000, vec![]).unwrap();

        let (ingestor, _dir) = open_test_ingestor().unwrap();
        let err = ingestor.ingest_block(&b1).unwrap_err();
        assert!(matches!(err, BlockchainError::Orphan(_)));
        assert!(ingestor.head().is_none());

        ingestor.ingest_block(&b0).unwrap();
        ingestor.ingest_block(&b1).unwrap();
        assert_eq!(ingestor.height(), Some(1));
        assert_eq!(
            ingestor.get_header_at_height(1).unwrap().map(|h| h.snow_hash),
            Some(b1.get_hash())
        );
    }

    #[test]
    fn test_ancient_timestamp_is_rejected() {
        let (ingestor, _dir) = open_test_ingestor().unwrap();
        let b0 = build_block(&ingestor, &ingestor.head_or_start(), 1_000_000, vec![]).unwrap();
        ingestor.ingest_block(&b0).unwrap();
        let head = ingestor.head();

        let b1 = build_block(&ingestor, &ingestor.head_or_start(), i64::MIN + 5, vec![]).unwrap();
        let err = ingestor.ingest_block(&b1).unwrap_err();
        assert_eq!(
            err,
            BlockchainError::validation("Block timestamp is not after its parent")
        );
        assert_eq!(ingestor.head(), head);
        assert!(!ingestor.has_block(&b1.get_hash()).unwrap());
    }

    #[test]
    fn test_child_of_ancient_block_zero() {
        let (ingestor, _dir) = open_test_ingestor().unwrap();
        let b0 = build_block(&ingestor, &ingestor.head_or_start(), i64::MIN + 5, vec![]).unwrap();
        ingestor.ingest_block(&b0).unwrap();

        let b1 = build_block(&ingestor, &ingestor.head_or_start(), 1_000_000, vec![]).unwrap();
        ingestor.ingest_block(&b1).unwrap();
        let tip = ingestor.head().unwrap();
        assert_eq!(tip.get_hash(), b1.get_hash());
        assert!(tip.blocktime_average_ms > 0);
    }

    #[test]
    fn test_subscribers_hear_new_tips() {
        let (ingestor, _dir) = open_test_ingestor().unwrap();
        let rx = ingestor.subscribe().unwrap();
        let block = build_block(&ingestor, &ingestor.head_or_start(), 1_000_000, vec![]).unwrap();
        ingestor.ingest_block(&block).unwrap();
        assert_eq!(rx.recv().unwrap().get_hash(), block.get_hash());
    }

    #[test]
    fn test_reserve_block_window() {
        let (ingestor, _dir) = open_test_ingestor().unwrap();
        let hash = ChainHash::digest(b"wanted");
        assert!(ingestor.reserve_block(&hash).unwrap());
        assert!(!ingestor.reserve_block(&hash).unwrap());
        assert!(ingestor
            .reserve_block(&ChainHash::digest(b"other"))
            .unwrap());
    }

    #[test]
    fn test_tip_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain");
        let hash = {
            let store = ChainStore::open(path.to_str().unwrap()).unwrap();
            let trie = HashedTrie::sled(store.utxo_trie_tree().unwrap()).unwrap();
            let ingestor = BlockIngestor::new(NetworkParams::regtest(), store, trie, false).unwrap();
            let block =
                build_block(&ingestor, &ingestor.head_or_start(), 1_000_000, vec![]).unwrap();
            ingestor.ingest_block(&block).unwrap();
            ingestor.store().flush().unwrap();
            block.get_hash()
        };

        let store = ChainStore::open(path.to_str().unwrap()).unwrap();
        let trie = HashedTrie::sled(store.utxo_trie_tree().unwrap()).unwrap();
        let ingestor = BlockIngestor::new(NetworkParams::regtest(), store, trie, false).unwrap();
        assert_eq!(ingestor.head().map(|h| h.get_hash()), Some(hash));
        // the reward output is readable from the stored root
        let spec = AddressSpec::single(reward_key()).spec_hash();
        let root = ingestor.head().unwrap().header.utxo_root_hash;
        let found = ingestor
            .trie()
            .get_data_map(&root, spec.as_bytes(), 10)
            .unwrap();
        assert_eq!(found.len(), 1);
    }
}
