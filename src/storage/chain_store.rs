use crate::core::block::{Block, BlockSummary};
use crate::core::hash::ChainHash;
use crate::core::Transaction;
use crate::error::{BlockchainError, Result};
use crate::utils::{deserialize, serialize};
use sled::{Db, Tree};

// Tree names inside the node database
const BLOCKS_TREE: &str = "blocks";
const SUMMARIES_TREE: &str = "summaries";
const HEIGHTS_TREE: &str = "heights";
const TRANSACTIONS_TREE: &str = "transactions";
const SPECIAL_TREE: &str = "special";
const UTXO_TRIE_TREE: &str = "utxo_trie";

/// Key of the canonical tip hash in the special tree
pub const HEAD_KEY: &str = "head";
/// Key of the persisted peer rumor list in the special tree
pub const PEERLIST_KEY: &str = "peerlist";

fn open_tree(db: &Db, name: &str) -> Result<Tree> {
    db.open_tree(name)
        .map_err(|e| BlockchainError::Database(format!("Failed to open {name} tree: {e}")))
}

/// Block, summary and index storage over one sled database
#[derive(Clone)]
pub struct ChainStore {
    db: Db,
    blocks: Tree,
    summaries: Tree,
    heights: Tree,
    transactions: Tree,
    special: Tree,
}

impl ChainStore {
    pub fn new(db: Db) -> Result<ChainStore> {
        Ok(ChainStore {
            blocks: open_tree(&db, BLOCKS_TREE)?,
            summaries: open_tree(&db, SUMMARIES_TREE)?,
            heights: open_tree(&db, HEIGHTS_TREE)?,
            transactions: open_tree(&db, TRANSACTIONS_TREE)?,
            special: open_tree(&db, SPECIAL_TREE)?,
            db,
        })
    }

    /// Opens (or creates) the database at `path`
    pub fn open(path: &str) -> Result<ChainStore> {
        let db = sled::open(path)
            .map_err(|e| BlockchainError::Database(format!("Failed to open database: {e}")))?;
        Self::new(db)
    }

    /// The tree trie nodes are kept in
    pub fn utxo_trie_tree(&self) -> Result<Tree> {
        open_tree(&self.db, UTXO_TRIE_TREE)
    }

    pub fn put_block(&self, block: &Block) -> Result<()> {
        self.blocks
            .insert(block.get_hash().as_bytes(), block.serialize()?)
            .map_err(|e| BlockchainError::Database(format!("Failed to store block: {e}")))?;
        Ok(())
    }

    pub fn get_block(&self, hash: &ChainHash) -> Result<Option<Block>> {
        let data = self
            .blocks
            .get(hash.as_bytes())
            .map_err(|e| BlockchainError::Database(format!("Failed to get block: {e}")))?;
        data.map(|bytes| Block::deserialize(&bytes)).transpose()
    }

    pub fn put_summary(&self, summary: &BlockSummary) -> Result<()> {
        self.summaries
            .insert(summary.get_hash().as_bytes(), summary.serialize()?)
            .map_err(|e| BlockchainError::Database(format!("Failed to store summary: {e}")))?;
        Ok(())
    }

    pub fn get_summary(&self, hash: &ChainHash) -> Result<Option<BlockSummary>> {
        let data = self
            .summaries
            .get(hash.as_bytes())
            .map_err(|e| BlockchainError::Database(format!("Failed to get summary: {e}")))?;
        data.map(|bytes| BlockSummary::deserialize(&bytes)).transpose()
    }

    pub fn has_summary(&self, hash: &ChainHash) -> Result<bool> {
        self.summaries
            .contains_key(hash.as_bytes())
            .map_err(|e| BlockchainError::Database(format!("Failed to check summary: {e}")))
    }

    pub fn put_height(&self, height: u32, hash: &ChainHash) -> Result<()> {
        self.heights
            .insert(height.to_be_bytes(), hash.as_bytes())
            .map_err(|e| BlockchainError::Database(format!("Failed to store height: {e}")))?;
        Ok(())
    }

    pub fn remove_height(&self, height: u32) -> Result<()> {
        self.heights
            .remove(height.to_be_bytes())
            .map_err(|e| BlockchainError::Database(format!("Failed to remove height: {e}")))?;
        Ok(())
    }

    pub fn get_hash_at_height(&self, height: u32) -> Result<Option<ChainHash>> {
        let data = self
            .heights
            .get(height.to_be_bytes())
            .map_err(|e| BlockchainError::Database(format!("Failed to get height: {e}")))?;
        data.map(|bytes| ChainHash::from_slice(&bytes)).transpose()
    }

    pub fn put_transaction(&self, tx: &Transaction) -> Result<()> {
        self.transactions
            .insert(tx.get_tx_hash().as_bytes(), serialize(tx)?)
            .map_err(|e| BlockchainError::Database(format!("Failed to store transaction: {e}")))?;
        Ok(())
    }

    pub fn get_transaction(&self, hash: &ChainHash) -> Result<Option<Transaction>> {
        let data = self
            .transactions
            .get(hash.as_bytes())
            .map_err(|e| BlockchainError::Database(format!("Failed to get transaction: {e}")))?;
        data.map(|bytes| deserialize::<Transaction>(&bytes))
            .transpose()
    }

    pub fn put_special(&self, key: &str, value: &[u8]) -> Result<()> {
        self.special
            .insert(key, value)
            .map_err(|e| BlockchainError::Database(format!("Failed to store {key}: {e}")))?;
        Ok(())
    }

    pub fn get_special(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let data = self
            .special
            .get(key)
            .map_err(|e| BlockchainError::Database(format!("Failed to get {key}: {e}")))?;
        Ok(data.map(|v| v.to_vec()))
    }

    pub fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| BlockchainError::Database(format!("Failed to flush database: {e}")))?;
        Ok(())
    }
}
