//! Persistence
//!
//! The sled-backed chain store, the hashed UTXO trie with its update
//! buffer, and the in-memory pool of unconfirmed transactions.

pub mod chain_store;
pub mod memory_pool;
pub mod trie;
pub mod utxo_buffer;

pub use chain_store::ChainStore;
pub use memory_pool::{MemPool, TXCluster};
pub use trie::HashedTrie;
pub use utxo_buffer::UtxoUpdateBuffer;
