//! # Frostline - a proof-of-work node
//!
//! This is the consensus and propagation engine of the frostline network.
//! When I come back to this code, here's what I need to remember:
//!
//! ## What It Does
//! - **Validation**: structural checks that need no state, then deep checks
//!   against a UTXO view. Every node has to reach the same answer.
//! - **UTXO Trie**: unspent outputs live in a hashed trie whose root goes into
//!   every block header. Changes are staged in an update buffer and only
//!   written when the resulting root matches.
//! - **Chain Selection**: the block ingestor keeps the tip with the most
//!   cumulative work and retargets difficulty from rolling averages.
//! - **Mempool**: dependent transactions are grouped into clusters and ranked
//!   by fee density for block templates.
//! - **Gossip**: peers swap tips and fetch missing blocks by walking
//!   backward from headers they haven't seen.
//!
//! ## How The Code Is Organized
//! - `core/`: data model, validation, difficulty, ingestor and block forge
//! - `storage/`: sled chain store, UTXO trie and buffer, mempool
//! - `network/`: wire messages, peer links, the peerage and the TCP server
//! - `node/`: wires everything together and takes submissions
//! - `config/`: node settings from TOML and the environment
//! - `utils/`: hashing, signatures, time and bincode helpers
//! - `cli/`: command-line parsing for the binary
//!
//! ## Where To Start Reading
//! 1. `core/validation.rs` for the consensus rules
//! 2. `core/ingestor.rs` for how blocks become the tip
//! 3. `storage/memory_pool.rs` for how templates get their transactions
//! 4. `network/peer_link.rs` for the sync protocol

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod node;
pub mod storage;
pub mod utils;

#[cfg(test)]
pub mod testnet;

pub use config::NodeConfig;
pub use core::{
    Block, BlockHeader, BlockIngestor, BlockSummary, ChainHash, IngestOutcome, NetworkParams,
    Transaction,
};
pub use error::{BlockchainError, Result};
pub use network::{Peerage, PeerMessage};
pub use node::{Node, SubmitReply};
pub use storage::{ChainStore, HashedTrie, MemPool, UtxoUpdateBuffer};
