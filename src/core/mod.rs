//! Consensus core
//!
//! The chain data model, the validation rules every node must agree on,
//! difficulty retargeting, the block ingestor that owns the chain tip and
//! the block forge that builds templates for miners.

pub mod block;
pub mod block_forge;
pub mod difficulty;
pub mod hash;
pub mod ingestor;
pub mod merkle;
pub mod monetary;
pub mod params;
pub mod proof_of_work;
pub mod transaction;
pub mod validation;

pub use block::{Block, BlockHeader, BlockSummary, SnowPowProof};
pub use block_forge::BlockForge;
pub use difficulty::DifficultyAdjustment;
pub use hash::{AddressSpecHash, ChainHash};
pub use ingestor::{BlockIngestor, ChainStateSource, IngestOutcome};
pub use monetary::{block_reward, FLAKES_PER_SNOW};
pub use params::NetworkParams;
pub use proof_of_work::SnowField;
pub use transaction::{
    AddressSpec, Transaction, TransactionInner, TransactionInput, TransactionOutput,
};
pub use validation::TxContext;
