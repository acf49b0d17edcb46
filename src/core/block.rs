use crate::core::hash::ChainHash;
use crate::core::Transaction;
use crate::error::Result;
use crate::utils::{deserialize, serialize};
use num_bigint::{BigInt, Sign};
use serde::{Deserialize, Serialize};

pub const BLOCK_VERSION: u32 = 1;
pub const NONCE_LENGTH: usize = 12;
pub const TARGET_LENGTH: usize = 32;

/// One step of the snow-field walk: the word at `word_idx` and the merkle
/// path from that word up to the field root. The first component is the word.
#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct SnowPowProof {
    pub word_idx: u64,
    pub merkle_components: Vec<Vec<u8>>,
}

#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct BlockHeader {
    pub version: u32,
    pub block_height: u32,
    pub prev_block_hash: ChainHash,
    pub merkle_root_hash: ChainHash,
    pub utxo_root_hash: ChainHash,
    pub timestamp: i64,
    /// Big-endian, exactly `TARGET_LENGTH` bytes
    pub target: Vec<u8>,
    pub snow_field: u32,
    /// Exactly `NONCE_LENGTH` bytes
    pub nonce: Vec<u8>,
    /// Result of the proof-of-work walk; this is the block's identity
    pub snow_hash: ChainHash,
    pub pow_proofs: Vec<SnowPowProof>,
}

impl BlockHeader {
    pub fn get_hash(&self) -> ChainHash {
        self.snow_hash
    }

    pub fn target_int(&self) -> BigInt {
        target_bytes_to_int(&self.target)
    }
}

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct Block {
    header: BlockHeader,
    transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Block {
        Block {
            header,
            transactions,
        }
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Block> {
        deserialize::<Block>(bytes)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn get_header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut BlockHeader {
        &mut self.header
    }

    pub fn get_transactions(&self) -> &[Transaction] {
        self.transactions.as_slice()
    }

    pub fn get_hash(&self) -> ChainHash {
        self.header.snow_hash
    }

    pub fn get_height(&self) -> u32 {
        self.header.block_height
    }
}

/// A header plus the chain metadata derived while ingesting it. Written once
/// when the block validates and never changed afterwards.
#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct BlockSummary {
    pub header: BlockHeader,
    work_sum: Vec<u8>,
    pub blocktime_average_ms: i64,
    target_average: Vec<u8>,
    pub activated_field: u32,
}

impl BlockSummary {
    pub fn new(
        header: BlockHeader,
        work_sum: &BigInt,
        blocktime_average_ms: i64,
        target_average: &BigInt,
        activated_field: u32,
    ) -> BlockSummary {
        BlockSummary {
            header,
            work_sum: work_sum.to_bytes_be().1,
            blocktime_average_ms,
            target_average: target_average.to_bytes_be().1,
            activated_field,
        }
    }

    /// Cumulative work from genesis through this block
    pub fn work_sum(&self) -> BigInt {
        BigInt::from_bytes_be(Sign::Plus, &self.work_sum)
    }

    pub fn target_average(&self) -> BigInt {
        BigInt::from_bytes_be(Sign::Plus, &self.target_average)
    }

    pub fn get_hash(&self) -> ChainHash {
        self.header.snow_hash
    }

    pub fn get_height(&self) -> u32 {
        self.header.block_height
    }

    pub fn deserialize(bytes: &[u8]) -> Result<BlockSummary> {
        deserialize::<BlockSummary>(bytes)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }
}

pub fn target_bytes_to_int(bytes: &[u8]) -> BigInt {
    BigInt::from_bytes_be(Sign::Plus, bytes)
}

/// Left-pads the target to `TARGET_LENGTH` bytes. Targets never exceed
/// 2^256 - 1, which the network maximum guarantees.
pub fn target_int_to_bytes(target: &BigInt) -> Vec<u8> {
    let (_, data) = target.to_bytes_be();
    let mut out = vec![0u8; TARGET_LENGTH.saturating_sub(data.len())];
    out.extend(data);
    out
}
