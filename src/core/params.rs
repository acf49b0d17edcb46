//! Network parameters
//!
//! Everything consensus needs to know about a particular network: target
//! bounds, timing, snow fields and the peering defaults. The regtest network
//! is built in; other networks are described by a TOML file.

use crate::core::proof_of_work::{SnowField, SNOW_MERKLE_HASH_LEN};
use crate::error::{BlockchainError, Result};
use data_encoding::HEXLOWER;
use num_bigint::BigInt;
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const REGTEST_NAME: &str = "frostline-regtest";

/// `2^(256 - diff)`
pub fn target_for_diff(diff: u32) -> BigInt {
    BigInt::from(1) << (256 - diff.min(256)) as usize
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnowFieldInfo {
    pub name: String,
    /// Field size in bytes
    pub length: u64,
    pub merkle_root: Vec<u8>,
    /// Rolling target average below which this field becomes mandatory
    pub activation_target: BigInt,
}

impl SnowFieldInfo {
    pub fn new(name: &str, length: u64, merkle_root: Vec<u8>, activation_diff: u32) -> Self {
        SnowFieldInfo {
            name: name.to_string(),
            length,
            merkle_root,
            activation_target: target_for_diff(activation_diff),
        }
    }

    pub fn word_count(&self) -> u64 {
        self.length / SNOW_MERKLE_HASH_LEN as u64
    }
}

#[derive(Debug, Clone)]
pub struct NetworkParams {
    pub network_name: String,
    pub max_target: BigInt,
    /// Weight of the newest sample in the rolling averages, out of 1000
    pub avg_weight: i64,
    pub block_time_target: i64,
    pub max_clock_skew_ms: i64,
    pub default_port: u16,
    pub seed_nodes: Vec<String>,
    pub block_zero_remark: Vec<u8>,
    pub snow_fields: BTreeMap<u32, SnowFieldInfo>,
}

const REGTEST_FIELDS_SPEC: [(&str, u64, u32); 3] = [
    ("frost-0", 1024, 1),
    ("frost-1", 2048, 12),
    ("frost-2", 4096, 16),
];

/// In-memory fields so regtest nodes can mine without field files
static REGTEST_FIELDS: Lazy<Vec<SnowField>> = Lazy::new(|| {
    REGTEST_FIELDS_SPEC
        .iter()
        .map(|(name, words, _)| SnowField::synthetic(name.as_bytes(), *words as usize))
        .collect()
});

static REGTEST_PARAMS: Lazy<NetworkParams> = Lazy::new(|| {
    let mut snow_fields = BTreeMap::new();
    for (idx, ((name, words, activation_diff), field)) in REGTEST_FIELDS_SPEC
        .iter()
        .zip(REGTEST_FIELDS.iter())
        .enumerate()
    {
        snow_fields.insert(
            idx as u32,
            SnowFieldInfo::new(
                name,
                words * SNOW_MERKLE_HASH_LEN as u64,
                field.merkle_root().to_vec(),
                *activation_diff,
            ),
        );
    }
    NetworkParams {
        network_name: REGTEST_NAME.to_string(),
        max_target: target_for_diff(1),
        avg_weight: 10,
        block_time_target: 1000,
        max_clock_skew_ms: 45000,
        default_port: 2340,
        seed_nodes: vec![],
        block_zero_remark: b"it begins".to_vec(),
        snow_fields,
    }
});

#[derive(Debug, Deserialize)]
struct NetworkDefinition {
    network_name: String,
    max_target_diff: u32,
    #[serde(default = "default_avg_weight")]
    avg_weight: i64,
    block_time_target_ms: i64,
    #[serde(default = "default_clock_skew")]
    max_clock_skew_ms: i64,
    default_port: u16,
    #[serde(default)]
    seed_nodes: Vec<String>,
    block_zero_remark: String,
    fields: Vec<FieldDefinition>,
}

#[derive(Debug, Deserialize)]
struct FieldDefinition {
    id: u32,
    name: String,
    length: u64,
    merkle_root: String,
    activation_diff: u32,
}

fn default_avg_weight() -> i64 {
    10
}

fn default_clock_skew() -> i64 {
    45000
}

impl NetworkParams {
    pub fn regtest() -> NetworkParams {
        REGTEST_PARAMS.clone()
    }

    /// The in-memory field data behind a regtest field id
    pub fn regtest_field(field_id: u32) -> Option<&'static SnowField> {
        REGTEST_FIELDS.get(field_id as usize)
    }

    /// Resolves a configured network: `regtest` or a path to a definition file
    pub fn load(network: &str) -> Result<NetworkParams> {
        if network == "regtest" || network == REGTEST_NAME {
            return Ok(Self::regtest());
        }
        Self::from_file(network)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<NetworkParams> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            BlockchainError::Config(format!("Failed to read network file {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<NetworkParams> {
        let def: NetworkDefinition = toml::from_str(text)?;
        if def.avg_weight <= 0 || def.avg_weight >= 1000 {
            return Err(BlockchainError::Config(format!(
                "avg_weight must be within 1..999, got {}",
                def.avg_weight
            )));
        }
        if def.block_time_target_ms <= 0 {
            return Err(BlockchainError::Config(
                "block_time_target_ms must be positive".to_string(),
            ));
        }
        if def.max_target_diff == 0 {
            return Err(BlockchainError::Config(
                "max_target_diff must be at least 1".to_string(),
            ));
        }

        let mut snow_fields = BTreeMap::new();
        for field in def.fields {
            let root = HEXLOWER
                .decode(field.merkle_root.to_lowercase().as_bytes())
                .map_err(|e| {
                    BlockchainError::Config(format!("Bad merkle root for {}: {e}", field.name))
                })?;
            if root.len() != SNOW_MERKLE_HASH_LEN {
                return Err(BlockchainError::Config(format!(
                    "Merkle root for {} must be {SNOW_MERKLE_HASH_LEN} bytes",
                    field.name
                )));
            }
            snow_fields.insert(
                field.id,
                SnowFieldInfo::new(&field.name, field.length, root, field.activation_diff),
            );
        }
        if !snow_fields.contains_key(&0) {
            return Err(BlockchainError::Config(
                "Network must define snow field 0".to_string(),
            ));
        }

        Ok(NetworkParams {
            network_name: def.network_name,
            max_target: target_for_diff(def.max_target_diff),
            avg_weight: def.avg_weight,
            block_time_target: def.block_time_target_ms,
            max_clock_skew_ms: def.max_clock_skew_ms,
            default_port: def.default_port,
            seed_nodes: def.seed_nodes,
            block_zero_remark: def.block_zero_remark.into_bytes(),
            snow_fields,
        })
    }

    pub fn get_snow_field(&self, field_id: u32) -> Option<&SnowFieldInfo> {
        self.snow_fields.get(&field_id)
    }
}
