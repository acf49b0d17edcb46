use crate::error::{BlockchainError, Result};
use crate::utils::{ripemd160_digest, sha256_digest};
use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const BLOCKCHAIN_HASH_LEN: usize = 32;
pub const ADDRESS_SPEC_HASH_LEN: usize = 20;

/// Content hash of a block or transaction
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct ChainHash([u8; BLOCKCHAIN_HASH_LEN]);

impl ChainHash {
    /// Marker used as the previous hash of block zero
    pub const ZERO: ChainHash = ChainHash([0u8; BLOCKCHAIN_HASH_LEN]);

    pub fn new(bytes: [u8; BLOCKCHAIN_HASH_LEN]) -> Self {
        ChainHash(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; BLOCKCHAIN_HASH_LEN] = bytes.try_into().map_err(|_| {
            BlockchainError::validation(format!(
                "Expected {BLOCKCHAIN_HASH_LEN} byte hash, got {}",
                bytes.len()
            ))
        })?;
        Ok(ChainHash(arr))
    }

    /// SHA-256 of `data`
    pub fn digest(data: &[u8]) -> Self {
        let mut arr = [0u8; BLOCKCHAIN_HASH_LEN];
        arr.copy_from_slice(&sha256_digest(data));
        ChainHash(arr)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; BLOCKCHAIN_HASH_LEN]
    }
}

impl AsRef<[u8]> for ChainHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ChainHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.0))
    }
}

impl fmt::Debug for ChainHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChainHash({self})")
    }
}

impl FromStr for ChainHash {
    type Err = BlockchainError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = HEXLOWER
            .decode(s.to_lowercase().as_bytes())
            .map_err(|e| BlockchainError::validation(format!("Invalid hex hash {s}: {e}")))?;
        ChainHash::from_slice(&bytes)
    }
}

/// Hash of an address spec; identifies who may spend an output
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct AddressSpecHash([u8; ADDRESS_SPEC_HASH_LEN]);

impl AddressSpecHash {
    pub fn new(bytes: [u8; ADDRESS_SPEC_HASH_LEN]) -> Self {
        AddressSpecHash(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; ADDRESS_SPEC_HASH_LEN] = bytes.try_into().map_err(|_| {
            BlockchainError::validation(format!(
                "Expected {ADDRESS_SPEC_HASH_LEN} byte address, got {}",
                bytes.len()
            ))
        })?;
        Ok(AddressSpecHash(arr))
    }

    /// RIPEMD-160 over SHA-256, the same construction as a pubkey hash
    pub fn digest(data: &[u8]) -> Self {
        let mut arr = [0u8; ADDRESS_SPEC_HASH_LEN];
        arr.copy_from_slice(&ripemd160_digest(&sha256_digest(data)));
        AddressSpecHash(arr)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for AddressSpecHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.0))
    }
}

impl fmt::Debug for AddressSpecHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AddressSpecHash({self})")
    }
}

impl FromStr for AddressSpecHash {
    type Err = BlockchainError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = HEXLOWER
            .decode(s.to_lowercase().as_bytes())
            .map_err(|e| BlockchainError::validation(format!("Invalid hex address {s}: {e}")))?;
        AddressSpecHash::from_slice(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_hash_hex_round_trip() {
        let h = ChainHash::digest(b"block");
        let parsed: ChainHash = h.to_string().parse().unwrap();
        assert_eq!(h, parsed);
        assert!(!h.is_zero());
        assert!(ChainHash::ZERO.is_zero());
    }

    #[test]
    fn test_wrong_lengths_rejected() {
        assert!(ChainHash::from_slice(&[0u8; 31]).is_err());
        assert!(AddressSpecHash::from_slice(&[0u8; 32]).is_err());
        assert!("abcd".parse::<AddressSpecHash>().is_err());
    }

    #[test]
    fn test_ordering_is_by_bytes() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        a[0] = 1;
        b[31] = 9;
        assert!(ChainHash::new(b) < ChainHash::new(a));
    }
}
