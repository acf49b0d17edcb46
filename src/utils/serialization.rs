// Bincode 2 helpers used for everything we persist, hash or put in a block
use crate::error::{BlockchainError, Result};
use bincode::config::{standard, Configuration};
use serde::{Deserialize, Serialize};

const CONFIG: Configuration = standard();

pub fn serialize<T: Serialize + bincode::Encode>(data: &T) -> Result<Vec<u8>> {
    bincode::encode_to_vec(data, CONFIG)
        .map_err(|e| BlockchainError::Serialization(format!("Failed to encode: {e}")))
}

/// Decodes `bytes`, returning the value and how many bytes it took
fn decode<T>(bytes: &[u8]) -> Result<(T, usize)>
where
    T: for<'de> Deserialize<'de> + bincode::Decode<()>,
{
    bincode::decode_from_slice(bytes, CONFIG)
        .map_err(|e| BlockchainError::Serialization(format!("Failed to decode: {e}")))
}

/// Decodes a value from the front of `bytes`. Anything after it is ignored.
pub fn deserialize<T>(bytes: &[u8]) -> Result<T>
where
    T: for<'de> Deserialize<'de> + bincode::Decode<()>,
{
    decode(bytes).map(|(data, _)| data)
}

/// Like [`deserialize`], but trailing bytes are an error.
///
/// Transaction payloads go through this one so a given transaction has
/// exactly one encoding.
pub fn deserialize_exact<T>(bytes: &[u8]) -> Result<T>
where
    T: for<'de> Deserialize<'de> + bincode::Decode<()>,
{
    let (data, used) = decode(bytes)?;
    if used != bytes.len() {
        return Err(BlockchainError::Serialization(format!(
            "Extra data at end: decoded {used} of {} bytes",
            bytes.len()
        )));
    }
    Ok(data)
}
