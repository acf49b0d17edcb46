use crate::core::hash::{AddressSpecHash, ChainHash};
use crate::error::Result;
use crate::utils::{deserialize_exact, serialize, SigningKey};
use serde::{Deserialize, Serialize};

pub const TX_VERSION: u32 = 1;

/// A transaction as it travels and is stored: the hash, the encoded inner
/// payload the hash commits to, and the signatures over that hash.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    tx_hash: ChainHash,
    inner_data: Vec<u8>,
    signatures: Vec<SignatureEntry>,
}

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct TransactionInner {
    pub version: u32,
    pub is_coinbase: bool,
    pub coinbase_extras: CoinbaseExtras,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub claims: Vec<AddressSpec>,
    pub fee: u64,
    pub extra: Vec<u8>,
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
pub struct CoinbaseExtras {
    pub block_height: u32,
    pub remarks: Vec<u8>,
}

impl CoinbaseExtras {
    pub fn is_empty(&self) -> bool {
        self.block_height == 0 && self.remarks.is_empty()
    }
}

/// Points at an output of an earlier transaction
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct TransactionInput {
    pub spec_hash: AddressSpecHash,
    pub src_tx_id: ChainHash,
    pub src_tx_out_idx: u32,
}

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct TransactionOutput {
    pub value: u64,
    pub recipient_spec_hash: AddressSpecHash,
    pub requirements: Option<OutputRequirements>,
}

/// Conditions that must hold before an output may be spent
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
pub struct OutputRequirements {
    pub required_block_height: u32,
    pub required_time: i64,
}

/// A set of keys and how many of them must sign
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct AddressSpec {
    pub required_signers: u32,
    pub sig_specs: Vec<SigSpec>,
}

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct SigSpec {
    pub signature_type: u32,
    pub public_key: Vec<u8>,
}

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct SignatureEntry {
    pub claim_idx: u32,
    pub key_idx: u32,
    pub signature: Vec<u8>,
}

impl AddressSpec {
    /// A one-of-one spec for a single key
    pub fn single(key: &SigningKey) -> AddressSpec {
        AddressSpec {
            required_signers: 1,
            sig_specs: vec![SigSpec {
                signature_type: key.signature_type(),
                public_key: key.public_key().to_vec(),
            }],
        }
    }

    /// Fixed-width big-endian encoding hashed into the spec hash. Independent
    /// of the bincode layout so the address of a key never changes.
    fn hash_input(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend(self.required_signers.to_be_bytes());
        data.extend((self.sig_specs.len() as u32).to_be_bytes());
        for spec in &self.sig_specs {
            data.extend(spec.signature_type.to_be_bytes());
            data.extend((spec.public_key.len() as u32).to_be_bytes());
            data.extend(&spec.public_key);
        }
        data
    }

    pub fn spec_hash(&self) -> AddressSpecHash {
        AddressSpecHash::digest(&self.hash_input())
    }
}

impl TransactionInner {
    /// Inner payload of a coinbase paying `outputs` at `block_height`
    pub fn coinbase(block_height: u32, remarks: Vec<u8>, outputs: Vec<TransactionOutput>) -> Self {
        TransactionInner {
            version: TX_VERSION,
            is_coinbase: true,
            coinbase_extras: CoinbaseExtras {
                block_height,
                remarks,
            },
            inputs: vec![],
            outputs,
            claims: vec![],
            fee: 0,
            extra: vec![],
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serialize(self)
    }
}

impl TransactionOutput {
    pub fn new(value: u64, recipient_spec_hash: AddressSpecHash) -> Self {
        TransactionOutput {
            value,
            recipient_spec_hash,
            requirements: None,
        }
    }
}

impl Transaction {
    /// Wraps an inner payload, computing its hash. Carries no signatures yet.
    pub fn from_inner(inner: &TransactionInner) -> Result<Transaction> {
        let inner_data = inner.encode()?;
        Ok(Transaction {
            tx_hash: ChainHash::digest(&inner_data),
            inner_data,
            signatures: vec![],
        })
    }

    /// Raw constructor used when the parts came off the wire
    pub fn from_parts(
        tx_hash: ChainHash,
        inner_data: Vec<u8>,
        signatures: Vec<SignatureEntry>,
    ) -> Transaction {
        Transaction {
            tx_hash,
            inner_data,
            signatures,
        }
    }

    /// Signs the transaction hash with `key` for the given claim/key slot
    pub fn sign(&mut self, claim_idx: u32, key_idx: u32, key: &SigningKey) -> Result<()> {
        let signature = key.sign(self.tx_hash.as_bytes())?;
        self.signatures.push(SignatureEntry {
            claim_idx,
            key_idx,
            signature,
        });
        Ok(())
    }

    pub fn get_tx_hash(&self) -> ChainHash {
        self.tx_hash
    }

    pub fn get_inner_data(&self) -> &[u8] {
        &self.inner_data
    }

    pub fn get_signatures(&self) -> &[SignatureEntry] {
        &self.signatures
    }

    /// Decodes the inner payload; trailing bytes are rejected
    pub fn inner(&self) -> Result<TransactionInner> {
        deserialize_exact(&self.inner_data)
    }

    /// Encoded size, which is what block and mempool size budgets count
    pub fn size(&self) -> Result<usize> {
        Ok(serialize(self)?.len())
    }
}
