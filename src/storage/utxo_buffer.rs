use crate::core::hash::{AddressSpecHash, ChainHash, ADDRESS_SPEC_HASH_LEN, BLOCKCHAIN_HASH_LEN};
use crate::core::{TransactionInput, TransactionOutput};
use crate::error::{BlockchainError, Result};
use crate::storage::trie::{HashedTrie, TrieUpdates};
use crate::utils::{deserialize, serialize};
use std::collections::HashMap;

pub const UTXO_KEY_LEN: usize = ADDRESS_SPEC_HASH_LEN + BLOCKCHAIN_HASH_LEN + 2;

/// `recipient ‖ source tx ‖ output index (u16 BE)`
pub fn utxo_key(spec_hash: &AddressSpecHash, tx_hash: &ChainHash, out_idx: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(UTXO_KEY_LEN);
    key.extend_from_slice(spec_hash.as_bytes());
    key.extend_from_slice(tx_hash.as_bytes());
    key.extend_from_slice(&(out_idx as u16).to_be_bytes());
    key
}

fn input_key(input: &TransactionInput) -> Vec<u8> {
    utxo_key(&input.spec_hash, &input.src_tx_id, input.src_tx_out_idx)
}

/// Pending UTXO changes on top of one trie root.
///
/// Reads see pending writes first. Nothing reaches the trie until
/// [`commit_if_root_equals`](Self::commit_if_root_equals) or
/// [`commit`](Self::commit). Each validation attempt builds its own buffer.
#[derive(Clone)]
pub struct UtxoUpdateBuffer {
    trie: HashedTrie,
    utxo_root: ChainHash,
    updates: HashMap<Vec<u8>, Option<Vec<u8>>>,
}

impl UtxoUpdateBuffer {
    pub fn new(trie: HashedTrie, utxo_root: ChainHash) -> Self {
        UtxoUpdateBuffer {
            trie,
            utxo_root,
            updates: HashMap::new(),
        }
    }

    /// The output `input` points at, if it is currently unspent
    pub fn get_output_matching(&self, input: &TransactionInput) -> Result<Option<TransactionOutput>> {
        let key = input_key(input);
        let raw = match self.updates.get(&key) {
            Some(pending) => pending.clone(),
            None => self.trie.get(&self.utxo_root, &key)?,
        };
        raw.map(|bytes| deserialize::<TransactionOutput>(&bytes))
            .transpose()
    }

    pub fn spend_output(&mut self, input: &TransactionInput) {
        self.updates.insert(input_key(input), None);
    }

    pub fn add_output(
        &mut self,
        tx_hash: &ChainHash,
        out_idx: u32,
        output: &TransactionOutput,
    ) -> Result<()> {
        let key = utxo_key(&output.recipient_spec_hash, tx_hash, out_idx);
        self.updates.insert(key, Some(serialize(output)?));
        Ok(())
    }

    fn sorted_updates(&self) -> TrieUpdates {
        self.updates
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Root after applying every pending write; touches nothing
    pub fn simulate_updates(&self) -> Result<ChainHash> {
        self.trie
            .simulate_merge(&self.utxo_root, &self.sorted_updates())
    }

    pub fn commit_if_root_equals(&self, expected_root: &ChainHash) -> Result<()> {
        if self
            .trie
            .merge_if_root_equals(&self.utxo_root, &self.sorted_updates(), expected_root)?
        {
            Ok(())
        } else {
            Err(BlockchainError::validation("New utxo root does not match"))
        }
    }

    pub fn commit(&self) -> Result<ChainHash> {
        self.trie.merge(&self.utxo_root, &self.sorted_updates())
    }
}
