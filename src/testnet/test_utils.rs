use crate::core::block::{Block, BlockSummary};
use crate::core::block_forge::assemble_block;
use crate::core::hash::AddressSpecHash;
use crate::core::ingestor::{BlockIngestor, ChainStateSource};
use crate::core::params::NetworkParams;
use crate::core::transaction::{
    AddressSpec, Transaction, TransactionInner, TransactionInput, TransactionOutput, TX_VERSION,
};
use crate::error::{BlockchainError, Result};
use crate::storage::chain_store::ChainStore;
use crate::storage::trie::HashedTrie;
use crate::utils::{SigningKey, SIG_TYPE_ED25519};
use once_cell::sync::Lazy;
use tempfile::TempDir;

const MINE_ATTEMPTS: u64 = 100_000;

static REWARD_KEY: Lazy<SigningKey> =
    Lazy::new(|| SigningKey::generate(SIG_TYPE_ED25519).expect("key generation"));

/// Key that test blocks pay their reward to
pub fn reward_key() -> &'static SigningKey {
    &REWARD_KEY
}

pub fn create_temp_dir() -> Result<TempDir> {
    tempfile::tempdir().map_err(|e| BlockchainError::Io(e.to_string()))
}

/// Regtest ingestor over a fresh sled database
pub fn open_test_ingestor() -> Result<(BlockIngestor, TempDir)> {
    let dir = create_temp_dir()?;
    let path = dir.path().join("chain");
    let store = ChainStore::open(&path.to_string_lossy())?;
    let trie = HashedTrie::sled(store.utxo_trie_tree()?)?;
    let ingestor = BlockIngestor::new(NetworkParams::regtest(), store, trie, true)?;
    Ok((ingestor, dir))
}

/// Fills in the proof of work using the regtest field data
pub fn mine(block: &mut Block) -> Result<()> {
    let field_id = block.get_header().snow_field;
    let field = NetworkParams::regtest_field(field_id)
        .ok_or_else(|| BlockchainError::Config(format!("No regtest data for field {field_id}")))?;
    if field.mine(block.header_mut(), MINE_ATTEMPTS) {
        Ok(())
    } else {
        Err(BlockchainError::Validation("No proof of work found".to_string()))
    }
}

/// Mined block on `prev` paying the reward key
pub fn build_block(
    ingestor: &BlockIngestor,
    prev: &BlockSummary,
    timestamp: i64,
    transactions: Vec<Transaction>,
) -> Result<Block> {
    let spec = AddressSpec::single(reward_key()).spec_hash();
    let mut block = assemble_block(
        ingestor.params(),
        ingestor.trie(),
        prev,
        timestamp,
        &spec,
        transactions,
    )?;
    mine(&mut block)?;
    Ok(block)
}

/// Spends output `out_idx` of `src`, owned by `key`, to `to` minus `fee`
pub fn spend_output(
    key: &SigningKey,
    src: &Transaction,
    out_idx: u32,
    fee: u64,
    to: &AddressSpecHash,
) -> Result<Transaction> {
    let src_inner = src.inner()?;
    let value = src_inner
        .outputs
        .get(out_idx as usize)
        .map(|o| o.value)
        .ok_or_else(|| BlockchainError::validation("No such output"))?;

    let claim = AddressSpec::single(key);
    let inner = TransactionInner {
        version: TX_VERSION,
        is_coinbase: false,
        coinbase_extras: Default::default(),
        inputs: vec![TransactionInput {
            spec_hash: claim.spec_hash(),
            src_tx_id: src.get_tx_hash(),
            src_tx_out_idx: out_idx,
        }],
        outputs: vec![TransactionOutput::new(value - fee, *to)],
        claims: vec![claim],
        fee,
        extra: vec![],
    };
    let mut tx = Transaction::from_inner(&inner)?;
    tx.sign(0, 0, key)?;
    Ok(tx)
}
