use crate::core::block::{target_int_to_bytes, Block, BlockHeader, BlockSummary, BLOCK_VERSION};
use crate::core::difficulty::DifficultyAdjustment;
use crate::core::hash::AddressSpecHash;
use crate::core::ingestor::{BlockIngestor, ChainStateSource};
use crate::core::merkle::merkle_root_for_transactions;
use crate::core::monetary::block_reward;
use crate::core::params::NetworkParams;
use crate::core::transaction::{Transaction, TransactionInner, TransactionOutput};
use crate::core::validation::{deep_transaction_check, TxContext, MAX_BLOCK_SIZE};
use crate::error::{BlockchainError, Result};
use crate::storage::memory_pool::MemPool;
use crate::storage::trie::HashedTrie;
use crate::storage::utxo_buffer::UtxoUpdateBuffer;
use crate::utils::current_timestamp;
use log::debug;
use std::sync::Arc;

/// Room left in a template for the coinbase and the header
const TEMPLATE_RESERVED_BYTES: usize = 64 * 1024;

/// Builds block templates on the current tip for miners
pub struct BlockForge {
    ingestor: Arc<BlockIngestor>,
    mempool: Arc<MemPool>,
}

impl BlockForge {
    pub fn new(ingestor: Arc<BlockIngestor>, mempool: Arc<MemPool>) -> BlockForge {
        BlockForge { ingestor, mempool }
    }

    /// A block paying `reward_spec_hash` with the best mempool transactions.
    ///
    /// Everything but `nonce`, `snow_hash` and `pow_proofs` is final, so the
    /// result only needs a proof-of-work search before submission.
    pub fn create_block_template(&self, reward_spec_hash: &AddressSpecHash) -> Result<Block> {
        let prev = self.ingestor.head_or_start();
        let timestamp = current_timestamp()?.max(prev.header.timestamp + 1);

        let transactions = self.mempool.get_transactions_for_block(
            &prev.header.utxo_root_hash,
            MAX_BLOCK_SIZE - TEMPLATE_RESERVED_BYTES,
        )?;

        assemble_block(
            self.ingestor.params(),
            self.ingestor.trie(),
            &prev,
            timestamp,
            reward_spec_hash,
            transactions,
        )
    }
}

/// Assembles an unmined block on `prev`.
///
/// Transactions that no longer apply on top of the earlier ones are left out.
/// The coinbase pays the block reward plus the fees of what remains.
pub fn assemble_block(
    params: &NetworkParams,
    trie: &HashedTrie,
    prev: &BlockSummary,
    timestamp: i64,
    reward_spec_hash: &AddressSpecHash,
    transactions: Vec<Transaction>,
) -> Result<Block> {
    let block_height = if prev.get_hash().is_zero() {
        0
    } else {
        prev.get_height() + 1
    };
    let ctx = TxContext {
        block_height,
        timestamp,
    };

    let mut trial = UtxoUpdateBuffer::new(trie.clone(), prev.header.utxo_root_hash);
    let mut included = Vec::with_capacity(transactions.len());
    let mut fee_sum: u64 = 0;
    for tx in transactions {
        let mut attempt = trial.clone();
        match deep_transaction_check(&tx, &mut attempt, ctx) {
            Ok(fee) => {
                fee_sum = fee_sum
                    .checked_add(fee)
                    .ok_or_else(|| BlockchainError::validation("Fee sum overflows"))?;
                trial = attempt;
                included.push(tx);
            }
            Err(e) => debug!("Leaving {} out of template: {e}", tx.get_tx_hash()),
        }
    }

    let remarks = if block_height == 0 {
        params.block_zero_remark.clone()
    } else {
        vec![]
    };
    let reward = block_reward(params, block_height)
        .checked_add(fee_sum)
        .ok_or_else(|| BlockchainError::validation("Reward plus fees overflows"))?;
    let coinbase = Transaction::from_inner(&TransactionInner::coinbase(
        block_height,
        remarks,
        vec![TransactionOutput::new(reward, *reward_spec_hash)],
    ))?;

    let mut buffer = UtxoUpdateBuffer::new(trie.clone(), prev.header.utxo_root_hash);
    deep_transaction_check(&coinbase, &mut buffer, ctx)?;
    for tx in &included {
        deep_transaction_check(tx, &mut buffer, ctx)?;
    }
    let utxo_root_hash = buffer.simulate_updates()?;

    let mut block_transactions = Vec::with_capacity(included.len() + 1);
    block_transactions.push(coinbase);
    block_transactions.extend(included);

    let target = DifficultyAdjustment::calc_next_target(Some(prev), params, timestamp);
    let header = BlockHeader {
        version: BLOCK_VERSION,
        block_height,
        prev_block_hash: prev.get_hash(),
        merkle_root_hash: merkle_root_for_transactions(&block_transactions)?,
        utxo_root_hash,
        timestamp,
        target: target_int_to_bytes(&target),
        snow_field: prev.activated_field,
        ..Default::default()
    };
    Ok(Block::new(header, block_transactions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ingestor::IngestOutcome;
    use crate::core::transaction::AddressSpec;
    use crate::core::validation::check_block_basics;
    use crate::testnet::{mine, open_test_ingestor, reward_key, spend_output};

    #[test]
    fn test_template_mines_into_valid_block() {
        let (ingestor, _dir) = open_test_ingestor().unwrap();
        let ingestor = Arc::new(ingestor);
        let mempool = Arc::new(MemPool::new(ingestor.trie().clone(), ingestor.clone(), 60_000));
        let forge = BlockForge::new(ingestor.clone(), mempool);

        let spec = AddressSpec::single(reward_key()).spec_hash();
        let mut block = forge.create_block_template(&spec).unwrap();
        assert_eq!(block.get_height(), 0);
        assert!(block.get_header().nonce.is_empty());

        mine(&mut block).unwrap();
        check_block_basics(ingestor.params(), &block).unwrap();
        assert_eq!(
            ingestor.ingest_block(&block).unwrap(),
            IngestOutcome::Accepted { tip_advanced: true }
        );
    }

    #[test]
    fn test_stale_transactions_are_left_out() {
        let (ingestor, _dir) = open_test_ingestor().unwrap();
        let params = NetworkParams::regtest();
        let spec = AddressSpec::single(reward_key()).spec_hash();
        let start = ingestor.head_or_start();

        let mut b0 =
            assemble_block(&params, ingestor.trie(), &start, 1_000_000, &spec, vec![]).unwrap();
        mine(&mut b0).unwrap();
        ingestor.ingest_block(&b0).unwrap();

        let coinbase = &b0.get_transactions()[0];
        let good = spend_output(reward_key(), coinbase, 0, 1000, &spec).unwrap();
        let conflicting = spend_output(reward_key(), coinbase, 0, 2000, &spec).unwrap();

        let block = assemble_block(
            &params,
            ingestor.trie(),
            &ingestor.head_or_start(),
            1_001_000,
            &spec,
            vec![good.clone(), conflicting],
        )
        .unwrap();
        assert_eq!(block.get_transactions().len(), 2);
        assert_eq!(block.get_transactions()[1], good);

        let coinbase_out = block.get_transactions()[0].inner().unwrap().outputs[0].value;
        assert_eq!(coinbase_out, block_reward(&params, 1) + 1000);
    }
}
