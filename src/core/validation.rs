//! Consensus validation rules
//!
//! Two levels, applied in order. The `check_*_basics` functions are context
//! free and need nothing but the object and the network parameters. The
//! `deep_*` functions apply a transaction or block to a [`UtxoUpdateBuffer`]
//! and check it against the chain state it builds on.
//!
//! Every failure is a [`BlockchainError::Validation`] with a readable reason.
//! Deep checks only write through a private buffer, and that buffer reaches
//! the trie only when the resulting root matches the header.

use crate::core::block::{
    target_int_to_bytes, Block, BlockHeader, BlockSummary, BLOCK_VERSION, NONCE_LENGTH,
    TARGET_LENGTH,
};
use crate::core::difficulty::DifficultyAdjustment;
use crate::core::hash::{AddressSpecHash, ChainHash};
use crate::core::merkle::merkle_root_for_transactions;
use crate::core::monetary::block_reward;
use crate::core::params::NetworkParams;
use crate::core::proof_of_work::{
    check_proof, hash_header_bits, less_than_target, next_context, next_snow_field_index,
    POW_LOOK_PASSES,
};
use crate::core::transaction::{Transaction, TransactionInner, TX_VERSION};
use crate::error::{BlockchainError, Result};
use crate::storage::trie::HashedTrie;
use crate::storage::utxo_buffer::UtxoUpdateBuffer;
use crate::utils::{current_timestamp, verify_signature};
use std::collections::{HashMap, HashSet};

pub const COINBASE_REMARKS_MAX: usize = 100;
pub const MAX_OUTPUTS: usize = 32768;
pub const MAX_TX_EXTRA: usize = 100;
pub const MAX_TX_SIZE: usize = 1_000_000;
pub const MAX_BLOCK_SIZE: usize = 3_800_000;

/// Height and time of the block a transaction is being applied in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxContext {
    pub block_height: u32,
    pub timestamp: i64,
}

fn invalid<T>(msg: impl Into<String>) -> Result<T> {
    Err(BlockchainError::validation(msg))
}

/// Context-free header checks, including the full proof-of-work chain.
///
/// With `ignore_target` set the hash is not compared to the target. Peers use
/// that to look at headers before they know which target applies.
pub fn check_block_header_basics(
    params: &NetworkParams,
    header: &BlockHeader,
    ignore_target: bool,
) -> Result<()> {
    if header.version != BLOCK_VERSION {
        return invalid(format!("Unknown block version {}", header.version));
    }

    let now = current_timestamp()?;
    if header.timestamp > now + params.max_clock_skew_ms {
        return invalid(format!(
            "Block timestamp {} is too far in the future",
            header.timestamp
        ));
    }

    if header.nonce.len() != NONCE_LENGTH {
        return invalid(format!(
            "Nonce must be {NONCE_LENGTH} bytes, got {}",
            header.nonce.len()
        ));
    }
    if header.target.len() != TARGET_LENGTH {
        return invalid(format!(
            "Target must be {TARGET_LENGTH} bytes, got {}",
            header.target.len()
        ));
    }

    let field = params.get_snow_field(header.snow_field).ok_or_else(|| {
        BlockchainError::validation(format!("Unknown snow field {}", header.snow_field))
    })?;
    let word_count = field.word_count();

    if header.pow_proofs.len() != POW_LOOK_PASSES {
        return invalid(format!(
            "Expected {POW_LOOK_PASSES} proofs, got {}",
            header.pow_proofs.len()
        ));
    }
    for proof in &header.pow_proofs {
        if !check_proof(proof, &field.merkle_root, word_count) {
            return invalid(format!("Snow proof for word {} does not verify", proof.word_idx));
        }
    }

    let mut context = hash_header_bits(header, &header.nonce);
    for (pass, proof) in header.pow_proofs.iter().enumerate() {
        let expected_idx = next_snow_field_index(&context, word_count);
        if proof.word_idx != expected_idx {
            return invalid(format!(
                "Proof {pass} reads word {} but the walk asks for {expected_idx}",
                proof.word_idx
            ));
        }
        context = next_context(&context, &proof.merkle_components[0]);
    }
    if context != header.snow_hash {
        return invalid("Snow hash does not match the proof chain");
    }

    if !ignore_target && !less_than_target(&header.snow_hash, &header.target) {
        return invalid("Block hash is not below its target");
    }

    Ok(())
}

/// Header checks plus everything about the body that needs no chain state
pub fn check_block_basics(params: &NetworkParams, block: &Block) -> Result<()> {
    check_block_header_basics(params, block.get_header(), false)?;

    let size = block.serialize()?.len();
    if size > MAX_BLOCK_SIZE {
        return invalid(format!("Block is {size} bytes, limit is {MAX_BLOCK_SIZE}"));
    }

    let transactions = block.get_transactions();
    if transactions.is_empty() {
        return invalid("Block has no transactions");
    }

    for (idx, tx) in transactions.iter().enumerate() {
        let inner = check_transaction_basics(tx)?;
        if idx == 0 && !inner.is_coinbase {
            return invalid("First transaction must be coinbase");
        }
        if idx > 0 && inner.is_coinbase {
            return invalid(format!("Transaction {idx} is a second coinbase"));
        }
    }

    let merkle = merkle_root_for_transactions(transactions)?;
    if merkle != block.get_header().merkle_root_hash {
        return invalid("Merkle root mismatch");
    }
    Ok(())
}

/// Context-free transaction checks. Returns the decoded inner payload.
pub fn check_transaction_basics(tx: &Transaction) -> Result<TransactionInner> {
    let size = tx.size()?;
    if size > MAX_TX_SIZE {
        return invalid(format!("Transaction is {size} bytes, limit is {MAX_TX_SIZE}"));
    }

    if ChainHash::digest(tx.get_inner_data()) != tx.get_tx_hash() {
        return invalid("Transaction hash does not match its inner data");
    }

    let inner = tx
        .inner()
        .map_err(|e| BlockchainError::validation(format!("Unable to decode transaction: {e}")))?;

    if inner.version != TX_VERSION {
        return invalid(format!("Unknown transaction version {}", inner.version));
    }

    if inner.is_coinbase {
        if !inner.inputs.is_empty() {
            return invalid("Coinbase may not have inputs");
        }
        if inner.coinbase_extras.remarks.len() > COINBASE_REMARKS_MAX {
            return invalid(format!(
                "Coinbase remarks longer than {COINBASE_REMARKS_MAX} bytes"
            ));
        }
        if !tx.get_signatures().is_empty() {
            return invalid("Coinbase may not have signatures");
        }
        if inner.fee != 0 {
            return invalid("Coinbase may not declare a fee");
        }
        if !inner.claims.is_empty() {
            return invalid("Coinbase may not have claims");
        }
    } else {
        if inner.inputs.is_empty() {
            return invalid("Transaction must have at least one input");
        }
        if !inner.coinbase_extras.is_empty() {
            return invalid("Only coinbase transactions may carry coinbase extras");
        }
    }

    if inner.outputs.is_empty() {
        return invalid("Transaction must have at least one output");
    }
    if inner.outputs.len() > MAX_OUTPUTS {
        return invalid(format!("More than {MAX_OUTPUTS} outputs"));
    }
    if let Some(idx) = inner.outputs.iter().position(|o| o.value == 0) {
        return invalid(format!("Output {idx} has no value"));
    }
    for input in &inner.inputs {
        if input.src_tx_out_idx as usize >= MAX_OUTPUTS {
            return invalid(format!(
                "Input references output {} which is beyond {MAX_OUTPUTS}",
                input.src_tx_out_idx
            ));
        }
    }

    if inner.extra.len() > MAX_TX_EXTRA {
        return invalid(format!("Extra data longer than {MAX_TX_EXTRA} bytes"));
    }

    check_claims_and_signatures(tx, &inner)?;
    Ok(inner)
}

fn check_claims_and_signatures(tx: &Transaction, inner: &TransactionInner) -> Result<()> {
    let needed: HashSet<AddressSpecHash> = inner.inputs.iter().map(|i| i.spec_hash).collect();

    let mut claimed = HashSet::new();
    for claim in &inner.claims {
        let spec_hash = claim.spec_hash();
        if !needed.contains(&spec_hash) {
            return invalid(format!("Claim {spec_hash} is not used by any input"));
        }
        if !claimed.insert(spec_hash) {
            return invalid(format!("Duplicate claim for {spec_hash}"));
        }
    }
    if claimed.len() != needed.len() {
        return invalid("Not every input address has a claim");
    }

    let mut seen_pairs = HashSet::new();
    let mut signed_per_claim: HashMap<u32, u32> = HashMap::new();
    for entry in tx.get_signatures() {
        let claim = inner.claims.get(entry.claim_idx as usize).ok_or_else(|| {
            BlockchainError::validation(format!("Signature claim index {} out of range", entry.claim_idx))
        })?;
        let sig_spec = claim.sig_specs.get(entry.key_idx as usize).ok_or_else(|| {
            BlockchainError::validation(format!("Signature key index {} out of range", entry.key_idx))
        })?;
        if !seen_pairs.insert((entry.claim_idx, entry.key_idx)) {
            return invalid(format!(
                "Key {} of claim {} signed twice",
                entry.key_idx, entry.claim_idx
            ));
        }
        if !verify_signature(
            sig_spec.signature_type,
            &sig_spec.public_key,
            tx.get_tx_hash().as_bytes(),
            &entry.signature,
        ) {
            return invalid(format!(
                "Bad signature for key {} of claim {}",
                entry.key_idx, entry.claim_idx
            ));
        }
        *signed_per_claim.entry(entry.claim_idx).or_insert(0) += 1;
    }

    for (idx, claim) in inner.claims.iter().enumerate() {
        let have = signed_per_claim.get(&(idx as u32)).copied().unwrap_or(0);
        if have < claim.required_signers {
            return invalid(format!(
                "Claim {idx} needs {} signatures but has {have}",
                claim.required_signers
            ));
        }
    }
    Ok(())
}

/// Applies `tx` to `buffer` and returns its fee.
///
/// Inputs are spent in order, then outputs are added in order. On error the
/// buffer may hold part of the transaction, so callers discard it.
pub fn deep_transaction_check(
    tx: &Transaction,
    buffer: &mut UtxoUpdateBuffer,
    ctx: TxContext,
) -> Result<u64> {
    let inner = tx
        .inner()
        .map_err(|e| BlockchainError::validation(format!("Unable to decode transaction: {e}")))?;

    let mut sum_in: u64 = 0;
    for input in &inner.inputs {
        let output = buffer.get_output_matching(input)?.ok_or_else(|| {
            BlockchainError::validation(format!(
                "No matching output for input {}:{} of {}",
                input.src_tx_id, input.src_tx_out_idx, input.spec_hash
            ))
        })?;

        if let Some(req) = &output.requirements {
            if ctx.block_height < req.required_block_height {
                return invalid(format!(
                    "Output {}:{} is locked until height {}",
                    input.src_tx_id, input.src_tx_out_idx, req.required_block_height
                ));
            }
            if ctx.timestamp < req.required_time {
                return invalid(format!(
                    "Output {}:{} is locked until time {}",
                    input.src_tx_id, input.src_tx_out_idx, req.required_time
                ));
            }
        }

        sum_in = sum_in
            .checked_add(output.value)
            .ok_or_else(|| BlockchainError::validation("Input sum overflows"))?;
        buffer.spend_output(input);
    }

    let mut sum_out: u64 = 0;
    let tx_hash = tx.get_tx_hash();
    for (idx, output) in inner.outputs.iter().enumerate() {
        sum_out = sum_out
            .checked_add(output.value)
            .ok_or_else(|| BlockchainError::validation("Output sum overflows"))?;
        buffer.add_output(&tx_hash, idx as u32, output)?;
    }

    if inner.is_coinbase {
        return Ok(0);
    }

    let spent = sum_out
        .checked_add(inner.fee)
        .ok_or_else(|| BlockchainError::validation("Output sum overflows"))?;
    if sum_in != spent {
        return invalid(format!("Transaction took in {sum_in} and spent {spent}"));
    }
    Ok(inner.fee)
}

/// Checks `block` against its parent and commits its UTXO changes.
///
/// The block must already have passed [`check_block_basics`]. The trie is
/// written only if the resulting root equals the header's `utxo_root_hash`.
pub fn deep_block_validation(
    params: &NetworkParams,
    trie: &HashedTrie,
    block: &Block,
    prev_summary: &BlockSummary,
) -> Result<()> {
    let header = block.get_header();

    let expected_target =
        DifficultyAdjustment::calc_next_target(Some(prev_summary), params, header.timestamp);
    if header.target != target_int_to_bytes(&expected_target) {
        return invalid(format!(
            "Block target does not match expected target at height {}",
            header.block_height
        ));
    }

    if header.snow_field < prev_summary.activated_field {
        return invalid(format!(
            "Snow field {} is below the activated field {}",
            header.snow_field, prev_summary.activated_field
        ));
    }

    if header.prev_block_hash.is_zero() {
        if header.block_height != 0 {
            return invalid("Block without parent must be at height 0");
        }
    } else {
        if header.block_height != prev_summary.get_height() + 1 {
            return invalid(format!(
                "Height {} does not follow parent height {}",
                header.block_height,
                prev_summary.get_height()
            ));
        }
        if header.timestamp <= prev_summary.header.timestamp {
            return invalid("Block timestamp is not after its parent");
        }
    }

    let transactions = block.get_transactions();
    let coinbase = transactions
        .first()
        .ok_or_else(|| BlockchainError::validation("Block has no transactions"))?
        .inner()?;
    if coinbase.coinbase_extras.block_height != header.block_height {
        return invalid(format!(
            "Coinbase height {} does not match block height {}",
            coinbase.coinbase_extras.block_height, header.block_height
        ));
    }
    if header.block_height == 0
        && !coinbase
            .coinbase_extras
            .remarks
            .starts_with(&params.block_zero_remark)
    {
        return invalid("Block zero remark does not match the network");
    }

    let ctx = TxContext {
        block_height: header.block_height,
        timestamp: header.timestamp,
    };
    let mut buffer = UtxoUpdateBuffer::new(trie.clone(), prev_summary.header.utxo_root_hash);
    let mut fee_sum: u64 = 0;
    for tx in transactions {
        let fee = deep_transaction_check(tx, &mut buffer, ctx)?;
        fee_sum = fee_sum
            .checked_add(fee)
            .ok_or_else(|| BlockchainError::validation("Fee sum overflows"))?;
    }

    let allowed = block_reward(params, header.block_height)
        .checked_add(fee_sum)
        .ok_or_else(|| BlockchainError::validation("Reward plus fees overflows"))?;
    let mut coinbase_spent: u64 = 0;
    for output in &coinbase.outputs {
        coinbase_spent = coinbase_spent
            .checked_add(output.value)
            .ok_or_else(|| BlockchainError::validation("Coinbase output sum overflows"))?;
    }
    if coinbase_spent != allowed {
        return invalid(format!(
            "Coinbase could have spent {allowed} but spent {coinbase_spent}"
        ));
    }

    buffer.commit_if_root_equals(&header.utxo_root_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::{AddressSpec, TransactionInput, TransactionOutput};
    use crate::utils::{SigningKey, SIG_TYPE_ECDSA_P256, SIG_TYPE_ED25519};

    fn coinbase(height: u32, value: u64, to: AddressSpecHash) -> Transaction {
        let inner =
            TransactionInner::coinbase(height, b"test".to_vec(), vec![TransactionOutput::new(value, to)]);
        Transaction::from_inner(&inner).unwrap()
    }

    fn spend(
        key: &SigningKey,
        src: &Transaction,
        outputs: Vec<TransactionOutput>,
        fee: u64,
    ) -> Transaction {
        let claim = AddressSpec::single(key);
        let inner = TransactionInner {
            version: TX_VERSION,
            is_coinbase: false,
            coinbase_extras: Default::default(),
            inputs: vec![TransactionInput {
                spec_hash: claim.spec_hash(),
                src_tx_id: src.get_tx_hash(),
                src_tx_out_idx: 0,
            }],
            outputs,
            claims: vec![claim],
            fee,
            extra: vec![],
        };
        let mut tx = Transaction::from_inner(&inner).unwrap();
        tx.sign(0, 0, key).unwrap();
        tx
    }

    fn funded_buffer(key: &SigningKey, value: u64) -> (UtxoUpdateBuffer, Transaction) {
        let trie = HashedTrie::in_memory().unwrap();
        let cb = coinbase(0, value, AddressSpec::single(key).spec_hash());
        let mut buffer = UtxoUpdateBuffer::new(trie.clone(), trie.empty_root());
        let ctx = TxContext {
            block_height: 0,
            timestamp: 0,
        };
        deep_transaction_check(&cb, &mut buffer, ctx).unwrap();
        let root = buffer.commit().unwrap();
        (UtxoUpdateBuffer::new(trie, root), cb)
    }

    const CTX: TxContext = TxContext {
        block_height: 1,
        timestamp: 1000,
    };

    #[test]
    fn test_signed_spend_passes_basics() {
        for sig_type in [SIG_TYPE_ECDSA_P256, SIG_TYPE_ED25519] {
            let key = SigningKey::generate(sig_type).unwrap();
            let src = coinbase(0, 100000, AddressSpec::single(&key).spec_hash());
            let tx = spend(
                &key,
                &src,
                vec![TransactionOutput::new(100000, AddressSpecHash::new([9; 20]))],
                0,
            );
            assert!(check_transaction_basics(&tx).is_ok());
        }
    }

    #[test]
    fn test_unsigned_spend_rejected() {
        let key = SigningKey::generate(SIG_TYPE_ED25519).unwrap();
        let src = coinbase(0, 100000, AddressSpec::single(&key).spec_hash());
        let signed = spend(
            &key,
            &src,
            vec![TransactionOutput::new(100000, AddressSpecHash::new([9; 20]))],
            0,
        );
        let unsigned = Transaction::from_parts(
            signed.get_tx_hash(),
            signed.get_inner_data().to_vec(),
            vec![],
        );
        let err = check_transaction_basics(&unsigned).unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("needs 1 signatures"));
    }

    #[test]
    fn test_duplicate_signature_rejected() {
        let key = SigningKey::generate(SIG_TYPE_ED25519).unwrap();
        let src = coinbase(0, 5, AddressSpec::single(&key).spec_hash());
        let mut tx = spend(
            &key,
            &src,
            vec![TransactionOutput::new(5, AddressSpecHash::new([9; 20]))],
            0,
        );
        tx.sign(0, 0, &key).unwrap();
        assert!(check_transaction_basics(&tx)
            .unwrap_err()
            .to_string()
            .contains("signed twice"));
    }

    #[test]
    fn test_tampered_hash_rejected() {
        let tx = coinbase(3, 10, AddressSpecHash::new([1; 20]));
        let forged = Transaction::from_parts(
            ChainHash::digest(b"other"),
            tx.get_inner_data().to_vec(),
            vec![],
        );
        assert!(check_transaction_basics(&forged).is_err());
    }

    #[test]
    fn test_coinbase_rules() {
        let to = AddressSpecHash::new([1; 20]);
        let mut inner = TransactionInner::coinbase(1, vec![0u8; COINBASE_REMARKS_MAX + 1], vec![
            TransactionOutput::new(10, to),
        ]);
        let long_remarks = Transaction::from_inner(&inner).unwrap();
        assert!(check_transaction_basics(&long_remarks).is_err());

        inner.coinbase_extras.remarks = vec![];
        inner.fee = 1;
        assert!(check_transaction_basics(&Transaction::from_inner(&inner).unwrap()).is_err());

        inner.fee = 0;
        inner.outputs = vec![TransactionOutput::new(0, to)];
        assert!(check_transaction_basics(&Transaction::from_inner(&inner).unwrap()).is_err());
    }

    #[test]
    fn test_conservation_is_exact() {
        let key = SigningKey::generate(SIG_TYPE_ED25519).unwrap();
        let (buffer, src) = funded_buffer(&key, 100000);
        let to = AddressSpecHash::new([7; 20]);

        let exact = spend(&key, &src, vec![TransactionOutput::new(99000, to)], 1000);
        let mut ok_buffer = buffer.clone();
        assert_eq!(deep_transaction_check(&exact, &mut ok_buffer, CTX).unwrap(), 1000);

        let over = spend(&key, &src, vec![TransactionOutput::new(99001, to)], 1000);
        let mut bad_buffer = buffer.clone();
        let err = deep_transaction_check(&over, &mut bad_buffer, CTX).unwrap_err();
        assert_eq!(
            err,
            BlockchainError::validation("Transaction took in 100000 and spent 100001")
        );
    }

    #[test]
    fn test_double_spend_within_buffer() {
        let key = SigningKey::generate(SIG_TYPE_ED25519).unwrap();
        let (mut buffer, src) = funded_buffer(&key, 100000);
        let to = AddressSpecHash::new([7; 20]);
        let first = spend(&key, &src, vec![TransactionOutput::new(100000, to)], 0);
        let second = spend(&key, &src, vec![TransactionOutput::new(50000, to)], 50000);

        deep_transaction_check(&first, &mut buffer, CTX).unwrap();
        let err = deep_transaction_check(&second, &mut buffer, CTX).unwrap_err();
        assert!(err.to_string().contains("No matching output for input"));
    }

    #[test]
    fn test_locked_output_waits_for_height() {
        let key = SigningKey::generate(SIG_TYPE_ED25519).unwrap();
        let spec = AddressSpec::single(&key).spec_hash();
        let mut out = TransactionOutput::new(500, spec);
        out.requirements = Some(crate::core::transaction::OutputRequirements {
            required_block_height: 10,
            required_time: 0,
        });
        let src = Transaction::from_inner(&TransactionInner::coinbase(0, vec![], vec![out])).unwrap();

        let trie = HashedTrie::in_memory().unwrap();
        let mut setup = UtxoUpdateBuffer::new(trie.clone(), trie.empty_root());
        deep_transaction_check(&src, &mut setup, CTX).unwrap();
        let root = setup.commit().unwrap();

        let tx = spend(&key, &src, vec![TransactionOutput::new(500, spec)], 0);
        let mut early = UtxoUpdateBuffer::new(trie.clone(), root);
        assert!(deep_transaction_check(&tx, &mut early, CTX).is_err());

        let mut later = UtxoUpdateBuffer::new(trie, root);
        let ctx = TxContext {
            block_height: 10,
            timestamp: 1000,
        };
        assert!(deep_transaction_check(&tx, &mut later, ctx).is_ok());
    }

    mod blocks {
        use super::*;
        use crate::core::ingestor::{BlockIngestor, ChainStateSource};
        use crate::testnet::{build_block, open_test_ingestor, reward_key, spend_output};
        use tempfile::TempDir;

        const T0: i64 = 1_000_000;

        struct Fixture {
            ingestor: BlockIngestor,
            _dir: TempDir,
            /// Summary of the ingested block zero
            parent: BlockSummary,
            /// Valid, mined, not yet ingested child of `parent`
            child: Block,
        }

        fn fixture() -> Fixture {
            let (ingestor, dir) = open_test_ingestor().unwrap();
            let b0 = build_block(&ingestor, &ingestor.head_or_start(), T0, vec![]).unwrap();
            ingestor.ingest_block(&b0).unwrap();
            let parent = ingestor.head().unwrap();
            let child = build_block(&ingestor, &parent, T0 + 1000, vec![]).unwrap();
            Fixture {
                ingestor,
                _dir: dir,
                parent,
                child,
            }
        }

        fn reason(result: Result<()>) -> String {
            match result.unwrap_err() {
                BlockchainError::Validation(msg) => msg,
                other => panic!("expected a validation error, got {other}"),
            }
        }

        fn header_reason(block: &Block) -> String {
            reason(check_block_header_basics(
                &NetworkParams::regtest(),
                block.get_header(),
                false,
            ))
        }

        fn basics_reason(block: &Block) -> String {
            reason(check_block_basics(&NetworkParams::regtest(), block))
        }

        fn deep_reason(f: &Fixture, block: &Block, prev: &BlockSummary) -> String {
            reason(deep_block_validation(
                f.ingestor.params(),
                f.ingestor.trie(),
                block,
                prev,
            ))
        }

        fn remine(block: &mut Block) {
            crate::testnet::mine(block).unwrap();
        }

        // Walks the field for fresh nonces until the final hash lands at or
        // above the target, keeping proofs and snow hash consistent
        fn walk_above_target(header: &mut BlockHeader) {
            let field = NetworkParams::regtest_field(header.snow_field).unwrap();
            let word_count = field.word_count();
            for attempt in 0..10_000u64 {
                let mut nonce = vec![0xee; 4];
                nonce.extend_from_slice(&attempt.to_be_bytes());
                let mut context = hash_header_bits(header, &nonce);
                let mut proofs = Vec::new();
                for _ in 0..POW_LOOK_PASSES {
                    let idx = next_snow_field_index(&context, word_count);
                    context = next_context(&context, field.word(idx).unwrap());
                    proofs.push(field.proof(idx).unwrap());
                }
                if !less_than_target(&context, &header.target) {
                    header.nonce = nonce;
                    header.snow_hash = context;
                    header.pow_proofs = proofs;
                    return;
                }
            }
            panic!("every walk landed below the target");
        }

        #[test]
        fn test_honest_child_passes() {
            let f = fixture();
            check_block_basics(f.ingestor.params(), &f.child).unwrap();
            deep_block_validation(f.ingestor.params(), f.ingestor.trie(), &f.child, &f.parent)
                .unwrap();
        }

        #[test]
        fn test_future_timestamp_rejected() {
            let f = fixture();
            let later = current_timestamp().unwrap() + 600_000;
            let block = build_block(&f.ingestor, &f.parent, later, vec![]).unwrap();
            assert_eq!(
                header_reason(&block),
                format!("Block timestamp {later} is too far in the future")
            );
        }

        #[test]
        fn test_missing_proof_rejected() {
            let mut block = fixture().child;
            block.header_mut().pow_proofs.pop();
            assert_eq!(
                header_reason(&block),
                format!("Expected {POW_LOOK_PASSES} proofs, got {}", POW_LOOK_PASSES - 1)
            );
        }

        #[test]
        fn test_broken_merkle_proof_rejected() {
            let mut block = fixture().child;
            let proof = &mut block.header_mut().pow_proofs[2];
            proof.merkle_components[1][0] ^= 0x01;
            let word_idx = proof.word_idx;
            assert_eq!(
                header_reason(&block),
                format!("Snow proof for word {word_idx} does not verify")
            );
        }

        #[test]
        fn test_snow_hash_must_match_walk() {
            let mut block = fixture().child;
            let mut bytes = [0u8; 32];
            bytes.copy_from_slice(block.get_header().snow_hash.as_bytes());
            bytes[31] ^= 0x01;
            block.header_mut().snow_hash = ChainHash::new(bytes);
            assert_eq!(header_reason(&block), "Snow hash does not match the proof chain");
        }

        #[test]
        fn test_hash_above_target_rejected() {
            let mut block = fixture().child;
            walk_above_target(block.header_mut());
            assert_eq!(header_reason(&block), "Block hash is not below its target");
            // headers can still be inspected before the target is known
            check_block_header_basics(&NetworkParams::regtest(), block.get_header(), true)
                .unwrap();
        }

        #[test]
        fn test_merkle_root_mismatch_rejected() {
            let mut block = fixture().child;
            block.header_mut().merkle_root_hash = ChainHash::digest(b"elsewhere");
            remine(&mut block);
            assert_eq!(basics_reason(&block), "Merkle root mismatch");
        }

        #[test]
        fn test_coinbase_position_enforced() {
            let f = fixture();
            let header = f.child.get_header().clone();
            let coinbase = f.child.get_transactions()[0].clone();

            let b0 = f.ingestor.get_block(&f.parent.get_hash()).unwrap().unwrap();
            let spec = AddressSpec::single(reward_key()).spec_hash();
            let spend =
                spend_output(reward_key(), &b0.get_transactions()[0], 0, 0, &spec).unwrap();

            let no_coinbase = Block::new(header.clone(), vec![spend]);
            assert_eq!(
                basics_reason(&no_coinbase),
                "First transaction must be coinbase"
            );

            let two_coinbases = Block::new(header, vec![coinbase.clone(), coinbase]);
            assert_eq!(
                basics_reason(&two_coinbases),
                "Transaction 1 is a second coinbase"
            );
        }

        #[test]
        fn test_target_must_follow_retarget() {
            let f = fixture();
            let mut block = f.child.clone();
            let easier = f.ingestor.params().max_target.clone() / 2;
            block.header_mut().target = target_int_to_bytes(&easier);
            assert_eq!(
                deep_reason(&f, &block, &f.parent),
                "Block target does not match expected target at height 1"
            );
        }

        #[test]
        fn test_field_below_activated_rejected() {
            let f = fixture();
            let mut prev = f.parent.clone();
            prev.activated_field = 1;
            assert_eq!(
                deep_reason(&f, &f.child, &prev),
                "Snow field 0 is below the activated field 1"
            );
        }

        #[test]
        fn test_height_must_follow_parent() {
            let f = fixture();
            let mut block = f.child.clone();
            block.header_mut().block_height = 2;
            assert_eq!(
                deep_reason(&f, &block, &f.parent),
                "Height 2 does not follow parent height 0"
            );

            let start = f.ingestor.start_summary().clone();
            let mut orphan_zero =
                build_block(&f.ingestor, &start, T0 + 5000, vec![]).unwrap();
            orphan_zero.header_mut().block_height = 1;
            assert_eq!(
                deep_reason(&f, &orphan_zero, &start),
                "Block without parent must be at height 0"
            );
        }

        #[test]
        fn test_timestamp_must_follow_parent() {
            let f = fixture();
            let same_time = build_block(&f.ingestor, &f.parent, T0, vec![]).unwrap();
            assert_eq!(
                deep_reason(&f, &same_time, &f.parent),
                "Block timestamp is not after its parent"
            );
        }

        #[test]
        fn test_coinbase_height_must_match() {
            let f = fixture();
            let mut inner = f.child.get_transactions()[0].inner().unwrap();
            inner.coinbase_extras.block_height = 5;
            let coinbase = Transaction::from_inner(&inner).unwrap();
            let block = Block::new(f.child.get_header().clone(), vec![coinbase]);
            assert_eq!(
                deep_reason(&f, &block, &f.parent),
                "Coinbase height 5 does not match block height 1"
            );
        }

        #[test]
        fn test_block_zero_needs_network_remark() {
            let f = fixture();
            let start = f.ingestor.start_summary().clone();
            let honest = build_block(&f.ingestor, &start, T0 + 5000, vec![]).unwrap();
            let mut inner = honest.get_transactions()[0].inner().unwrap();
            inner.coinbase_extras.remarks = b"some other chain".to_vec();
            let coinbase = Transaction::from_inner(&inner).unwrap();
            let block = Block::new(honest.get_header().clone(), vec![coinbase]);
            assert_eq!(
                deep_reason(&f, &block, &start),
                "Block zero remark does not match the network"
            );
        }

        #[test]
        fn test_declared_utxo_root_must_match() {
            let f = fixture();
            let mut block = f.child.clone();
            block.header_mut().utxo_root_hash = f.parent.header.utxo_root_hash;
            assert_eq!(
                deep_reason(&f, &block, &f.parent),
                "New utxo root does not match"
            );
            assert_eq!(f.ingestor.height(), Some(0));
        }
    }
}
