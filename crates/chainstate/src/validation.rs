//! Context-free and contextual block/transaction checks.

use std::collections::HashSet;

use bitnode_consensus::constants::{
    COINBASE_MATURITY, LOCKTIME_THRESHOLD, MAX_BLOCK_SIGOPS, MAX_BLOCK_SIZE,
    MAX_COINBASE_SCRIPT_LEN, MIN_COINBASE_SCRIPT_LEN, SEQUENCE_FINAL,
};
use bitnode_consensus::money::{money_range, Amount};
use bitnode_consensus::{block_subsidy, ConsensusParams, Forks, Hash256};
use bitnode_pow::difficulty::CompactError;
use bitnode_pow::PowError;
use bitnode_primitives::block::Block;
use bitnode_primitives::hash::sha256d;
use bitnode_primitives::outpoint::OutPoint;
use bitnode_primitives::transaction::Transaction;
use bitnode_script::interpreter::is_p2sh;

use crate::index::BlockIndex;
use crate::utxo::UtxoView;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    InvalidBlock(&'static str),
    InvalidHeader(&'static str),
    InvalidTransaction(&'static str),
    ValueOutOfRange,
    DuplicateInput,
    DuplicateTransaction,
    /// Two inputs in one block spend the same output.
    DuplicateSpend,
    MerkleMismatch,
    Pow(PowError),
    Compact(CompactError),
    BadDifficulty { expected: u32, found: u32 },
    VersionTooLow { required: i32, found: i32 },
    TimeTooOld,
    TimeTooNew,
    CheckpointMismatch(u32),
    NonFinal,
    BadCoinbaseHeight,
    SigopsExceeded(u32),
    MissingInputs(OutPoint),
    PrematureCoinbaseSpend(OutPoint),
    ValueInBelowValueOut { value_in: Amount, value_out: Amount },
    CoinbaseTooLarge { allowed: Amount, claimed: Amount },
    /// The block would overwrite an unspent output.
    OverwritesUnspent(OutPoint),
    ScriptCheckFailed,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::InvalidBlock(message) => write!(f, "{message}"),
            ValidationError::InvalidHeader(message) => write!(f, "{message}"),
            ValidationError::InvalidTransaction(message) => write!(f, "{message}"),
            ValidationError::ValueOutOfRange => write!(f, "value out of range"),
            ValidationError::DuplicateInput => write!(f, "duplicate input"),
            ValidationError::DuplicateTransaction => write!(f, "duplicate transaction"),
            ValidationError::DuplicateSpend => write!(f, "output spent twice in block"),
            ValidationError::MerkleMismatch => write!(f, "merkle root mismatch"),
            ValidationError::Pow(err) => write!(f, "{err}"),
            ValidationError::Compact(err) => write!(f, "{err}"),
            ValidationError::BadDifficulty { expected, found } => {
                write!(f, "incorrect difficulty bits {found:08x}, expected {expected:08x}")
            }
            ValidationError::VersionTooLow { required, found } => {
                write!(f, "block version {found} below required {required}")
            }
            ValidationError::TimeTooOld => write!(f, "block time not after median time past"),
            ValidationError::TimeTooNew => write!(f, "block time too far in the future"),
            ValidationError::CheckpointMismatch(height) => {
                write!(f, "header conflicts with checkpoint at height {height}")
            }
            ValidationError::NonFinal => write!(f, "transaction is not final"),
            ValidationError::BadCoinbaseHeight => write!(f, "coinbase height mismatch"),
            ValidationError::SigopsExceeded(count) => write!(f, "block sigops {count} over limit"),
            ValidationError::MissingInputs(outpoint) => write!(f, "missing input {outpoint}"),
            ValidationError::PrematureCoinbaseSpend(outpoint) => {
                write!(f, "premature spend of coinbase output {outpoint}")
            }
            ValidationError::ValueInBelowValueOut {
                value_in,
                value_out,
            } => write!(f, "value in {value_in} below value out {value_out}"),
            ValidationError::CoinbaseTooLarge { allowed, claimed } => {
                write!(f, "coinbase pays {claimed}, limit {allowed}")
            }
            ValidationError::OverwritesUnspent(outpoint) => {
                write!(f, "transaction overwrites unspent output {outpoint}")
            }
            ValidationError::ScriptCheckFailed => write!(f, "script verification failed"),
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<PowError> for ValidationError {
    fn from(err: PowError) -> Self {
        ValidationError::Pow(err)
    }
}

impl From<CompactError> for ValidationError {
    fn from(err: CompactError) -> Self {
        ValidationError::Compact(err)
    }
}

/// Block content rules.
pub struct BlockCheck<'a> {
    params: &'a ConsensusParams,
}

impl<'a> BlockCheck<'a> {
    pub fn new(params: &'a ConsensusParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ConsensusParams {
        self.params
    }

    /// Context-free block checks. Returns the transaction ids.
    pub fn check(&self, block: &Block) -> Result<Vec<Hash256>, ValidationError> {
        let Some(coinbase) = block.transactions.first() else {
            return Err(ValidationError::InvalidBlock(
                "block must contain at least one transaction",
            ));
        };
        if block.serialized_size() > MAX_BLOCK_SIZE {
            return Err(ValidationError::InvalidBlock("block size too large"));
        }
        if !coinbase.is_coinbase() {
            return Err(ValidationError::InvalidBlock("first transaction is not coinbase"));
        }
        if block.transactions[1..].iter().any(Transaction::is_coinbase) {
            return Err(ValidationError::InvalidBlock("more than one coinbase"));
        }
        for tx in &block.transactions {
            self.check_transaction(tx)?;
        }

        let txids = block.txids();
        let mut seen = HashSet::with_capacity(txids.len());
        if !txids.iter().all(|txid| seen.insert(*txid)) {
            return Err(ValidationError::DuplicateTransaction);
        }
        let (root, mutated) = merkle_root(&txids)?;
        if root != block.header.merkle_root {
            return Err(ValidationError::MerkleMismatch);
        }
        if mutated {
            return Err(ValidationError::DuplicateTransaction);
        }

        let sigops = block_sigops(block);
        if sigops > MAX_BLOCK_SIGOPS {
            return Err(ValidationError::SigopsExceeded(sigops));
        }
        Ok(txids)
    }

    pub fn check_transaction(&self, tx: &Transaction) -> Result<(), ValidationError> {
        if tx.vin.is_empty() {
            return Err(ValidationError::InvalidTransaction("transaction has no inputs"));
        }
        if tx.vout.is_empty() {
            return Err(ValidationError::InvalidTransaction("transaction has no outputs"));
        }
        if tx.serialized_size() > MAX_BLOCK_SIZE {
            return Err(ValidationError::InvalidTransaction("transaction too large"));
        }

        let mut total: Amount = 0;
        for output in &tx.vout {
            if !money_range(output.value) {
                return Err(ValidationError::ValueOutOfRange);
            }
            total = total
                .checked_add(output.value)
                .filter(|total| money_range(*total))
                .ok_or(ValidationError::ValueOutOfRange)?;
        }

        let mut seen = HashSet::with_capacity(tx.vin.len());
        if !tx.vin.iter().all(|input| seen.insert(input.prevout)) {
            return Err(ValidationError::DuplicateInput);
        }

        if tx.is_coinbase() {
            let len = tx.vin[0].script_sig.len();
            if !(MIN_COINBASE_SCRIPT_LEN..=MAX_COINBASE_SCRIPT_LEN).contains(&len) {
                return Err(ValidationError::InvalidTransaction("coinbase script size"));
            }
        } else if tx.vin.iter().any(|input| input.prevout.is_null()) {
            return Err(ValidationError::InvalidTransaction("input spends null outpoint"));
        }
        Ok(())
    }

    /// Checks needing the parent: finality and the coinbase height commitment.
    pub fn check_contextual(
        &self,
        block: &Block,
        prev: &BlockIndex,
        forks: &Forks,
    ) -> Result<(), ValidationError> {
        let height = prev.height + 1;
        let block_time = block.header.time;
        if !block
            .transactions
            .iter()
            .all(|tx| is_final_tx(tx, height, block_time))
        {
            return Err(ValidationError::NonFinal);
        }
        if forks.do_bip34() && block.header.version >= 2 {
            let coinbase = block
                .transactions
                .first()
                .ok_or(ValidationError::InvalidBlock("block has no coinbase"))?;
            if !coinbase_height_matches(coinbase, height) {
                return Err(ValidationError::BadCoinbaseHeight);
            }
        }
        Ok(())
    }

    /// Resolve the inputs of non-coinbase `tx` through `view` and return its
    /// fee. `spend_height` is the height of the block containing `tx`.
    pub fn check_contextual_inputs(
        &self,
        view: &UtxoView,
        tx: &Transaction,
        spend_height: u32,
    ) -> Result<Amount, ValidationError> {
        let mut value_in: Amount = 0;
        for input in &tx.vin {
            let utxo = view
                .fetch(&input.prevout)
                .ok_or(ValidationError::MissingInputs(input.prevout))?;
            if utxo.is_coinbase && spend_height.saturating_sub(utxo.height) < COINBASE_MATURITY {
                return Err(ValidationError::PrematureCoinbaseSpend(input.prevout));
            }
            if !money_range(utxo.value) {
                return Err(ValidationError::ValueOutOfRange);
            }
            value_in = value_in
                .checked_add(utxo.value)
                .filter(|total| money_range(*total))
                .ok_or(ValidationError::ValueOutOfRange)?;
        }

        let value_out = value_out(tx)?;
        if value_in < value_out {
            return Err(ValidationError::ValueInBelowValueOut {
                value_in,
                value_out,
            });
        }
        let fee = value_in - value_out;
        if !money_range(fee) {
            return Err(ValidationError::ValueOutOfRange);
        }
        Ok(fee)
    }

    pub fn check_coinbase_subsidy(
        &self,
        coinbase: &Transaction,
        fees: Amount,
        height: u32,
    ) -> Result<(), ValidationError> {
        let allowed = block_subsidy(height, self.params)
            .checked_add(fees)
            .ok_or(ValidationError::ValueOutOfRange)?;
        let claimed = value_out(coinbase)?;
        if claimed > allowed {
            return Err(ValidationError::CoinbaseTooLarge { allowed, claimed });
        }
        Ok(())
    }
}

fn value_out(tx: &Transaction) -> Result<Amount, ValidationError> {
    tx.vout.iter().try_fold(0i64, |total, output| {
        total
            .checked_add(output.value)
            .filter(|total| money_range(*total))
            .ok_or(ValidationError::ValueOutOfRange)
    })
}

/// Whether `block`'s transactions are exactly the ones its header commits
/// to. A failure on a body that does not is no verdict on the header.
pub fn commits_to_body(block: &Block) -> bool {
    matches!(
        merkle_root(&block.txids()),
        Ok((root, false)) if root == block.header.merkle_root
    )
}

/// Merkle root of `txids` and whether some level hashed two equal siblings,
/// which lets a different transaction list produce the same root.
pub fn merkle_root(txids: &[Hash256]) -> Result<(Hash256, bool), ValidationError> {
    if txids.is_empty() {
        return Err(ValidationError::InvalidBlock("merkle root of empty transaction list"));
    }
    let mut layer = txids.to_vec();
    let mut mutated = false;
    while layer.len() > 1 {
        let mut next = Vec::with_capacity(layer.len().div_ceil(2));
        for pair in layer.chunks(2) {
            let left = pair[0];
            let right = match pair.get(1) {
                Some(right) => {
                    if *right == left {
                        mutated = true;
                    }
                    *right
                }
                None => left,
            };
            let mut data = [0u8; 64];
            data[..32].copy_from_slice(&left);
            data[32..].copy_from_slice(&right);
            next.push(sha256d(&data));
        }
        layer = next;
    }
    Ok((layer[0], mutated))
}

pub fn is_final_tx(tx: &Transaction, height: u32, block_time: u32) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let basis = if tx.lock_time < LOCKTIME_THRESHOLD {
        height
    } else {
        block_time
    };
    if tx.lock_time < basis {
        return true;
    }
    tx.vin.iter().all(|input| input.sequence == SEQUENCE_FINAL)
}

fn coinbase_height_matches(tx: &Transaction, height: u32) -> bool {
    match tx.vin.first() {
        Some(input) => input.script_sig.starts_with(&script_push_int(i64::from(height))),
        None => false,
    }
}

/// Script that pushes `value` the way a miner commits the block height.
pub fn script_push_int(value: i64) -> Vec<u8> {
    const OP_0: u8 = 0x00;
    const OP_1NEGATE: u8 = 0x4f;
    const OP_1: u8 = 0x51;
    match value {
        0 => vec![OP_0],
        -1 => vec![OP_1NEGATE],
        1..=16 => vec![OP_1 + (value as u8 - 1)],
        _ => {
            let data = bitnode_script::interpreter::encode_num(value);
            let mut script = Vec::with_capacity(data.len() + 1);
            script.push(data.len() as u8);
            script.extend_from_slice(&data);
            script
        }
    }
}

/// Opcodes of `script` with their push payloads. Stops at a truncated push.
struct ScriptOps<'a> {
    script: &'a [u8],
    cursor: usize,
}

impl<'a> ScriptOps<'a> {
    fn new(script: &'a [u8]) -> Self {
        Self { script, cursor: 0 }
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.cursor.checked_add(len)?;
        let slice = self.script.get(self.cursor..end)?;
        self.cursor = end;
        Some(slice)
    }
}

impl<'a> Iterator for ScriptOps<'a> {
    type Item = (u8, Option<&'a [u8]>);

    fn next(&mut self) -> Option<Self::Item> {
        const OP_PUSHDATA1: u8 = 0x4c;
        const OP_PUSHDATA2: u8 = 0x4d;
        const OP_PUSHDATA4: u8 = 0x4e;

        let opcode = *self.script.get(self.cursor)?;
        self.cursor += 1;
        let len = match opcode {
            0x01..=0x4b => opcode as usize,
            OP_PUSHDATA1 => self.take(1)?[0] as usize,
            OP_PUSHDATA2 => {
                let bytes = self.take(2)?;
                u16::from_le_bytes([bytes[0], bytes[1]]) as usize
            }
            OP_PUSHDATA4 => {
                let bytes = self.take(4)?;
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
            }
            _ => return Some((opcode, None)),
        };
        let data = self.take(len)?;
        Some((opcode, Some(data)))
    }
}

/// Signature operations in `script`. In `accurate` mode a multisig preceded
/// by a small-integer push counts that many keys instead of twenty.
pub fn sigop_count(script: &[u8], accurate: bool) -> u32 {
    const OP_1: u8 = 0x51;
    const OP_16: u8 = 0x60;
    const OP_CHECKSIG: u8 = 0xac;
    const OP_CHECKSIGVERIFY: u8 = 0xad;
    const OP_CHECKMULTISIG: u8 = 0xae;
    const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;
    const MAX_PUBKEYS_PER_MULTISIG: u32 = 20;

    let mut count = 0u32;
    let mut last_opcode = 0xffu8;
    for (opcode, _) in ScriptOps::new(script) {
        match opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                count += if accurate && (OP_1..=OP_16).contains(&last_opcode) {
                    u32::from(last_opcode - OP_1 + 1)
                } else {
                    MAX_PUBKEYS_PER_MULTISIG
                };
            }
            _ => {}
        }
        last_opcode = opcode;
    }
    count
}

pub fn block_sigops(block: &Block) -> u32 {
    block
        .transactions
        .iter()
        .map(|tx| {
            let input_ops: u32 = tx
                .vin
                .iter()
                .map(|input| sigop_count(&input.script_sig, false))
                .sum();
            let output_ops: u32 = tx
                .vout
                .iter()
                .map(|output| sigop_count(&output.script_pubkey, false))
                .sum();
            input_ops + output_ops
        })
        .sum()
}

/// Sigops hidden in the redeem scripts of pay-to-script-hash inputs.
pub fn p2sh_sigops(view: &UtxoView, tx: &Transaction) -> u32 {
    if tx.is_coinbase() {
        return 0;
    }
    tx.vin
        .iter()
        .filter(|input| {
            view.fetch(&input.prevout)
                .is_some_and(|utxo| is_p2sh(&utxo.script_pubkey))
        })
        .filter_map(|input| {
            ScriptOps::new(&input.script_sig)
                .last()
                .and_then(|(_, data)| data)
        })
        .map(|redeem| sigop_count(redeem, true))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> [u8; 32] {
        [byte; 32]
    }

    #[test]
    fn empty_merkle_tree_is_rejected() {
        assert!(merkle_root(&[]).is_err());
        let (root, mutated) = merkle_root(&[hash(9)]).expect("single leaf");
        assert_eq!(root, hash(9));
        assert!(!mutated);
    }

    #[test]
    fn merkle_mutation_detects_equal_siblings() {
        let (_, mutated) = merkle_root(&[hash(1), hash(2), hash(3), hash(3)]).expect("root");
        assert!(mutated);
        let (_, mutated) = merkle_root(&[hash(1), hash(1), hash(2), hash(3)]).expect("root");
        assert!(mutated);
    }

    #[test]
    fn merkle_odd_duplication_is_not_mutation() {
        let (odd, mutated) = merkle_root(&[hash(1), hash(2), hash(3)]).expect("root");
        assert!(!mutated);
        let (padded, _) = merkle_root(&[hash(1), hash(2), hash(3), hash(3)]).expect("root");
        assert_eq!(odd, padded);
    }

    #[test]
    fn push_int_encodings() {
        assert_eq!(script_push_int(0), vec![0x00]);
        assert_eq!(script_push_int(16), vec![0x60]);
        assert_eq!(script_push_int(17), vec![0x01, 0x11]);
        assert_eq!(script_push_int(128), vec![0x02, 0x80, 0x00]);
        assert_eq!(script_push_int(500_000), vec![0x03, 0x20, 0xa1, 0x07]);
    }

    #[test]
    fn sigops_accurate_multisig() {
        let two_of_three = [0x52, 0x53, 0xae];
        assert_eq!(sigop_count(&two_of_three, false), 20);
        assert_eq!(sigop_count(&two_of_three, true), 3);
        assert_eq!(sigop_count(&[0xac, 0x02, 0xac, 0xac], false), 1);
    }

    mod blocks {
        use super::super::*;
        use bitnode_consensus::{consensus_params, Network};
        use bitnode_primitives::block::BlockHeader;
        use bitnode_primitives::transaction::{TxIn, TxOut};

        fn tx(prevout: OutPoint, script_sig: Vec<u8>, value: i64) -> Transaction {
            Transaction {
                version: 1,
                vin: vec![TxIn {
                    prevout,
                    script_sig,
                    sequence: SEQUENCE_FINAL,
                }],
                vout: vec![TxOut {
                    value,
                    script_pubkey: vec![0x51],
                }],
                lock_time: 0,
            }
        }

        fn block(transactions: Vec<Transaction>) -> Block {
            let txids: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();
            let (merkle_root, _) = merkle_root(&txids).expect("root");
            Block {
                header: BlockHeader {
                    version: 1,
                    prev_block: [0u8; 32],
                    merkle_root,
                    time: 0,
                    bits: 0x207f_ffff,
                    nonce: 0,
                },
                transactions,
            }
        }

        #[test]
        fn transaction_rules() {
            let params = consensus_params(Network::Regtest);
            let check = BlockCheck::new(&params);
            let spend = OutPoint::new([1u8; 32], 0);
            assert!(check.check_transaction(&tx(spend, vec![], 5)).is_ok());
            assert_eq!(
                check.check_transaction(&tx(spend, vec![], -1)),
                Err(ValidationError::ValueOutOfRange)
            );
            let mut doubled = tx(spend, vec![], 5);
            doubled.vin.push(doubled.vin[0].clone());
            assert_eq!(
                check.check_transaction(&doubled),
                Err(ValidationError::DuplicateInput)
            );
            assert!(check
                .check_transaction(&tx(OutPoint::null(), vec![0x01], 5))
                .is_err());
            assert!(check
                .check_transaction(&tx(OutPoint::null(), vec![0x01, 0x02], 5))
                .is_ok());
        }

        #[test]
        fn block_structure() {
            let params = consensus_params(Network::Regtest);
            let check = BlockCheck::new(&params);
            let coinbase = tx(OutPoint::null(), vec![0x01, 0x02], 50);
            let spend = tx(OutPoint::new([1u8; 32], 0), vec![], 5);

            let good = block(vec![coinbase.clone(), spend.clone()]);
            assert_eq!(check.check(&good).expect("valid"), good.txids());

            let mut bad_root = good.clone();
            bad_root.header.merkle_root = [0u8; 32];
            assert_eq!(check.check(&bad_root), Err(ValidationError::MerkleMismatch));

            assert!(matches!(
                check.check(&block(vec![spend.clone(), coinbase.clone()])),
                Err(ValidationError::InvalidBlock(_))
            ));
            assert_eq!(
                check.check(&block(vec![coinbase, spend.clone(), spend])),
                Err(ValidationError::DuplicateTransaction)
            );
            let empty = Block {
                header: good.header,
                transactions: Vec::new(),
            };
            assert!(check.check(&empty).is_err());
        }

        #[test]
        fn sigop_limit_and_body_commitment() {
            let params = consensus_params(Network::Regtest);
            let check = BlockCheck::new(&params);
            let coinbase = tx(OutPoint::null(), vec![0x01, 0x02], 50);
            let mut heavy = tx(OutPoint::new([1u8; 32], 0), vec![], 5);
            heavy.vout[0].script_pubkey = vec![0xac; MAX_BLOCK_SIGOPS as usize + 1];
            let over = block(vec![coinbase.clone(), heavy]);
            assert_eq!(
                check.check(&over),
                Err(ValidationError::SigopsExceeded(MAX_BLOCK_SIGOPS + 1))
            );
            assert!(commits_to_body(&over));

            let spend = tx(OutPoint::new([1u8; 32], 0), vec![], 5);
            let mut swapped = block(vec![coinbase.clone(), spend.clone()]);
            swapped.transactions[1].vout[0].value = 4;
            assert!(!commits_to_body(&swapped));

            let other = tx(OutPoint::new([2u8; 32], 0), vec![], 5);
            let mutated = block(vec![coinbase, spend, other.clone(), other]);
            assert!(!commits_to_body(&mutated));
        }

        #[test]
        fn finality_by_height_and_time() {
            let mut locked = tx(OutPoint::new([1u8; 32], 0), vec![], 5);
            locked.lock_time = 10;
            locked.vin[0].sequence = 0;
            assert!(!is_final_tx(&locked, 10, 0));
            assert!(is_final_tx(&locked, 11, 0));
            locked.lock_time = LOCKTIME_THRESHOLD + 100;
            assert!(!is_final_tx(&locked, 11, LOCKTIME_THRESHOLD + 100));
            assert!(is_final_tx(&locked, 11, LOCKTIME_THRESHOLD + 101));
            locked.vin[0].sequence = SEQUENCE_FINAL;
            assert!(is_final_tx(&locked, 11, 0));
        }

        #[test]
        fn coinbase_subsidy_limit() {
            let params = consensus_params(Network::Regtest);
            let check = BlockCheck::new(&params);
            let subsidy = block_subsidy(1, &params);
            let coinbase = tx(OutPoint::null(), vec![0x01, 0x02], subsidy + 7);
            assert!(check.check_coinbase_subsidy(&coinbase, 7, 1).is_ok());
            assert_eq!(
                check.check_coinbase_subsidy(&coinbase, 6, 1),
                Err(ValidationError::CoinbaseTooLarge {
                    allowed: subsidy + 6,
                    claimed: subsidy + 7
                })
            );
        }
    }
}
