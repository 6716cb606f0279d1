//! Full block acceptance on top of the validated tip.
//!
//! Acceptance is split around the script barrier: [`Chain::prepare_block`]
//! runs every check that needs chain state and returns the pending script
//! jobs, [`Chain::commit_block`] persists the block once they resolved.
//! Nothing is written before the commit.

use std::sync::Arc;

use bitnode_consensus::constants::MAX_BLOCK_SIGOPS;
use bitnode_consensus::money::{money_range, Amount};
use bitnode_consensus::{hash256_to_hex, Hash256};
use bitnode_log::{log_info, log_warn};
use bitnode_primitives::block::Block;
use bitnode_primitives::outpoint::OutPoint;
use bitnode_primitives::transaction::Transaction;
use bitnode_storage::KeyValueStore;

use crate::chain::Chain;
use crate::error::ChainError;
use crate::index::BlockIndex;
use crate::script_validation::ScriptBatch;
use crate::segment::SegmentId;
use crate::utxo::{InputPartition, UtxoView};
use crate::validation::{
    block_sigops, commits_to_body, p2sh_sigops, BlockCheck, ValidationError,
};

/// A block that passed every check except its pending script jobs.
pub struct PreparedBlock {
    index: BlockIndex,
    segment: SegmentId,
    transactions: Vec<(Hash256, Arc<Transaction>)>,
    partition: InputPartition,
    fees: Amount,
}

impl PreparedBlock {
    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    pub fn fees(&self) -> Amount {
        self.fees
    }
}

#[derive(Clone, Debug)]
pub struct BlockOutcome {
    pub index: BlockIndex,
    pub segment: SegmentId,
    pub fees: Amount,
    pub transactions: usize,
    pub blocks_left: u32,
}

impl<S: KeyValueStore> Chain<S> {
    /// Validate `block` against the validated tip, then wait for its scripts
    /// and commit it.
    pub fn accept_block(&mut self, block: &Block) -> Result<BlockOutcome, ChainError> {
        let (prepared, scripts) = self.prepare_block(block)?;
        let verified = scripts.wait()?;
        self.commit_block(prepared, verified)
    }

    pub fn prepare_block(
        &mut self,
        block: &Block,
    ) -> Result<(PreparedBlock, ScriptBatch), ChainError> {
        let hash = block.header.hash();
        let result = self.prepare_inner(block, &hash);
        if let Err(ChainError::Validation(err)) = &result {
            log_warn!("rejecting block {}: {err}", hash256_to_hex(&hash));
            if commits_to_body(block) {
                self.reject_block(&hash)?;
            }
        }
        result
    }

    fn prepare_inner(
        &mut self,
        block: &Block,
        hash: &Hash256,
    ) -> Result<(PreparedBlock, ScriptBatch), ChainError> {
        let index = self.db.fetch_index(hash)?;
        if self.container.is_failed(hash) {
            return Err(ValidationError::InvalidBlock("block previously failed validation").into());
        }
        if let Some(stranded) = self.state.stranded_utxo() {
            return Err(stranded.error());
        }
        let tip = *self.state.last_validated_block();
        if !tip.is_next(&index) || !self.state.chain().contains_hash(hash) {
            return Err(ChainError::NonContiguous {
                tip: tip.hash,
                candidate: *hash,
            });
        }
        let utxo_tip = self.db.utxo_tip()?;
        if utxo_tip != tip.hash {
            return Err(ChainError::UtxoTipMismatch {
                expected: tip.hash,
                found: utxo_tip,
            });
        }

        let check = BlockCheck::new(&self.params);
        let txids = check.check(block)?;
        let forks = self.state.forks();
        check.check_contextual(block, &tip, forks)?;

        let height = index.height;
        let partition = InputPartition::new(block, &txids, height)?;
        let view = UtxoView::build(&partition, |outpoints| {
            self.db.fetch_utxo_list(&tip.hash, outpoints)
        })?;

        if forks.do_bip30(height, hash) && !forks.do_bip34() {
            for (tx, txid) in block.transactions.iter().zip(&txids) {
                for vout in 0..tx.vout.len() as u32 {
                    let outpoint = OutPoint::new(*txid, vout);
                    if self.db.utxo(&outpoint)?.is_some() {
                        return Err(ValidationError::OverwritesUnspent(outpoint).into());
                    }
                }
            }
        }

        let block_time = block.header.time;
        let count_p2sh = forks.do_p2sh(block_time);
        let mut sigops = block_sigops(block);
        let mut fees: Amount = 0;
        for tx in &block.transactions[1..] {
            let fee = check.check_contextual_inputs(&view, tx, height)?;
            fees = fees
                .checked_add(fee)
                .filter(|total| money_range(*total))
                .ok_or(ValidationError::ValueOutOfRange)?;
            if count_p2sh {
                sigops = sigops.saturating_add(p2sh_sigops(&view, tx));
            }
        }
        if sigops > MAX_BLOCK_SIGOPS {
            return Err(ValidationError::SigopsExceeded(sigops).into());
        }
        check.check_coinbase_subsidy(&block.transactions[0], fees, height)?;

        let flags = forks.flags(block_time);
        let transactions: Vec<(Hash256, Arc<Transaction>)> = txids
            .into_iter()
            .zip(block.transactions.iter().cloned().map(Arc::new))
            .collect();
        let queued = transactions[1..]
            .iter()
            .try_for_each(|(_, tx)| self.scripts.queue(&view, tx, flags));
        let scripts = self.scripts.take();
        queued?;

        let prepared = PreparedBlock {
            index,
            segment: self.state.chain().segment(),
            transactions,
            partition,
            fees,
        };
        Ok((prepared, scripts))
    }

    /// Persist a prepared block whose script jobs resolved to `verified`.
    pub fn commit_block(
        &mut self,
        prepared: PreparedBlock,
        verified: bool,
    ) -> Result<BlockOutcome, ChainError> {
        let index = prepared.index;
        if !verified {
            log_warn!(
                "rejecting block {}: script verification failed",
                hash256_to_hex(&index.hash)
            );
            self.reject_block(&index.hash)?;
            return Err(ValidationError::ScriptCheckFailed.into());
        }
        let tip = *self.state.last_validated_block();
        if !tip.is_next(&index) || self.state.chain().segment() != prepared.segment {
            return Err(ChainError::NonContiguous {
                tip: tip.hash,
                candidate: index.hash,
            });
        }

        let segment = prepared.segment;
        self.db.transaction(|batch| {
            self.db.update_utxo_set(
                batch,
                &prepared.partition.external,
                &prepared.partition.created,
                &index.hash,
            );
            for (txid, tx) in &prepared.transactions {
                self.db.index_transaction(batch, &index.hash, txid, tx);
            }
            self.db.set_segment_block_tip(batch, segment, &index.hash)
        })?;
        self.container.update_segment_block(segment, index)?;
        self.state.advance(index)?;

        let outcome = BlockOutcome {
            index,
            segment,
            fees: prepared.fees,
            transactions: prepared.transactions.len(),
            blocks_left: self.state.blocks_left_to_sync(),
        };
        log_info!(
            "connected block {} at height {} ({} txs, {} fees, {} left)",
            hash256_to_hex(&index.hash),
            index.height,
            outcome.transactions,
            outcome.fees,
            outcome.blocks_left
        );
        Ok(outcome)
    }
}
