//! The chain service: segment tree, database and sync state behind one owner.

use std::sync::Arc;

use bitnode_consensus::{hash256_to_hex, ConsensusParams, Forks, Hash256};
use bitnode_log::{log_error, log_info, log_warn};
use bitnode_primitives::block::BlockHeader;
use bitnode_storage::KeyValueStore;

use crate::container::ChainContainer;
use crate::db::{ChainDb, TxRecord};
use crate::error::ChainError;
use crate::headers::{accept_batch, BatchOutcome, HeaderCheck};
use crate::index::BlockIndex;
use crate::script_validation::ScriptValidation;
use crate::state::{ChainState, Stranded};
use crate::validation::ValidationError;
use crate::view::{ChainView, GuidedChainView};

pub struct Chain<S> {
    pub(crate) params: ConsensusParams,
    pub(crate) db: ChainDb<S>,
    pub(crate) container: ChainContainer,
    pub(crate) state: ChainState,
    pub(crate) scripts: ScriptValidation,
}

impl<S: KeyValueStore> Chain<S> {
    /// Load the segment tree from `store`, seeding it with genesis when empty.
    pub fn open(
        params: ConsensusParams,
        store: Arc<S>,
        scripts: ScriptValidation,
    ) -> Result<Self, ChainError> {
        let genesis = BlockIndex::genesis(&params).map_err(ValidationError::from)?;
        let db = ChainDb::new(store);
        if db.initialize(&genesis)? {
            log_info!("created chain at genesis {}", hash256_to_hex(&genesis.hash));
        }
        let mut container = ChainContainer::restore(db.fetch_chain_segments()?)?;
        for hash in db.fetch_failed()? {
            container.mark_failed(hash);
        }
        let state = load_state(&params, &db, &mut container)?;
        log_info!(
            "loaded {} segments, header tip {} at height {}, validated height {}",
            container.len(),
            hash256_to_hex(&state.chain().tip().hash),
            state.chain().tip().height,
            state.last_validated_block().height
        );
        Ok(Self {
            params,
            db,
            container,
            state,
            scripts,
        })
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn db(&self) -> &ChainDb<S> {
        &self.db
    }

    pub fn container(&self) -> &ChainContainer {
        &self.container
    }

    pub fn state(&self) -> &ChainState {
        &self.state
    }

    pub fn scripts(&self) -> &ScriptValidation {
        &self.scripts
    }

    pub fn scripts_mut(&mut self) -> &mut ScriptValidation {
        &mut self.scripts
    }

    /// Validate and store a run of headers, then follow the best chain.
    pub fn accept_headers(
        &mut self,
        headers: &[BlockHeader],
        now: i64,
    ) -> Result<BatchOutcome, ChainError> {
        let check = HeaderCheck::new(&self.params);
        let outcome = accept_batch(&self.db, &mut self.container, &check, headers, now)?;
        if outcome.best_changed {
            self.state = load_state(&self.params, &self.db, &mut self.container)?;
        } else if outcome.segment == self.state.chain().segment() && outcome.accepted > 0 {
            let view = self.container.view(outcome.segment)?;
            self.state.set_headers(view)?;
        }
        Ok(outcome)
    }

    /// Up to `limit` blocks to download above the validated tip, stopping
    /// short of any block already known to be invalid.
    pub fn blocks_to_fetch(&self, limit: usize) -> Vec<Hash256> {
        self.state
            .blocks_to_fetch(limit)
            .into_iter()
            .take_while(|hash| !self.container.is_failed(hash))
            .collect()
    }

    /// Persist `hash` as invalid and move off any chain running through it.
    pub(crate) fn reject_block(&mut self, hash: &Hash256) -> Result<(), ChainError> {
        if self.container.is_failed(hash) || self.container.locate(hash).is_none() {
            return Ok(());
        }
        self.db.transaction(|batch| {
            self.db.insert_failed(batch, hash);
            Ok(())
        })?;
        self.container.mark_failed(*hash);
        if self.container.best() != Some(self.state.chain().segment()) {
            self.state = load_state(&self.params, &self.db, &mut self.container)?;
            log_info!(
                "best header chain moved to {} at height {}",
                hash256_to_hex(&self.state.chain().tip().hash),
                self.state.chain().tip().height
            );
        }
        Ok(())
    }

    pub fn header(&self, hash: &Hash256) -> Result<BlockIndex, ChainError> {
        self.db.fetch_index(hash)
    }

    /// Hash at `height` on the best header chain.
    pub fn hash_at(&self, height: u32) -> Option<Hash256> {
        self.state.chain().hash_at(height)
    }

    pub fn transaction(&self, txid: &Hash256) -> Result<Option<TxRecord>, ChainError> {
        self.db.fetch_transaction(txid)
    }
}

/// Sync state for the best segment. The validated cursor is the higher of
/// the segment's own validated tip and the unspent-set tip, when the latter
/// lies on the segment's chain. When it does not, the state is stranded.
fn load_state<S: KeyValueStore>(
    params: &ConsensusParams,
    db: &ChainDb<S>,
    container: &mut ChainContainer,
) -> Result<ChainState, ChainError> {
    let best = container
        .best()
        .ok_or(ChainError::CorruptIndex("no segments tracked"))?;
    let view = container.view(best)?;
    let mut block_tip = *container.block_tip(best)?;
    let utxo_tip = db.fetch_index(&db.utxo_tip()?)?;
    let on_chain = view.hash_at(utxo_tip.height) == Some(utxo_tip.hash);
    if on_chain && utxo_tip.height > block_tip.height {
        container.set_block_tip(best, utxo_tip)?;
        block_tip = utxo_tip;
    }
    let mut forks = Forks::new(params);
    forks.load(db.find_super_majority_info_by_hash(&block_tip.hash, params.majority_window)?);
    let guided = GuidedChainView::new(view, block_tip)?;
    if on_chain {
        if block_tip.hash != utxo_tip.hash {
            log_warn!(
                "best chain validated tip {} differs from unspent set tip {}",
                hash256_to_hex(&block_tip.hash),
                hash256_to_hex(&utxo_tip.hash)
            );
        }
        return Ok(ChainState::new(guided, forks));
    }
    let stranded = Stranded {
        utxo_tip,
        fork_height: fork_height(db, guided.headers(), utxo_tip)?,
    };
    log_error!("{}", stranded.error());
    Ok(ChainState::stranded(guided, forks, stranded))
}

/// Highest height at which the chain ending in `tip` meets `view`.
fn fork_height<S: KeyValueStore>(
    db: &ChainDb<S>,
    view: &ChainView,
    tip: BlockIndex,
) -> Result<u32, ChainError> {
    let mut cursor = tip;
    while view.hash_at(cursor.height) != Some(cursor.hash) {
        if cursor.height == 0 {
            return Err(ChainError::CorruptIndex("chains share no genesis"));
        }
        cursor = db.fetch_index(&cursor.header.prev_block)?;
    }
    Ok(cursor.height)
}
