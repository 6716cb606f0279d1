//! Sync progress along the best header chain.

use bitnode_consensus::{Forks, Hash256};

use crate::error::ChainError;
use crate::index::BlockIndex;
use crate::view::{ChainView, GuidedChainView, Locator};

/// An unspent set left behind on a chain the node no longer follows.
#[derive(Clone, Copy, Debug)]
pub struct Stranded {
    pub utxo_tip: BlockIndex,
    /// Last height the unspent set's chain shares with the best chain.
    pub fork_height: u32,
}

impl Stranded {
    pub fn error(&self) -> ChainError {
        ChainError::UtxoStranded {
            utxo_tip: self.utxo_tip.hash,
            fork_height: self.fork_height,
        }
    }
}

/// The best header chain, the last block validated on it and the
/// activation window as of that block.
#[derive(Clone, Debug)]
pub struct ChainState {
    view: GuidedChainView,
    forks: Forks,
    stranded: Option<Stranded>,
}

impl ChainState {
    pub fn new(view: GuidedChainView, forks: Forks) -> Self {
        Self {
            view,
            forks,
            stranded: None,
        }
    }

    /// State whose unspent set sits off the best chain. Blocks cannot be
    /// connected until the set is rewound.
    pub fn stranded(view: GuidedChainView, forks: Forks, stranded: Stranded) -> Self {
        Self {
            view,
            forks,
            stranded: Some(stranded),
        }
    }

    pub fn stranded_utxo(&self) -> Option<&Stranded> {
        self.stranded.as_ref()
    }

    pub fn chain(&self) -> &ChainView {
        self.view.headers()
    }

    pub fn guided(&self) -> &GuidedChainView {
        &self.view
    }

    pub fn last_validated_block(&self) -> &BlockIndex {
        self.view.block_tip()
    }

    pub fn blocks_left_to_sync(&self) -> u32 {
        self.chain().tip().height - self.last_validated_block().height
    }

    pub fn is_synced(&self) -> bool {
        self.blocks_left_to_sync() == 0
    }

    /// Activation rules for the block after the validated tip.
    pub fn forks(&self) -> &Forks {
        &self.forks
    }

    pub fn headers_locator(&self) -> Result<Locator, ChainError> {
        self.view.headers_locator([0u8; 32])
    }

    pub fn block_locator(&self) -> Result<Locator, ChainError> {
        self.view.block_locator([0u8; 32])
    }

    /// Nothing is worth fetching while the unspent set is stranded.
    pub fn blocks_to_fetch(&self, limit: usize) -> Vec<Hash256> {
        if self.stranded.is_some() {
            return Vec::new();
        }
        self.view.blocks_to_fetch(limit)
    }

    /// Record `index` as validated and slide the activation window over it.
    pub(crate) fn advance(&mut self, index: BlockIndex) -> Result<(), ChainError> {
        self.view.update_tip(index)?;
        self.forks.next(index.header.version);
        Ok(())
    }

    pub(crate) fn set_headers(&mut self, headers: ChainView) -> Result<(), ChainError> {
        self.view.set_headers(headers)
    }
}
