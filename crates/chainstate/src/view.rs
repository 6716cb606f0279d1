//! Read cursors over one segment's full ancestry.

use std::collections::HashMap;

use bitnode_consensus::Hash256;

use crate::error::ChainError;
use crate::index::BlockIndex;
use crate::segment::SegmentId;

/// Hashes collected before the step starts doubling, and the number added
/// between each doubling afterwards.
const LOCATOR_DENSE_COUNT: usize = 10;

/// Sparse list of ancestor hashes, newest first, ending at genesis.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Locator {
    pub hashes: Vec<Hash256>,
    /// All zero means "no stop".
    pub stop: Hash256,
}

#[derive(Clone, Debug)]
pub struct ChainView {
    segment: SegmentId,
    history: Vec<SegmentId>,
    tip: BlockIndex,
    hashes: Vec<Hash256>,
    heights: HashMap<Hash256, u32>,
}

impl ChainView {
    pub(crate) fn new(
        segment: SegmentId,
        history: Vec<SegmentId>,
        tip: BlockIndex,
        hashes: Vec<Hash256>,
    ) -> Result<Self, ChainError> {
        if hashes.len() != tip.height as usize + 1 || hashes.last() != Some(&tip.hash) {
            return Err(ChainError::CorruptIndex("segment history has a height gap"));
        }
        let heights = hashes
            .iter()
            .enumerate()
            .map(|(height, hash)| (*hash, height as u32))
            .collect();
        Ok(Self {
            segment,
            history,
            tip,
            hashes,
            heights,
        })
    }

    pub fn segment(&self) -> SegmentId {
        self.segment
    }

    /// Segments from the root to this view's segment.
    pub fn history(&self) -> &[SegmentId] {
        &self.history
    }

    pub fn tip(&self) -> &BlockIndex {
        &self.tip
    }

    pub fn count(&self) -> usize {
        self.hashes.len()
    }

    pub fn hash_at(&self, height: u32) -> Option<Hash256> {
        self.hashes.get(height as usize).copied()
    }

    pub fn height_of(&self, hash: &Hash256) -> Option<u32> {
        self.heights.get(hash).copied()
    }

    pub fn contains_hash(&self, hash: &Hash256) -> bool {
        self.heights.contains_key(hash)
    }

    /// Locator starting at `height`: the first eleven heights are
    /// consecutive, then the gap doubles after every further ten entries.
    pub fn locator(&self, height: u32, stop: Hash256) -> Result<Locator, ChainError> {
        if height > self.tip.height {
            return Err(ChainError::CorruptIndex("locator height above tip"));
        }
        let mut hashes = Vec::new();
        let mut height = height;
        let mut step = 1u32;
        loop {
            hashes.push(self.hashes[height as usize]);
            if height == 0 {
                break;
            }
            if hashes.len() > LOCATOR_DENSE_COUNT && hashes.len() % LOCATOR_DENSE_COUNT == 1 {
                step = step.saturating_mul(2);
            }
            height = height.saturating_sub(step);
        }
        Ok(Locator { hashes, stop })
    }

    /// Hashes at `from..=to` (clipped to the tip).
    pub fn range(&self, from: u32, to: u32) -> &[Hash256] {
        let end = (to as usize + 1).min(self.hashes.len());
        let start = (from as usize).min(end);
        &self.hashes[start..end]
    }
}

/// A headers view plus the separately advancing tip of fully validated blocks.
#[derive(Clone, Debug)]
pub struct GuidedChainView {
    headers: ChainView,
    block_tip: BlockIndex,
}

impl GuidedChainView {
    pub fn new(headers: ChainView, block_tip: BlockIndex) -> Result<Self, ChainError> {
        if headers.hash_at(block_tip.height) != Some(block_tip.hash) {
            return Err(ChainError::NonContiguous {
                tip: headers.tip().hash,
                candidate: block_tip.hash,
            });
        }
        Ok(Self { headers, block_tip })
    }

    pub fn headers(&self) -> &ChainView {
        &self.headers
    }

    pub fn block_tip(&self) -> &BlockIndex {
        &self.block_tip
    }

    pub fn headers_locator(&self, stop: Hash256) -> Result<Locator, ChainError> {
        self.headers.locator(self.headers.tip().height, stop)
    }

    pub fn block_locator(&self, stop: Hash256) -> Result<Locator, ChainError> {
        self.headers.locator(self.block_tip.height, stop)
    }

    /// Advance the validated cursor by exactly one block on this chain.
    pub fn update_tip(&mut self, index: BlockIndex) -> Result<(), ChainError> {
        if !self.block_tip.is_next(&index) || !self.headers.contains_hash(&index.hash) {
            return Err(ChainError::NonContiguous {
                tip: self.block_tip.hash,
                candidate: index.hash,
            });
        }
        self.block_tip = index;
        Ok(())
    }

    /// Swap in a newer headers view of the same chain.
    pub fn set_headers(&mut self, headers: ChainView) -> Result<(), ChainError> {
        if headers.hash_at(self.block_tip.height) != Some(self.block_tip.hash) {
            return Err(ChainError::NonContiguous {
                tip: headers.tip().hash,
                candidate: self.block_tip.hash,
            });
        }
        self.headers = headers;
        Ok(())
    }

    /// Up to `limit` header hashes directly above the validated tip.
    pub fn blocks_to_fetch(&self, limit: usize) -> Vec<Hash256> {
        let from = self.block_tip.height + 1;
        let to = from.saturating_add(limit as u32).saturating_sub(1);
        if limit == 0 {
            return Vec::new();
        }
        self.headers.range(from, to).to_vec()
    }
}
