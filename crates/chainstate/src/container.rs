//! The forest of tracked segments.
//!
//! Segments live in an arena keyed by [`SegmentId`]; hash maps, parent links
//! and validated tips are side tables keyed the same way. A fork only stores
//! its own headers, so history is rebuilt by walking parent links.

use std::collections::{BTreeMap, HashMap};

use bitnode_consensus::{hash256_to_hex, Hash256};
use bitnode_log::{log_debug, log_info};

use crate::cache::ChainCache;
use crate::error::ChainError;
use crate::index::BlockIndex;
use crate::segment::{ChainSegment, SegmentId};
use crate::view::{ChainView, GuidedChainView};

/// A segment as persisted by the chain database.
#[derive(Clone, Debug)]
pub struct StoredSegment {
    pub id: SegmentId,
    pub parent: Option<SegmentId>,
    pub start_height: u32,
    pub hashes: Vec<Hash256>,
    pub tip: BlockIndex,
    pub block_tip: BlockIndex,
}

#[derive(Debug)]
pub struct ChainContainer {
    segments: BTreeMap<SegmentId, ChainSegment>,
    caches: HashMap<SegmentId, ChainCache>,
    parent_of: HashMap<SegmentId, SegmentId>,
    block_tips: HashMap<SegmentId, BlockIndex>,
    /// Blocks whose bodies failed validation, with their locations.
    failed: HashMap<Hash256, (SegmentId, u32)>,
    next_id: u32,
}

impl ChainContainer {
    /// Container with a single root segment holding `genesis`.
    pub fn new(genesis: BlockIndex) -> Self {
        let root = SegmentId(0);
        let mut cache = ChainCache::new(0);
        cache.push(genesis.hash);
        Self {
            segments: BTreeMap::from([(root, ChainSegment::new(root, genesis))]),
            caches: HashMap::from([(root, cache)]),
            parent_of: HashMap::new(),
            block_tips: HashMap::from([(root, genesis)]),
            failed: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn restore(stored: Vec<StoredSegment>) -> Result<Self, ChainError> {
        let mut container = Self {
            segments: BTreeMap::new(),
            caches: HashMap::new(),
            parent_of: HashMap::new(),
            block_tips: HashMap::new(),
            failed: HashMap::new(),
            next_id: 0,
        };
        for segment in stored {
            let expected = (segment.tip.height + 1).checked_sub(segment.start_height);
            if expected != Some(segment.hashes.len() as u32)
                || segment.hashes.last() != Some(&segment.tip.hash)
            {
                return Err(ChainError::CorruptIndex("stored segment does not reach its tip"));
            }
            if let Some(parent) = segment.parent {
                container.parent_of.insert(segment.id, parent);
            }
            container.next_id = container.next_id.max(segment.id.0 + 1);
            container.caches.insert(
                segment.id,
                ChainCache::from_hashes(segment.start_height, segment.hashes),
            );
            container.block_tips.insert(segment.id, segment.block_tip);
            container.segments.insert(
                segment.id,
                ChainSegment::restore(segment.id, segment.start_height, segment.tip),
            );
        }
        let roots = container
            .segments
            .keys()
            .filter(|id| !container.parent_of.contains_key(id))
            .count();
        if roots != 1 {
            return Err(ChainError::CorruptIndex("stored segments must share one root"));
        }
        for parent in container.parent_of.values() {
            if !container.segments.contains_key(parent) {
                return Err(ChainError::UnknownSegment(*parent));
            }
        }
        Ok(container)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> impl Iterator<Item = &ChainSegment> {
        self.segments.values()
    }

    pub fn segment(&self, id: SegmentId) -> Result<&ChainSegment, ChainError> {
        self.segments.get(&id).ok_or(ChainError::UnknownSegment(id))
    }

    /// Id the next [`ChainContainer::add_segment`] call will assign.
    pub fn next_segment_id(&self) -> SegmentId {
        SegmentId(self.next_id)
    }

    /// Track a new fork off `parent` whose first header is `first`.
    ///
    /// `block_tip` is the validated tip the new branch inherits: the parent's
    /// validated tip when it lies at or below the fork point, otherwise the
    /// fork point itself.
    pub fn add_segment(
        &mut self,
        parent: SegmentId,
        first: BlockIndex,
        block_tip: BlockIndex,
    ) -> Result<SegmentId, ChainError> {
        let fork_height = first
            .height
            .checked_sub(1)
            .ok_or(ChainError::CorruptIndex("fork cannot start at genesis"))?;
        let parent_view = self.view(parent)?;
        if parent_view.hash_at(fork_height) != Some(first.header.prev_block) {
            return Err(ChainError::NonContiguous {
                tip: parent_view.tip().hash,
                candidate: first.hash,
            });
        }
        if parent_view.hash_at(block_tip.height) != Some(block_tip.hash)
            || block_tip.height > fork_height
        {
            return Err(ChainError::CorruptIndex("fork inherits a foreign validated tip"));
        }

        let id = self.next_segment_id();
        self.next_id += 1;
        let mut cache = ChainCache::new(first.height);
        cache.push(first.hash);
        self.caches.insert(id, cache);
        self.parent_of.insert(id, parent);
        self.block_tips.insert(id, block_tip);
        self.segments.insert(id, ChainSegment::new(id, first));
        log_debug!(
            "tracking segment {id} forked from {parent} at height {}",
            first.height
        );
        Ok(id)
    }

    /// Extend the headers tip of `id`.
    pub fn update_segment(&mut self, id: SegmentId, index: BlockIndex) -> Result<(), ChainError> {
        let segment = self.segments.get_mut(&id).ok_or(ChainError::UnknownSegment(id))?;
        segment.next(index)?;
        self.caches
            .get_mut(&id)
            .ok_or(ChainError::UnknownSegment(id))?
            .push(index.hash);
        Ok(())
    }

    /// Extend the validated tip of `id`.
    pub fn update_segment_block(
        &mut self,
        id: SegmentId,
        index: BlockIndex,
    ) -> Result<(), ChainError> {
        let current = self.block_tips.get(&id).ok_or(ChainError::UnknownSegment(id))?;
        if !current.is_next(&index) {
            return Err(ChainError::NonContiguous {
                tip: current.hash,
                candidate: index.hash,
            });
        }
        self.block_tips.insert(id, index);
        Ok(())
    }

    /// Move the validated tip of `id` to any index on its chain.
    pub fn set_block_tip(&mut self, id: SegmentId, index: BlockIndex) -> Result<(), ChainError> {
        let view = self.view(id)?;
        if view.hash_at(index.height) != Some(index.hash) {
            return Err(ChainError::NonContiguous {
                tip: view.tip().hash,
                candidate: index.hash,
            });
        }
        self.block_tips.insert(id, index);
        Ok(())
    }

    pub fn block_tip(&self, id: SegmentId) -> Result<&BlockIndex, ChainError> {
        self.block_tips.get(&id).ok_or(ChainError::UnknownSegment(id))
    }

    pub fn parent(&self, id: SegmentId) -> Result<SegmentId, ChainError> {
        if !self.segments.contains_key(&id) {
            return Err(ChainError::UnknownSegment(id));
        }
        self.parent_of
            .get(&id)
            .copied()
            .ok_or(ChainError::NoPreviousSegment(id))
    }

    /// Segments from the root down to `id`.
    pub fn get_history(&self, id: SegmentId) -> Result<Vec<SegmentId>, ChainError> {
        let mut history = vec![id];
        let mut current = self.segment(id)?.id();
        while let Some(parent) = self.parent_of.get(&current) {
            if history.len() > self.segments.len() {
                return Err(ChainError::CorruptIndex("segment parent links form a cycle"));
            }
            history.push(*parent);
            current = *parent;
        }
        history.reverse();
        Ok(history)
    }

    /// Record `hash` as a block that failed validation. Every segment whose
    /// chain runs through it stops competing for best. Unknown hashes are
    /// ignored.
    pub fn mark_failed(&mut self, hash: Hash256) -> bool {
        match self.locate(&hash) {
            Some(location) => {
                if self.failed.insert(hash, location).is_none() {
                    log_info!(
                        "marked block {} at height {} failed",
                        hash256_to_hex(&hash),
                        location.1
                    );
                }
                true
            }
            None => false,
        }
    }

    pub fn is_failed(&self, hash: &Hash256) -> bool {
        self.failed.contains_key(hash)
    }

    pub fn failed(&self) -> impl Iterator<Item = &Hash256> {
        self.failed.keys()
    }

    /// Whether the chain ending at the tip of `id` contains a failed block.
    pub fn chain_failed(&self, id: SegmentId) -> Result<bool, ChainError> {
        if self.failed.is_empty() {
            return Ok(false);
        }
        let history = self.get_history(id)?;
        for (owner, height) in self.failed.values() {
            let Some(position) = history.iter().position(|segment| segment == owner) else {
                continue;
            };
            let covered = match history.get(position + 1) {
                Some(child) => *height < self.segment(*child)?.start_height(),
                None => true,
            };
            if covered {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Segment with the most cumulative work among chains free of failed
    /// blocks. Equal work goes to the segment tracked first. When every
    /// chain runs through a failed block the heaviest one is still
    /// returned, so the node keeps a chain to serve.
    pub fn best(&self) -> Option<SegmentId> {
        let mut best: Option<&ChainSegment> = None;
        let mut fallback: Option<&ChainSegment> = None;
        for segment in self.segments.values() {
            let heavier = |current: Option<&ChainSegment>| {
                current.map_or(true, |current| segment.tip().work > current.tip().work)
            };
            if heavier(fallback) {
                fallback = Some(segment);
            }
            if heavier(best) && !self.chain_failed(segment.id()).unwrap_or(true) {
                best = Some(segment);
            }
        }
        best.or(fallback).map(ChainSegment::id)
    }

    pub fn best_view(&self) -> Result<ChainView, ChainError> {
        let best = self
            .best()
            .ok_or(ChainError::CorruptIndex("no segments tracked"))?;
        self.view(best)
    }

    pub fn view(&self, id: SegmentId) -> Result<ChainView, ChainError> {
        let history = self.get_history(id)?;
        let tip = *self.segment(id)?.tip();
        let mut hashes = Vec::with_capacity(tip.height as usize + 1);
        for (position, segment_id) in history.iter().enumerate() {
            let cache = self
                .caches
                .get(segment_id)
                .ok_or(ChainError::UnknownSegment(*segment_id))?;
            let last = match history.get(position + 1) {
                Some(child) => self
                    .segment(*child)?
                    .start_height()
                    .checked_sub(1)
                    .ok_or(ChainError::CorruptIndex("child segment starts at genesis"))?,
                None => tip.height,
            };
            if cache.start_height() as usize != hashes.len() {
                return Err(ChainError::CorruptIndex("segment history has a height gap"));
            }
            hashes.extend_from_slice(cache.hashes_through(last));
        }
        ChainView::new(id, history, tip, hashes)
    }

    pub fn guided_view(&self, id: SegmentId) -> Result<GuidedChainView, ChainError> {
        GuidedChainView::new(self.view(id)?, *self.block_tip(id)?)
    }

    pub fn segment_with_tip(&self, hash: &Hash256) -> Option<SegmentId> {
        self.segments
            .values()
            .find(|segment| &segment.tip().hash == hash)
            .map(ChainSegment::id)
    }

    /// Segment that stores `hash` itself, with its height.
    pub fn locate(&self, hash: &Hash256) -> Option<(SegmentId, u32)> {
        self.segments.keys().find_map(|id| {
            self.caches
                .get(id)
                .and_then(|cache| cache.height_of(hash))
                .map(|height| (*id, height))
        })
    }
}
