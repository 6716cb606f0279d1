//! A run of consecutive headers belonging to one fork.

use std::fmt;

use crate::error::ChainError;
use crate::index::BlockIndex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(pub u32);

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Covers heights `start_height..=tip.height`. Only the tip can grow.
#[derive(Clone, Debug)]
pub struct ChainSegment {
    id: SegmentId,
    start_height: u32,
    tip: BlockIndex,
}

impl ChainSegment {
    /// Segment whose first header is `first`.
    pub fn new(id: SegmentId, first: BlockIndex) -> Self {
        Self {
            id,
            start_height: first.height,
            tip: first,
        }
    }

    /// Segment restored from storage.
    pub fn restore(id: SegmentId, start_height: u32, tip: BlockIndex) -> Self {
        Self {
            id,
            start_height,
            tip,
        }
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn start_height(&self) -> u32 {
        self.start_height
    }

    pub fn tip(&self) -> &BlockIndex {
        &self.tip
    }

    pub fn contains_height(&self, height: u32) -> bool {
        (self.start_height..=self.tip.height).contains(&height)
    }

    /// Extend the tip by `index`.
    pub fn next(&mut self, index: BlockIndex) -> Result<(), ChainError> {
        if !self.tip.is_next(&index) {
            return Err(ChainError::NonContiguous {
                tip: self.tip.hash,
                candidate: index.hash,
            });
        }
        self.tip = index;
        Ok(())
    }
}
