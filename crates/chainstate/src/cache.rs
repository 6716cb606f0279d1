//! Append-only hash/height map for one linear run of headers.

use std::collections::HashMap;

use bitnode_consensus::Hash256;

#[derive(Clone, Debug, Default)]
pub struct ChainCache {
    start_height: u32,
    hashes: Vec<Hash256>,
    heights: HashMap<Hash256, u32>,
}

impl ChainCache {
    pub fn new(start_height: u32) -> Self {
        Self {
            start_height,
            hashes: Vec::new(),
            heights: HashMap::new(),
        }
    }

    /// Cache holding `hashes` at consecutive heights from `start_height`.
    pub fn from_hashes(start_height: u32, hashes: Vec<Hash256>) -> Self {
        let heights = hashes
            .iter()
            .enumerate()
            .map(|(offset, hash)| (*hash, start_height + offset as u32))
            .collect();
        Self {
            start_height,
            hashes,
            heights,
        }
    }

    /// Append `hash` at the next height; returns that height.
    pub fn push(&mut self, hash: Hash256) -> u32 {
        let height = self.start_height + self.hashes.len() as u32;
        self.hashes.push(hash);
        self.heights.insert(hash, height);
        height
    }

    pub fn start_height(&self) -> u32 {
        self.start_height
    }

    pub fn tip_height(&self) -> Option<u32> {
        self.hashes
            .len()
            .checked_sub(1)
            .map(|last| self.start_height + last as u32)
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.heights.contains_key(hash)
    }

    pub fn height_of(&self, hash: &Hash256) -> Option<u32> {
        self.heights.get(hash).copied()
    }

    pub fn hash_at(&self, height: u32) -> Option<&Hash256> {
        let offset = height.checked_sub(self.start_height)?;
        self.hashes.get(offset as usize)
    }

    /// Hashes for heights `start_height..=last`, clipped to what is held.
    pub fn hashes_through(&self, last: u32) -> &[Hash256] {
        let Some(count) = (last + 1).checked_sub(self.start_height) else {
            return &[];
        };
        &self.hashes[..(count as usize).min(self.hashes.len())]
    }

    pub fn hashes(&self) -> &[Hash256] {
        &self.hashes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(n: u8) -> Hash256 {
        [n; 32]
    }

    #[test]
    fn lookups_in_both_directions() {
        let mut cache = ChainCache::new(5);
        assert_eq!(cache.tip_height(), None);
        assert_eq!(cache.push(h(1)), 5);
        assert_eq!(cache.push(h(2)), 6);
        assert_eq!(cache.height_of(&h(2)), Some(6));
        assert_eq!(cache.hash_at(5), Some(&h(1)));
        assert_eq!(cache.hash_at(4), None);
        assert_eq!(cache.hash_at(7), None);
        assert_eq!(cache.tip_height(), Some(6));
    }

    #[test]
    fn clipped_prefix() {
        let cache = ChainCache::from_hashes(3, vec![h(1), h(2), h(3)]);
        assert_eq!(cache.hashes_through(4), &[h(1), h(2)]);
        assert_eq!(cache.hashes_through(9).len(), 3);
        assert!(cache.hashes_through(1).is_empty());
    }
}
