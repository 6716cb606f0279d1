//! Soft-fork activation driven by a rolling window of block versions.
//!
//! A [`Forks`] value describes the rules for the block that follows the last
//! version pushed through [`Forks::next`]. Feeding blocks out of order or
//! skipping one leaves the window describing some other chain, so callers
//! advance it exactly once per accepted block, in height order.

use std::collections::VecDeque;

use crate::constants::{
    MIN_BLOCK_VERSION, SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY, SCRIPT_VERIFY_DERSIG,
    SCRIPT_VERIFY_NONE, SCRIPT_VERIFY_P2SH,
};
use crate::params::{Checkpoint, ConsensusParams};
use crate::Hash256;

/// Versions whose supermajority enables a rule: 2 (BIP34 coinbase height),
/// 3 (BIP66 strict DER) and 4 (BIP65 CHECKLOCKTIMEVERIFY).
const GATED_VERSIONS: [i32; 3] = [2, 3, 4];

/// Blocks exempted from the duplicate-output rule.
#[derive(Clone, Debug, Default)]
pub struct Bip30Exceptions {
    entries: Vec<Checkpoint>,
}

impl Bip30Exceptions {
    pub fn new(entries: Vec<Checkpoint>) -> Self {
        Self { entries }
    }

    pub fn contains(&self, height: u32, hash: &Hash256) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.height == height && &entry.hash == hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `ceil(window * percent / 100)`: the count that strictly exceeds the
/// fractional threshold for small windows and matches it for round ones.
pub fn scaled_threshold(window: usize, percent: usize) -> usize {
    (window * percent).div_ceil(100)
}

#[derive(Clone, Debug)]
pub struct Forks {
    size: usize,
    required: usize,
    versions: VecDeque<i32>,
    at_least: [usize; GATED_VERSIONS.len()],
    bip16_switch_time: u32,
    bip30: Bip30Exceptions,
}

impl Forks {
    /// Empty window sized from `params`.
    pub fn new(params: &ConsensusParams) -> Self {
        Self::with_window(
            params.majority_window,
            params.majority_reject_block_outdated,
            params.bip16_switch_time,
            Bip30Exceptions::new(params.bip30_exceptions.clone()),
        )
    }

    pub fn with_window(
        size: usize,
        required: usize,
        bip16_switch_time: u32,
        bip30: Bip30Exceptions,
    ) -> Self {
        Self {
            size: size.max(1),
            required: required.max(1),
            versions: VecDeque::with_capacity(size),
            at_least: [0; GATED_VERSIONS.len()],
            bip16_switch_time,
            bip30,
        }
    }

    /// Rebuild the window from ancestor versions, oldest first. Only the
    /// newest `size` entries are kept.
    pub fn load<I: IntoIterator<Item = i32>>(&mut self, versions: I) {
        self.versions.clear();
        self.at_least = [0; GATED_VERSIONS.len()];
        for version in versions {
            self.next(version);
        }
    }

    /// Slide the window forward by one accepted block.
    pub fn next(&mut self, version: i32) {
        if self.versions.len() == self.size {
            if let Some(oldest) = self.versions.pop_front() {
                self.count(oldest, false);
            }
        }
        self.versions.push_back(version);
        self.count(version, true);
    }

    fn count(&mut self, version: i32, add: bool) {
        for (slot, gate) in self.at_least.iter_mut().zip(GATED_VERSIONS) {
            if version >= gate {
                if add {
                    *slot += 1;
                } else {
                    *slot -= 1;
                }
            }
        }
    }

    pub fn window_len(&self) -> usize {
        self.versions.len()
    }

    pub fn required(&self) -> usize {
        self.required
    }

    /// Highest gated version held by a supermajority of the window, or the
    /// network minimum when none is.
    pub fn majority_version(&self) -> i32 {
        GATED_VERSIONS
            .iter()
            .zip(self.at_least)
            .rev()
            .find(|(_, count)| *count >= self.required)
            .map(|(version, _)| *version)
            .unwrap_or(MIN_BLOCK_VERSION)
    }

    /// Whether a block at `height` with `hash` must not overwrite unspent outputs.
    pub fn do_bip30(&self, height: u32, hash: &Hash256) -> bool {
        !self.bip30.contains(height, hash)
    }

    pub fn do_p2sh(&self, block_time: u32) -> bool {
        block_time >= self.bip16_switch_time
    }

    pub fn do_bip34(&self) -> bool {
        self.majority_version() >= 2
    }

    pub fn do_bip66(&self) -> bool {
        self.majority_version() >= 3
    }

    pub fn do_bip65(&self) -> bool {
        self.majority_version() >= 4
    }

    /// Script verification flags for a block stamped `block_time`.
    pub fn flags(&self, block_time: u32) -> u32 {
        let mut flags = SCRIPT_VERIFY_NONE;
        if self.do_p2sh(block_time) {
            flags |= SCRIPT_VERIFY_P2SH;
        }
        if self.do_bip66() {
            flags |= SCRIPT_VERIFY_DERSIG;
        }
        if self.do_bip65() {
            flags |= SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY;
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_window() -> Forks {
        Forks::with_window(10, scaled_threshold(10, 95), 100, Bip30Exceptions::default())
    }

    #[test]
    fn threshold_scales_with_window() {
        assert_eq!(scaled_threshold(10, 95), 10);
        assert_eq!(scaled_threshold(1_000, 95), 950);
        assert_eq!(scaled_threshold(100, 75), 75);
    }

    #[test]
    fn bip34_needs_ten_of_ten() {
        let mut forks = small_window();
        forks.next(1);
        for _ in 0..9 {
            forks.next(2);
        }
        assert_eq!(forks.window_len(), 10);
        assert!(!forks.do_bip34());
        assert_eq!(forks.majority_version(), MIN_BLOCK_VERSION);

        // Tenth upgraded header pushes the version-1 block out of the window.
        forks.next(2);
        assert!(forks.do_bip34());
        assert!(!forks.do_bip66());
        assert_eq!(forks.majority_version(), 2);
    }

    #[test]
    fn sliding_back_deactivates() {
        let mut forks = small_window();
        forks.load(std::iter::repeat(4).take(10));
        assert_eq!(forks.majority_version(), 4);
        assert!(forks.do_bip65());
        forks.next(3);
        assert_eq!(forks.majority_version(), 3);
        assert!(forks.do_bip66());
        assert!(!forks.do_bip65());
    }

    #[test]
    fn load_keeps_newest_entries() {
        let mut forks = small_window();
        forks.load((0..25).map(|i| if i < 15 { 1 } else { 3 }));
        assert_eq!(forks.window_len(), 10);
        assert_eq!(forks.majority_version(), 3);
    }

    #[test]
    fn flags_combine_activations() {
        let mut forks = small_window();
        assert_eq!(forks.flags(99), SCRIPT_VERIFY_NONE);
        assert_eq!(forks.flags(100), SCRIPT_VERIFY_P2SH);
        forks.load(std::iter::repeat(4).take(10));
        assert_eq!(
            forks.flags(100),
            SCRIPT_VERIFY_P2SH | SCRIPT_VERIFY_DERSIG | SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY
        );
    }

    #[test]
    fn bip30_exception_table() {
        let hash = [7u8; 32];
        let forks = Forks::with_window(
            10,
            10,
            0,
            Bip30Exceptions::new(vec![Checkpoint { height: 5, hash }]),
        );
        assert!(!forks.do_bip30(5, &hash));
        assert!(forks.do_bip30(5, &[8u8; 32]));
        assert!(forks.do_bip30(6, &hash));
    }
}
