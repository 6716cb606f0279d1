//! Difficulty and compact target utilities.

use std::cmp::Ordering;

use bitnode_consensus::{ConsensusParams, Hash256};
use primitive_types::{U256, U512};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifficultyError {
    /// A retarget boundary was reached without the first block of the period.
    MissingPeriodStart { height: u32 },
    Compact(CompactError),
}

impl std::fmt::Display for DifficultyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DifficultyError::MissingPeriodStart { height } => {
                write!(f, "no ancestor at retarget period start for height {height}")
            }
            DifficultyError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DifficultyError {}

impl From<CompactError> for DifficultyError {
    fn from(err: CompactError) -> Self {
        DifficultyError::Compact(err)
    }
}

/// The fields of a header that difficulty calculations look at.
#[derive(Clone, Copy, Debug)]
pub struct HeaderInfo {
    pub height: u32,
    pub time: u32,
    pub bits: u32,
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;

    if word != 0 && (bits & 0x0080_0000) != 0 {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        word >>= 8 * (3 - size);
        U256::from(word)
    } else {
        if word != 0 && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32)) {
            return Err(CompactError::Overflow);
        }
        U256::from(word) << (8 * (size - 3))
    };

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact = if size <= 3 {
        value.low_u32() << (8 * (3 - size))
    } else {
        (value >> (8 * (size - 3))).low_u32()
    };

    // Keep the sign bit clear by moving one byte into the exponent.
    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    Ok(compact_to_u256(bits)?.to_little_endian())
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    u256_to_compact(U256::from_little_endian(target))
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    U256::from_little_endian(hash) <= U256::from_little_endian(target)
}

/// Expected number of hashes to find a block at `bits`: `2^256 / (target + 1)`.
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    // 2^256 does not fit, so compute (~target / (target + 1)) + 1 instead.
    let one = U256::one();
    Ok((!target / (target + one)) + one)
}

/// Compare two little-endian hashes as 256-bit numbers.
pub fn cmp_le(a: &Hash256, b: &Hash256) -> Ordering {
    U256::from_little_endian(a).cmp(&U256::from_little_endian(b))
}

/// Whether the block at `height` opens a new retarget period.
pub fn is_retarget_height(height: u32, params: &ConsensusParams) -> bool {
    height % params.retarget_interval() == 0
}

/// Bits required for the block after `prev`.
///
/// `period_start_time` is the timestamp of the ancestor
/// `retarget_interval - 1` blocks before `prev` and is only consulted on
/// retarget boundaries.
pub fn get_work_required(
    prev: &HeaderInfo,
    period_start_time: Option<u32>,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let next_height = prev.height + 1;
    if params.pow_no_retargeting || !is_retarget_height(next_height, params) {
        return Ok(prev.bits);
    }
    let first_time = period_start_time.ok_or(DifficultyError::MissingPeriodStart {
        height: next_height,
    })?;
    calculate_next_work_required(prev, first_time, params)
}

pub fn calculate_next_work_required(
    prev: &HeaderInfo,
    first_time: u32,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let timespan = params.pow_target_timespan;
    let actual = (i64::from(prev.time) - i64::from(first_time)).clamp(timespan / 4, timespan * 4);

    let pow_limit = U256::from_little_endian(&params.pow_limit);
    let scaled: U512 = compact_to_u256(prev.bits)?.full_mul(U256::from(actual as u64))
        / U512::from(timespan as u64);
    let target = U256::try_from(scaled)
        .ok()
        .filter(|target| *target <= pow_limit)
        .unwrap_or(pow_limit);

    Ok(u256_to_compact(target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitnode_consensus::{consensus_params, Network};

    fn retarget(first_time: u32, height: u32, time: u32, bits: u32) -> u32 {
        let params = consensus_params(Network::Mainnet);
        let prev = HeaderInfo { height, time, bits };
        calculate_next_work_required(&prev, first_time, &params).expect("retarget")
    }

    #[test]
    fn retarget_mainnet_period() {
        assert_eq!(retarget(1_261_130_161, 32_255, 1_262_152_739, 0x1d00ffff), 0x1d00d86a);
    }

    #[test]
    fn retarget_clamps_to_pow_limit() {
        assert_eq!(retarget(1_231_006_505, 2_015, 1_233_061_996, 0x1d00ffff), 0x1d00ffff);
    }

    #[test]
    fn retarget_clamps_fast_period_to_quarter() {
        assert_eq!(retarget(1_279_008_237, 68_543, 1_279_297_671, 0x1c05a3f4), 0x1c0168fd);
    }

    #[test]
    fn retarget_clamps_slow_period_to_four_times() {
        assert_eq!(retarget(1_263_163_443, 46_367, 1_269_211_443, 0x1c387f6f), 0x1d00e1fd);
    }

    #[test]
    fn bits_unchanged_between_boundaries() {
        let params = consensus_params(Network::Mainnet);
        let prev = HeaderInfo {
            height: 100,
            time: 1,
            bits: 0x1c05a3f4,
        };
        assert_eq!(get_work_required(&prev, None, &params), Ok(0x1c05a3f4));

        let boundary = HeaderInfo {
            height: 2015,
            time: 1,
            bits: 0x1c05a3f4,
        };
        assert_eq!(
            get_work_required(&boundary, None, &params),
            Err(DifficultyError::MissingPeriodStart { height: 2016 })
        );
    }

    #[test]
    fn regtest_never_retargets() {
        let params = consensus_params(Network::Regtest);
        let prev = HeaderInfo {
            height: 2015,
            time: 1,
            bits: 0x207fffff,
        };
        assert_eq!(get_work_required(&prev, None, &params), Ok(0x207fffff));
    }

    #[test]
    fn proof_grows_as_target_shrinks() {
        let easy = block_proof(0x207fffff).expect("easy");
        let hard = block_proof(0x1d00ffff).expect("hard");
        assert_eq!(easy, U256::from(2u64));
        assert_eq!(hard, U256::from(0x0001_0001_0001u64));
        assert!(hard > easy);
        assert_eq!(block_proof(0).expect("zero"), U256::zero());
    }

    #[test]
    fn negative_and_overflowing_compacts() {
        assert_eq!(compact_to_u256(0x04923456), Err(CompactError::Negative));
        assert_eq!(compact_to_u256(0xff123456), Err(CompactError::Overflow));
        // A zero mantissa with the sign bit set is plain zero.
        assert_eq!(compact_to_u256(0x01800000), Ok(U256::zero()));
    }
}
