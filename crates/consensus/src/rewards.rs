use crate::money::{Amount, COIN};
use crate::params::ConsensusParams;

/// New coins a block at `height` may create.
pub fn block_subsidy(height: u32, params: &ConsensusParams) -> Amount {
    let halvings = height / params.subsidy_halving_interval;
    // Shifts of 64 or more overflow an i64.
    if halvings >= 64 {
        return 0;
    }
    (50 * COIN) >> halvings
}
