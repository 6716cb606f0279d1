use bitnode_consensus::{ConsensusParams, Hash256};
use primitive_types::U256;

use crate::difficulty::{compact_to_u256, CompactError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowError {
    InvalidBits(&'static str),
    /// The header hash is above the target its bits claim.
    InsufficientWork,
    Compact(CompactError),
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::InvalidBits(message) => write!(f, "{message}"),
            PowError::InsufficientWork => write!(f, "insufficient proof of work"),
            PowError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(err: CompactError) -> Self {
        PowError::Compact(err)
    }
}

/// Check that `hash` satisfies the target encoded by `bits`, and that the
/// target is one the network allows.
pub fn check_proof_of_work(
    hash: &Hash256,
    bits: u32,
    params: &ConsensusParams,
) -> Result<(), PowError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Err(PowError::InvalidBits("pow target is zero"));
    }
    if target > U256::from_little_endian(&params.pow_limit) {
        return Err(PowError::InvalidBits("pow target above limit"));
    }
    if U256::from_little_endian(hash) > target {
        return Err(PowError::InsufficientWork);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitnode_consensus::{consensus_params, Network};

    #[test]
    fn mainnet_genesis_meets_its_target() {
        let params = consensus_params(Network::Mainnet);
        assert_eq!(
            check_proof_of_work(&params.genesis.hash, params.genesis.bits, &params),
            Ok(())
        );
    }

    #[test]
    fn hash_above_target_rejected() {
        let params = consensus_params(Network::Mainnet);
        let mut hash = [0u8; 32];
        hash[28] = 1;
        assert_eq!(
            check_proof_of_work(&hash, 0x1d00ffff, &params),
            Err(PowError::InsufficientWork)
        );
    }

    #[test]
    fn easier_than_limit_rejected() {
        let params = consensus_params(Network::Mainnet);
        assert_eq!(
            check_proof_of_work(&[0u8; 32], 0x207fffff, &params),
            Err(PowError::InvalidBits("pow target above limit"))
        );
        assert_eq!(
            check_proof_of_work(&[0u8; 32], 0, &params),
            Err(PowError::InvalidBits("pow target is zero"))
        );
    }
}
