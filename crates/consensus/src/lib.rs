//! Consensus constants, network parameters, subsidy schedule and
//! supermajority-based soft-fork activation.

pub mod constants;
pub mod forks;
pub mod money;
pub mod params;
pub mod rewards;

pub type Hash256 = [u8; 32];

pub use forks::{Bip30Exceptions, Forks};
pub use params::{
    consensus_params, hash256_from_hex, hash256_to_hex, Checkpoint, ConsensusParams, Genesis,
    HexError, Network,
};
pub use rewards::block_subsidy;
