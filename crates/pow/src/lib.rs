//! Proof-of-work target arithmetic, chain work and difficulty retargeting.

pub mod difficulty;
pub mod validation;

pub use difficulty::{block_proof, get_work_required, HeaderInfo};
pub use validation::{check_proof_of_work, PowError};
