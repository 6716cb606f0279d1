//! Core block/transaction types and consensus serialization.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod hex;
pub mod outpoint;
pub mod transaction;

pub use block::{Block, BlockHeader, HEADER_SIZE};
pub use hash::{hash160, sha256, sha256d};
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TxIn, TxOut};
