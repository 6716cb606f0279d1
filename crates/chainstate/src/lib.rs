//! Segmented chain index, header and block acceptance, and the unspent set.

pub mod blocks;
pub mod cache;
pub mod chain;
pub mod container;
pub mod db;
pub mod error;
pub mod headers;
pub mod index;
pub mod script_validation;
pub mod segment;
pub mod state;
pub mod utxo;
pub mod validation;
pub mod view;

pub use blocks::{BlockOutcome, PreparedBlock};
pub use chain::Chain;
pub use container::{ChainContainer, StoredSegment};
pub use db::{ChainDb, TxRecord};
pub use error::{ChainError, ErrorKind};
pub use headers::{BatchOutcome, HeaderCheck};
pub use index::BlockIndex;
pub use script_validation::{ScriptBackend, ScriptBatch, ScriptValidation};
pub use segment::{ChainSegment, SegmentId};
pub use state::{ChainState, Stranded};
pub use utxo::{InputPartition, Utxo, UtxoView};
pub use validation::{BlockCheck, ValidationError};
pub use view::{ChainView, GuidedChainView, Locator};
