use bitnode_consensus::{hash256_to_hex, Hash256};
use bitnode_script::WorkerError;
use bitnode_storage::StoreError;

use crate::segment::SegmentId;
use crate::validation::ValidationError;

/// Broad classes of [`ChainError`], for callers deciding how to react.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The header or block is invalid; chain state is untouched.
    Validation,
    /// An internal invariant or caller sequencing problem.
    Consistency,
    /// Storage or worker failure; staged writes were rolled back.
    Infrastructure,
    /// No further block can connect without operator action.
    Stalled,
}

#[derive(Debug)]
pub enum ChainError {
    Validation(ValidationError),
    UnknownHash(Hash256),
    UnknownStartHeader(Hash256),
    NonContiguous { tip: Hash256, candidate: Hash256 },
    NoPreviousSegment(SegmentId),
    UnknownSegment(SegmentId),
    /// The stored unspent set does not sit at the block's parent.
    UtxoTipMismatch { expected: Hash256, found: Hash256 },
    /// The best chain forked below the unspent-set tip, which would need
    /// blocks disconnected.
    UtxoStranded { utxo_tip: Hash256, fork_height: u32 },
    CorruptIndex(&'static str),
    Store(StoreError),
    Worker(WorkerError),
}

impl ChainError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChainError::Validation(_) => ErrorKind::Validation,
            ChainError::UnknownHash(_)
            | ChainError::UnknownStartHeader(_)
            | ChainError::NonContiguous { .. }
            | ChainError::NoPreviousSegment(_)
            | ChainError::UnknownSegment(_)
            | ChainError::UtxoTipMismatch { .. }
            | ChainError::CorruptIndex(_) => ErrorKind::Consistency,
            ChainError::Store(_) | ChainError::Worker(_) => ErrorKind::Infrastructure,
            ChainError::UtxoStranded { .. } => ErrorKind::Stalled,
        }
    }
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainError::Validation(err) => write!(f, "{err}"),
            ChainError::UnknownHash(hash) => write!(f, "unknown hash {}", hash256_to_hex(hash)),
            ChainError::UnknownStartHeader(hash) => {
                write!(f, "unknown start header {}", hash256_to_hex(hash))
            }
            ChainError::NonContiguous { tip, candidate } => write!(
                f,
                "non-contiguous extension: {} does not follow {}",
                hash256_to_hex(candidate),
                hash256_to_hex(tip)
            ),
            ChainError::NoPreviousSegment(id) => write!(f, "segment {id} has no previous segment"),
            ChainError::UnknownSegment(id) => write!(f, "unknown segment {id}"),
            ChainError::UtxoTipMismatch { expected, found } => write!(
                f,
                "utxo set is at {} but block builds on {}",
                hash256_to_hex(found),
                hash256_to_hex(expected)
            ),
            ChainError::UtxoStranded {
                utxo_tip,
                fork_height,
            } => write!(
                f,
                "best chain forks at height {fork_height} below utxo tip {}; rewinding is not supported",
                hash256_to_hex(utxo_tip)
            ),
            ChainError::CorruptIndex(message) => write!(f, "{message}"),
            ChainError::Store(err) => write!(f, "{err}"),
            ChainError::Worker(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<ValidationError> for ChainError {
    fn from(err: ValidationError) -> Self {
        ChainError::Validation(err)
    }
}

impl From<StoreError> for ChainError {
    fn from(err: StoreError) -> Self {
        ChainError::Store(err)
    }
}

impl From<WorkerError> for ChainError {
    fn from(err: WorkerError) -> Self {
        ChainError::Worker(err)
    }
}
