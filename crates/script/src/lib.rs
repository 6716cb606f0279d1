//! Script verification: flags, the verifier oracle, a reference interpreter
//! for standard scripts, the worker wire protocol and the worker pool.

pub mod interpreter;
pub mod pool;
pub mod protocol;
mod secp;
pub mod sighash;
pub mod verifier;

pub use bitnode_consensus::constants::{
    MANDATORY_SCRIPT_VERIFY_FLAGS, SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY, SCRIPT_VERIFY_CLEANSTACK,
    SCRIPT_VERIFY_DERSIG, SCRIPT_VERIFY_LOW_S, SCRIPT_VERIFY_MINIMALDATA, SCRIPT_VERIFY_NONE,
    SCRIPT_VERIFY_NULLDUMMY, SCRIPT_VERIFY_P2SH, SCRIPT_VERIFY_SIGPUSHONLY,
    SCRIPT_VERIFY_STRICTENC,
};
pub use interpreter::{verify_script, ScriptError};
pub use pool::{
    LocalTransport, PoolConfig, ProcessTransport, ScriptJob, WorkerError, WorkerPool,
    WorkerTransport,
};
pub use verifier::{ScriptVerifier, StandardVerifier};

pub type ScriptFlags = u32;
