use bitnode_log::log_trace;
use bitnode_primitives::transaction::Transaction;

use crate::interpreter::verify_script;
use crate::ScriptFlags;

/// Decides whether input `input_index` of `tx` may spend an output locked by
/// `script_pubkey`. Implementations must be pure functions of their inputs.
pub trait ScriptVerifier: Send + Sync {
    fn verify(
        &self,
        tx: &Transaction,
        script_pubkey: &[u8],
        input_index: usize,
        flags: ScriptFlags,
    ) -> bool;
}

impl<F> ScriptVerifier for F
where
    F: Fn(&Transaction, &[u8], usize, ScriptFlags) -> bool + Send + Sync,
{
    fn verify(
        &self,
        tx: &Transaction,
        script_pubkey: &[u8],
        input_index: usize,
        flags: ScriptFlags,
    ) -> bool {
        self(tx, script_pubkey, input_index, flags)
    }
}

/// Verifier backed by the built-in interpreter.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardVerifier;

impl ScriptVerifier for StandardVerifier {
    fn verify(
        &self,
        tx: &Transaction,
        script_pubkey: &[u8],
        input_index: usize,
        flags: ScriptFlags,
    ) -> bool {
        let Some(input) = tx.vin.get(input_index) else {
            return false;
        };
        match verify_script(&input.script_sig, script_pubkey, tx, input_index, flags) {
            Ok(()) => true,
            Err(err) => {
                log_trace!("script rejected input {input_index}: {err}");
                false
            }
        }
    }
}
