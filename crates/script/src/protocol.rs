//! JSON messages exchanged with script-check workers, one object per line.
//!
//! Transaction ids travel in display (reversed) hex, raw transactions and
//! scripts in plain hex.

use bitnode_consensus::hash256_to_hex;
use bitnode_primitives::hex::{from_hex, to_hex};
use bitnode_primitives::transaction::Transaction;
use serde::{Deserialize, Serialize};

use crate::verifier::ScriptVerifier;
use crate::ScriptFlags;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptCheckRequest {
    pub txid: String,
    pub tx: String,
    pub flags: ScriptFlags,
    pub vin: u32,
    #[serde(rename = "scriptPubKey")]
    pub script_pubkey: String,
}

impl ScriptCheckRequest {
    pub fn new(tx: &Transaction, input_index: u32, script_pubkey: &[u8], flags: ScriptFlags) -> Self {
        Self::from_raw(
            hash256_to_hex(&tx.txid()),
            to_hex(&tx.consensus_encode()),
            input_index,
            script_pubkey,
            flags,
        )
    }

    /// Builds a request around an already encoded transaction.
    pub fn from_raw(
        txid: String,
        tx_hex: String,
        input_index: u32,
        script_pubkey: &[u8],
        flags: ScriptFlags,
    ) -> Self {
        Self {
            txid,
            tx: tx_hex,
            flags,
            vin: input_index,
            script_pubkey: to_hex(script_pubkey),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptCheckResponse {
    pub txid: String,
    pub vin: u32,
    pub result: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTx {
    pub txid: String,
    pub tx: String,
    /// One locking script per input, in input order.
    pub scripts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCheckRequest {
    pub id: String,
    pub flags: ScriptFlags,
    pub txs: Vec<BatchTx>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCheckResponse {
    /// Echoes the request `id`.
    pub txid: String,
    pub result: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerRequest {
    Batch(BatchCheckRequest),
    Single(ScriptCheckRequest),
}

/// Answer one request line. Malformed input yields `{"error": ...}`.
pub fn process_line<V: ScriptVerifier + ?Sized>(verifier: &V, line: &str) -> String {
    let request: WorkerRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(err) => return error_line(&format!("malformed request: {err}")),
    };
    let encoded = match request {
        WorkerRequest::Single(request) => serde_json::to_string(&ScriptCheckResponse {
            result: check_single(verifier, &request),
            txid: request.txid,
            vin: request.vin,
        }),
        WorkerRequest::Batch(request) => serde_json::to_string(&BatchCheckResponse {
            result: check_batch(verifier, &request),
            txid: request.id,
        }),
    };
    encoded.unwrap_or_else(|err| error_line(&format!("encode response: {err}")))
}

fn error_line(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}

fn decode_tx(raw: &str) -> Option<Transaction> {
    let bytes = from_hex(raw).ok()?;
    Transaction::consensus_decode(&bytes).ok()
}

fn check_single<V: ScriptVerifier + ?Sized>(verifier: &V, request: &ScriptCheckRequest) -> bool {
    let Some(tx) = decode_tx(&request.tx) else {
        return false;
    };
    let Ok(script_pubkey) = from_hex(&request.script_pubkey) else {
        return false;
    };
    let input_index = request.vin as usize;
    input_index < tx.vin.len() && verifier.verify(&tx, &script_pubkey, input_index, request.flags)
}

fn check_batch<V: ScriptVerifier + ?Sized>(verifier: &V, request: &BatchCheckRequest) -> bool {
    request.txs.iter().all(|entry| {
        let Some(tx) = decode_tx(&entry.tx) else {
            return false;
        };
        if entry.scripts.len() != tx.vin.len() {
            return false;
        }
        entry.scripts.iter().enumerate().all(|(input_index, script)| {
            from_hex(script)
                .map(|script| verifier.verify(&tx, &script, input_index, request.flags))
                .unwrap_or(false)
        })
    })
}
