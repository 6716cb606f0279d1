//! Control commands. Each takes a flat parameter map and answers with a
//! flat result map; failures answer `{"error": "..."}`.

use std::fmt;

use bitnode_chainstate::{BlockIndex, Chain, ChainError};
use bitnode_consensus::{hash256_from_hex, hash256_to_hex, Hash256};
use bitnode_log::{capture_snapshot, Level};
use bitnode_primitives::hex::to_hex;
use bitnode_storage::KeyValueStore;
use primitive_types::U256;
use serde::Deserialize;
use serde_json::{json, Map, Value};

pub type Params = Map<String, Value>;

pub const STOP: &str = "stop";
pub const COMMANDS: [&str; 6] = ["info", "gettx", "getheader", "getblockhash", "chains", STOP];

const RECENT_ERRORS: usize = 10;

#[derive(Debug)]
pub enum ControlError {
    UnknownCommand(String),
    MissingParam(&'static str),
    InvalidParam(&'static str),
    NotFound(String),
    Chain(ChainError),
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::UnknownCommand(name) => write!(
                f,
                "unknown command '{name}' (expected one of {})",
                COMMANDS.join(", ")
            ),
            ControlError::MissingParam(name) => write!(f, "missing parameter '{name}'"),
            ControlError::InvalidParam(name) => write!(f, "invalid parameter '{name}'"),
            ControlError::NotFound(what) => write!(f, "{what} not found"),
            ControlError::Chain(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ControlError {}

impl From<ChainError> for ControlError {
    fn from(err: ChainError) -> Self {
        ControlError::Chain(err)
    }
}

/// A control request as read from a line of input.
#[derive(Debug, Deserialize)]
pub struct ControlRequest {
    pub command: String,
    #[serde(default)]
    pub params: Params,
}

impl ControlRequest {
    /// Accepts `{"command": .., "params": {..}}` or `command key=value ...`.
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        if line.starts_with('{') {
            return serde_json::from_str(line).map_err(|err| format!("malformed request: {err}"));
        }
        let mut words = line.split_whitespace();
        let command = words
            .next()
            .ok_or_else(|| "empty request".to_string())?
            .to_ascii_lowercase();
        let mut params = Params::new();
        for word in words {
            let (key, value) = word
                .split_once('=')
                .ok_or_else(|| format!("expected key=value, got '{word}'"))?;
            params.insert(key.to_string(), Value::String(value.to_string()));
        }
        Ok(Self { command, params })
    }
}

pub fn error_map(message: &str) -> Params {
    let mut map = Params::new();
    map.insert("error".to_string(), Value::String(message.to_string()));
    map
}

pub fn stopping() -> Params {
    let mut map = Params::new();
    map.insert("stopping".to_string(), Value::Bool(true));
    map
}

/// Answer a read-only command. `stop` is handled by the reactor itself.
pub fn dispatch<S: KeyValueStore>(chain: &Chain<S>, command: &str, params: &Params) -> Params {
    let result = match command {
        "info" => info(chain),
        "gettx" => get_tx(chain, params),
        "getheader" => get_header(chain, params),
        "getblockhash" => get_block_hash(chain, params),
        "chains" => chains(chain),
        other => Err(ControlError::UnknownCommand(other.to_string())),
    };
    result.unwrap_or_else(|err| error_map(&err.to_string()))
}

fn into_map(value: Value) -> Params {
    match value {
        Value::Object(map) => map,
        _ => Params::new(),
    }
}

fn work_hex(work: &U256) -> String {
    format!("{work:x}")
}

fn info<S: KeyValueStore>(chain: &Chain<S>) -> Result<Params, ControlError> {
    let state = chain.state();
    let headers = state.chain().tip();
    let validated = state.last_validated_block();
    let forks = state.forks();
    let recent_errors: Vec<Value> = {
        let warnings: Vec<String> = capture_snapshot(usize::MAX)
            .into_iter()
            .filter(|record| record.level <= Level::Warn)
            .map(|record| format!("{} {}", record.level.as_str(), record.msg))
            .collect();
        let skip = warnings.len().saturating_sub(RECENT_ERRORS);
        warnings.into_iter().skip(skip).map(Value::String).collect()
    };
    let stranded = state.stranded_utxo();
    Ok(into_map(json!({
        "network": chain.params().network.as_str(),
        "headers": headers.height,
        "bestheaderhash": hash256_to_hex(&headers.hash),
        "blocks": validated.height,
        "bestblockhash": hash256_to_hex(&validated.hash),
        "blocksleft": state.blocks_left_to_sync(),
        "synced": state.is_synced(),
        "chainwork": work_hex(&headers.work),
        "segments": chain.container().len(),
        "bestsegment": state.chain().segment().0,
        "checkscript": chain.scripts().active(),
        "majorityversion": forks.majority_version(),
        "bip34": forks.do_bip34(),
        "bip66": forks.do_bip66(),
        "bip65": forks.do_bip65(),
        "failedblocks": chain.container().failed().count(),
        "stranded": stranded.is_some(),
        "strandedutxotip": stranded.map(|stranded| hash256_to_hex(&stranded.utxo_tip.hash)),
        "strandedforkheight": stranded.map(|stranded| stranded.fork_height),
        "recent_errors": recent_errors,
    })))
}

fn param_hash(params: &Params, key: &'static str) -> Result<Hash256, ControlError> {
    let raw = params
        .get(key)
        .ok_or(ControlError::MissingParam(key))?
        .as_str()
        .ok_or(ControlError::InvalidParam(key))?;
    hash256_from_hex(raw).map_err(|_| ControlError::InvalidParam(key))
}

fn param_u32(params: &Params, key: &'static str) -> Result<u32, ControlError> {
    let value = params.get(key).ok_or(ControlError::MissingParam(key))?;
    let parsed = match value {
        Value::Number(number) => number.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(raw) => raw.trim().parse::<u32>().ok(),
        _ => None,
    };
    parsed.ok_or(ControlError::InvalidParam(key))
}

/// Whether `index` is on the best chain at or below the validated tip.
fn is_validated<S: KeyValueStore>(chain: &Chain<S>, index: &BlockIndex) -> bool {
    index.height <= chain.state().last_validated_block().height
        && chain.hash_at(index.height) == Some(index.hash)
}

fn get_tx<S: KeyValueStore>(chain: &Chain<S>, params: &Params) -> Result<Params, ControlError> {
    let txid = param_hash(params, "txid")?;
    let record = chain
        .transaction(&txid)?
        .ok_or_else(|| ControlError::NotFound(format!("transaction {}", hash256_to_hex(&txid))))?;
    let block = chain.header(&record.block)?;
    let confirmations = if is_validated(chain, &block) {
        chain.state().last_validated_block().height - block.height + 1
    } else {
        0
    };
    let value_out: i64 = record.tx.vout.iter().map(|output| output.value).sum();
    Ok(into_map(json!({
        "txid": hash256_to_hex(&txid),
        "blockhash": hash256_to_hex(&record.block),
        "height": block.height,
        "confirmations": confirmations,
        "size": record.tx.serialized_size(),
        "inputs": record.tx.vin.len(),
        "outputs": record.tx.vout.len(),
        "valueout": value_out,
        "hex": to_hex(&record.tx.consensus_encode()),
    })))
}

fn get_header<S: KeyValueStore>(chain: &Chain<S>, params: &Params) -> Result<Params, ControlError> {
    let hash = param_hash(params, "hash")?;
    let index = match chain.header(&hash) {
        Ok(index) => index,
        Err(ChainError::UnknownHash(_)) => {
            return Err(ControlError::NotFound(format!("header {}", hash256_to_hex(&hash))))
        }
        Err(err) => return Err(err.into()),
    };
    let header = index.header;
    let segment = chain.container().locate(&hash).map(|(id, _)| id.0);
    Ok(into_map(json!({
        "hash": hash256_to_hex(&index.hash),
        "height": index.height,
        "version": header.version,
        "previousblockhash": hash256_to_hex(&header.prev_block),
        "merkleroot": hash256_to_hex(&header.merkle_root),
        "time": header.time,
        "bits": format!("{:08x}", header.bits),
        "nonce": header.nonce,
        "chainwork": work_hex(&index.work),
        "segment": segment,
        "bestchain": chain.hash_at(index.height) == Some(index.hash),
        "validated": is_validated(chain, &index),
    })))
}

fn get_block_hash<S: KeyValueStore>(
    chain: &Chain<S>,
    params: &Params,
) -> Result<Params, ControlError> {
    let height = param_u32(params, "height")?;
    let hash = chain
        .hash_at(height)
        .ok_or_else(|| ControlError::NotFound(format!("height {height} on the best chain")))?;
    Ok(into_map(json!({
        "height": height,
        "hash": hash256_to_hex(&hash),
    })))
}

/// One entry per tracked segment, keyed by segment id.
fn chains<S: KeyValueStore>(chain: &Chain<S>) -> Result<Params, ControlError> {
    let container = chain.container();
    let best = chain.state().chain().segment();
    let mut out = Params::new();
    for segment in container.segments() {
        let id = segment.id();
        let parent = match container.parent(id) {
            Ok(parent) => Some(parent.0),
            Err(ChainError::NoPreviousSegment(_)) => None,
            Err(err) => return Err(err.into()),
        };
        let tip = segment.tip();
        let validated = container.block_tip(id)?;
        out.insert(
            id.0.to_string(),
            json!({
                "parent": parent,
                "start_height": segment.start_height(),
                "height": tip.height,
                "tip": hash256_to_hex(&tip.hash),
                "validated_height": validated.height,
                "chainwork": work_hex(&tip.work),
                "best": id == best,
            }),
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_and_word_requests() {
        let request = ControlRequest::parse(r#"{"command":"getblockhash","params":{"height":3}}"#)
            .expect("json");
        assert_eq!(request.command, "getblockhash");
        assert_eq!(param_u32(&request.params, "height").expect("height"), 3);

        let request = ControlRequest::parse("GetBlockHash height=7").expect("words");
        assert_eq!(request.command, "getblockhash");
        assert_eq!(param_u32(&request.params, "height").expect("height"), 7);

        let request = ControlRequest::parse(r#"{"command":"info"}"#).expect("no params");
        assert!(request.params.is_empty());
    }

    #[test]
    fn rejects_malformed_requests() {
        assert!(ControlRequest::parse("").is_err());
        assert!(ControlRequest::parse("gettx deadbeef").is_err());
        assert!(ControlRequest::parse("{not json").is_err());
    }

    #[test]
    fn parameter_errors() {
        let mut params = Params::new();
        assert!(matches!(
            param_u32(&params, "height"),
            Err(ControlError::MissingParam("height"))
        ));
        params.insert("height".to_string(), json!(-1));
        assert!(matches!(
            param_u32(&params, "height"),
            Err(ControlError::InvalidParam("height"))
        ));
        params.insert("hash".to_string(), json!("zz"));
        assert!(matches!(
            param_hash(&params, "hash"),
            Err(ControlError::InvalidParam("hash"))
        ));
    }
}
