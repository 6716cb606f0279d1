//! Unspent outputs and the per-block view over them.

use std::collections::{HashMap, HashSet};

use bitnode_consensus::Hash256;
use bitnode_primitives::block::Block;
use bitnode_primitives::encoding::{DecodeError, Decoder, Encoder};
use bitnode_primitives::outpoint::OutPoint;

use crate::error::ChainError;
use crate::validation::ValidationError;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Utxo {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
    pub height: u32,
    pub is_coinbase: bool,
}

impl Utxo {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
        encoder.write_u32_le(self.height);
        encoder.write_u8(u8::from(self.is_coinbase));
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        let height = decoder.read_u32_le()?;
        let is_coinbase = decoder.read_u8()? != 0;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            value,
            script_pubkey,
            height,
            is_coinbase,
        })
    }
}

/// The block's inputs split by where their previous output lives.
#[derive(Debug, Default)]
pub struct InputPartition {
    /// Outputs created earlier in the same block, keyed to their entries.
    pub internal: HashMap<OutPoint, Utxo>,
    /// Outputs that must come from the stored unspent set.
    pub external: Vec<OutPoint>,
    /// Outputs this block creates and does not spend itself.
    pub created: Vec<(OutPoint, Utxo)>,
}

impl InputPartition {
    /// Split the inputs of `block` (at `height`, with precomputed `txids`).
    /// Spending the same output twice anywhere in the block is rejected.
    pub fn new(block: &Block, txids: &[Hash256], height: u32) -> Result<Self, ChainError> {
        if txids.len() != block.transactions.len() {
            return Err(ChainError::CorruptIndex("transaction id cache mismatch"));
        }
        let mut produced: HashMap<OutPoint, Utxo> = HashMap::new();
        let mut spent: HashSet<OutPoint> = HashSet::new();
        let mut partition = InputPartition::default();

        for (tx_index, (tx, txid)) in block.transactions.iter().zip(txids).enumerate() {
            let is_coinbase = tx_index == 0;
            if !is_coinbase {
                for input in &tx.vin {
                    if !spent.insert(input.prevout) {
                        return Err(ValidationError::DuplicateSpend.into());
                    }
                    match produced.remove(&input.prevout) {
                        Some(utxo) => {
                            partition.internal.insert(input.prevout, utxo);
                        }
                        None => partition.external.push(input.prevout),
                    }
                }
            }
            for (vout, output) in tx.vout.iter().enumerate() {
                produced.insert(
                    OutPoint::new(*txid, vout as u32),
                    Utxo {
                        value: output.value,
                        script_pubkey: output.script_pubkey.clone(),
                        height,
                        is_coinbase,
                    },
                );
            }
        }

        let mut created: Vec<(OutPoint, Utxo)> = produced.into_iter().collect();
        created.sort_by(|a, b| a.0.cmp(&b.0));
        partition.created = created;
        Ok(partition)
    }
}

/// Outputs spent by one block, resolved once before its inputs are checked.
#[derive(Clone, Debug, Default)]
pub struct UtxoView {
    entries: HashMap<OutPoint, Utxo>,
}

impl UtxoView {
    /// Build the view for `partition`, calling `fetch` only for the outputs
    /// that did not originate in the block. `fetch` is not called at all when
    /// every input is internal.
    pub fn build<F>(partition: &InputPartition, fetch: F) -> Result<Self, ChainError>
    where
        F: FnOnce(&[OutPoint]) -> Result<Vec<(OutPoint, Utxo)>, ChainError>,
    {
        let mut view = UtxoView {
            entries: partition.internal.clone(),
        };
        if partition.external.is_empty() {
            return Ok(view);
        }
        for (outpoint, utxo) in fetch(&partition.external)? {
            view.insert(outpoint, utxo)?;
        }
        Ok(view)
    }

    fn insert(&mut self, outpoint: OutPoint, utxo: Utxo) -> Result<(), ChainError> {
        if self.entries.insert(outpoint, utxo).is_some() {
            return Err(ChainError::CorruptIndex("utxo fetched twice for one block"));
        }
        Ok(())
    }

    pub fn have(&self, outpoint: &OutPoint) -> bool {
        self.entries.contains_key(outpoint)
    }

    pub fn fetch(&self, outpoint: &OutPoint) -> Option<&Utxo> {
        self.entries.get(outpoint)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
