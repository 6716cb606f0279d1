//! Persistent chain database on top of the column store.
//!
//! Every mutating helper stages its writes into a caller-supplied
//! [`WriteBatch`]; [`ChainDb::transaction`] commits a batch or drops it.

use std::sync::Arc;

use bitnode_consensus::Hash256;
use bitnode_log::log_debug;
use bitnode_primitives::encoding::{DecodeError, Decoder, Encoder};
use bitnode_primitives::outpoint::OutPoint;
use bitnode_primitives::transaction::Transaction;
use bitnode_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::container::StoredSegment;
use crate::error::ChainError;
use crate::index::{BlockIndex, ENCODED_INDEX_LEN};
use crate::segment::SegmentId;
use crate::utxo::Utxo;
use crate::validation::ValidationError;

const META_UTXO_TIP: &[u8] = b"utxo_tip";
const META_FAILED_PREFIX: &[u8] = b"failed/";
const NO_PARENT: u32 = u32::MAX;
const SEGMENT_RECORD_LEN: usize = 4 + 4 + 32;

/// Row of the segment column.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SegmentRecord {
    pub id: SegmentId,
    pub parent: Option<SegmentId>,
    pub start_height: u32,
    pub block_tip: Hash256,
}

impl SegmentRecord {
    fn encode(&self) -> [u8; SEGMENT_RECORD_LEN] {
        let mut out = [0u8; SEGMENT_RECORD_LEN];
        out[0..4].copy_from_slice(&self.start_height.to_le_bytes());
        let parent = self.parent.map_or(NO_PARENT, |parent| parent.0);
        out[4..8].copy_from_slice(&parent.to_le_bytes());
        out[8..40].copy_from_slice(&self.block_tip);
        out
    }

    fn decode(id: SegmentId, bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let start_height = decoder.read_u32_le()?;
        let parent = match decoder.read_u32_le()? {
            NO_PARENT => None,
            parent => Some(SegmentId(parent)),
        };
        let block_tip = decoder.read_hash()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            id,
            parent,
            start_height,
            block_tip,
        })
    }
}

fn segment_key(id: SegmentId) -> [u8; 4] {
    id.0.to_be_bytes()
}

fn segment_height_key(id: SegmentId, height: u32) -> [u8; 8] {
    let mut key = [0u8; 8];
    key[..4].copy_from_slice(&id.0.to_be_bytes());
    key[4..].copy_from_slice(&height.to_be_bytes());
    key
}

fn corrupt(column: Column, reason: &'static str) -> ChainError {
    ChainError::Store(StoreError::Corrupt { column, reason })
}

/// Where a transaction was confirmed, as kept by the transaction index.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxRecord {
    pub block: Hash256,
    pub tx: Transaction,
}

pub struct ChainDb<S> {
    store: Arc<S>,
}

impl<S> Clone for ChainDb<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: KeyValueStore> ChainDb<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Run `body` against a fresh batch and commit it only on success.
    pub fn transaction<T, F>(&self, body: F) -> Result<T, ChainError>
    where
        F: FnOnce(&mut WriteBatch) -> Result<T, ChainError>,
    {
        bitnode_storage::transaction(self.store.as_ref(), body)
    }

    /// Write the root segment holding `genesis` when the store is empty.
    /// Returns whether anything was written.
    pub fn initialize(&self, genesis: &BlockIndex) -> Result<bool, ChainError> {
        if !self.store.scan_prefix(Column::Segment, &[])?.is_empty() {
            return Ok(false);
        }
        let root = SegmentId(0);
        self.transaction(|batch| {
            self.insert_segment(
                batch,
                &SegmentRecord {
                    id: root,
                    parent: None,
                    start_height: 0,
                    block_tip: genesis.hash,
                },
            );
            self.insert_header_batch(batch, root, std::slice::from_ref(genesis));
            batch.put(Column::Meta, META_UTXO_TIP, genesis.hash);
            Ok(())
        })?;
        log_debug!("initialized chain database at genesis");
        Ok(true)
    }

    /// Index record of `hash` and the segment that stores it.
    pub fn lookup_index(
        &self,
        hash: &Hash256,
    ) -> Result<Option<(BlockIndex, SegmentId)>, ChainError> {
        let Some(bytes) = self.store.get(Column::HeaderIndex, hash)? else {
            return Ok(None);
        };
        if bytes.len() != ENCODED_INDEX_LEN + 4 {
            return Err(corrupt(Column::HeaderIndex, "index record has wrong length"));
        }
        let index = BlockIndex::decode(&bytes[..ENCODED_INDEX_LEN])
            .map_err(|_| corrupt(Column::HeaderIndex, "undecodable index record"))?;
        if &index.hash != hash {
            return Err(corrupt(Column::HeaderIndex, "index record under foreign hash"));
        }
        let mut id = [0u8; 4];
        id.copy_from_slice(&bytes[ENCODED_INDEX_LEN..]);
        Ok(Some((index, SegmentId(u32::from_le_bytes(id)))))
    }

    pub fn fetch_index(&self, hash: &Hash256) -> Result<BlockIndex, ChainError> {
        self.lookup_index(hash)?
            .map(|(index, _)| index)
            .ok_or(ChainError::UnknownHash(*hash))
    }

    pub fn contains_index(&self, hash: &Hash256) -> Result<bool, ChainError> {
        Ok(self.store.get(Column::HeaderIndex, hash)?.is_some())
    }

    /// Stage `indices` as the next heights of `segment`.
    pub fn insert_header_batch(
        &self,
        batch: &mut WriteBatch,
        segment: SegmentId,
        indices: &[BlockIndex],
    ) {
        for index in indices {
            let mut value = Vec::with_capacity(ENCODED_INDEX_LEN + 4);
            value.extend_from_slice(&index.encode());
            value.extend_from_slice(&segment.0.to_le_bytes());
            batch.put(Column::HeaderIndex, index.hash, value);
            batch.put(
                Column::SegmentHeight,
                segment_height_key(segment, index.height),
                index.hash,
            );
        }
    }

    pub fn insert_segment(&self, batch: &mut WriteBatch, record: &SegmentRecord) {
        batch.put(Column::Segment, segment_key(record.id), record.encode());
    }

    pub fn fetch_segment(&self, id: SegmentId) -> Result<SegmentRecord, ChainError> {
        let bytes = self
            .store
            .get(Column::Segment, &segment_key(id))?
            .ok_or(ChainError::UnknownSegment(id))?;
        SegmentRecord::decode(id, &bytes)
            .map_err(|_| corrupt(Column::Segment, "undecodable segment record"))
    }

    /// Record `block_tip` as the validated tip of segment `id`.
    pub fn set_segment_block_tip(
        &self,
        batch: &mut WriteBatch,
        id: SegmentId,
        block_tip: &Hash256,
    ) -> Result<(), ChainError> {
        let mut record = self.fetch_segment(id)?;
        record.block_tip = *block_tip;
        self.insert_segment(batch, &record);
        Ok(())
    }

    /// Every persisted segment with its hashes in height order.
    pub fn fetch_chain_segments(&self) -> Result<Vec<StoredSegment>, ChainError> {
        let mut segments = Vec::new();
        for (key, value) in self.store.scan_prefix(Column::Segment, &[])? {
            let id: [u8; 4] = key
                .as_slice()
                .try_into()
                .map_err(|_| corrupt(Column::Segment, "segment key has wrong length"))?;
            let id = SegmentId(u32::from_be_bytes(id));
            let record = SegmentRecord::decode(id, &value)
                .map_err(|_| corrupt(Column::Segment, "undecodable segment record"))?;

            let rows = self.store.scan_prefix(Column::SegmentHeight, &segment_key(id))?;
            let mut hashes = Vec::with_capacity(rows.len());
            for (offset, (key, hash)) in rows.iter().enumerate() {
                if key.len() != 8 {
                    return Err(corrupt(Column::SegmentHeight, "segment height key has wrong length"));
                }
                let height = u32::from_be_bytes([key[4], key[5], key[6], key[7]]);
                if height != record.start_height + offset as u32 {
                    return Err(corrupt(Column::SegmentHeight, "segment heights are not contiguous"));
                }
                let hash: Hash256 = hash
                    .as_slice()
                    .try_into()
                    .map_err(|_| corrupt(Column::SegmentHeight, "hash has wrong length"))?;
                hashes.push(hash);
            }
            let tip_hash = hashes
                .last()
                .ok_or(corrupt(Column::SegmentHeight, "segment without headers"))?;
            segments.push(StoredSegment {
                id,
                parent: record.parent,
                start_height: record.start_height,
                tip: self.fetch_index(tip_hash)?,
                block_tip: self.fetch_index(&record.block_tip)?,
                hashes,
            });
        }
        Ok(segments)
    }

    pub fn insert_failed(&self, batch: &mut WriteBatch, hash: &Hash256) {
        let mut key = META_FAILED_PREFIX.to_vec();
        key.extend_from_slice(hash);
        batch.put(Column::Meta, key, Vec::new());
    }

    /// Blocks recorded as failing validation.
    pub fn fetch_failed(&self) -> Result<Vec<Hash256>, ChainError> {
        self.store
            .scan_prefix(Column::Meta, META_FAILED_PREFIX)?
            .into_iter()
            .map(|(key, _)| {
                key.strip_prefix(META_FAILED_PREFIX)
                    .and_then(|hash| hash.try_into().ok())
                    .ok_or(corrupt(Column::Meta, "failed block key has wrong length"))
            })
            .collect()
    }

    /// Hash of the block the unspent set currently reflects.
    pub fn utxo_tip(&self) -> Result<Hash256, ChainError> {
        let bytes = self
            .store
            .get(Column::Meta, META_UTXO_TIP)?
            .ok_or(corrupt(Column::Meta, "missing utxo tip"))?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| corrupt(Column::Meta, "utxo tip has wrong length"))
    }

    pub fn utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>, ChainError> {
        match self.store.get(Column::Utxo, &outpoint.to_key())? {
            Some(bytes) => Utxo::decode(&bytes)
                .map(Some)
                .map_err(|_| corrupt(Column::Utxo, "undecodable utxo entry")),
            None => Ok(None),
        }
    }

    /// Stage the unspent-set delta of one block and move the utxo tip to
    /// `tip`.
    pub fn update_utxo_set(
        &self,
        batch: &mut WriteBatch,
        deletes: &[OutPoint],
        inserts: &[(OutPoint, Utxo)],
        tip: &Hash256,
    ) {
        for outpoint in deletes {
            batch.delete(Column::Utxo, outpoint.to_key());
        }
        for (outpoint, utxo) in inserts {
            batch.put(Column::Utxo, outpoint.to_key(), utxo.encode());
        }
        batch.put(Column::Meta, META_UTXO_TIP, *tip);
    }

    /// Stored outputs for `outpoints`, read against the unspent set as of
    /// block `ref_point`.
    pub fn fetch_utxo_list(
        &self,
        ref_point: &Hash256,
        outpoints: &[OutPoint],
    ) -> Result<Vec<(OutPoint, Utxo)>, ChainError> {
        let found = self.utxo_tip()?;
        if &found != ref_point {
            return Err(ChainError::UtxoTipMismatch {
                expected: *ref_point,
                found,
            });
        }
        outpoints
            .iter()
            .map(|outpoint| match self.utxo(outpoint)? {
                Some(utxo) => Ok((*outpoint, utxo)),
                None => Err(ValidationError::MissingInputs(*outpoint).into()),
            })
            .collect()
    }

    /// Versions of `hash` and up to `window - 1` of its ancestors, oldest
    /// first.
    pub fn find_super_majority_info_by_hash(
        &self,
        hash: &Hash256,
        window: usize,
    ) -> Result<Vec<i32>, ChainError> {
        let mut versions = Vec::with_capacity(window);
        let mut cursor = self.fetch_index(hash)?;
        while versions.len() < window {
            versions.push(cursor.header.version);
            if cursor.height == 0 {
                break;
            }
            cursor = self.fetch_index(&cursor.header.prev_block)?;
        }
        versions.reverse();
        Ok(versions)
    }

    pub fn index_transaction(
        &self,
        batch: &mut WriteBatch,
        block: &Hash256,
        txid: &Hash256,
        tx: &Transaction,
    ) {
        let raw = tx.consensus_encode();
        let mut encoder = Encoder::with_capacity(32 + raw.len());
        encoder.write_hash(block);
        encoder.write_bytes(&raw);
        batch.put(Column::TxIndex, *txid, encoder.into_inner());
    }

    pub fn fetch_transaction(&self, txid: &Hash256) -> Result<Option<TxRecord>, ChainError> {
        let Some(bytes) = self.store.get(Column::TxIndex, txid)? else {
            return Ok(None);
        };
        if bytes.len() < 32 {
            return Err(corrupt(Column::TxIndex, "tx index entry too short"));
        }
        let mut block = [0u8; 32];
        block.copy_from_slice(&bytes[..32]);
        let tx = Transaction::consensus_decode(&bytes[32..])
            .map_err(|_| corrupt(Column::TxIndex, "undecodable indexed transaction"))?;
        Ok(Some(TxRecord { block, tx }))
    }
}
