//! Block index records: a validated header with its height and cumulative work.

use bitnode_consensus::{ConsensusParams, Hash256};
use bitnode_pow::difficulty::{block_proof, CompactError, HeaderInfo};
use bitnode_primitives::block::{BlockHeader, HEADER_SIZE};
use bitnode_primitives::encoding::{DecodeError, Decoder, Encoder};
use primitive_types::U256;

pub const ENCODED_INDEX_LEN: usize = HEADER_SIZE + 4 + 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockIndex {
    pub hash: Hash256,
    pub height: u32,
    /// Cumulative proof-of-work up to and including this header.
    pub work: U256,
    pub header: BlockHeader,
}

impl BlockIndex {
    /// Root index built from the network's genesis header.
    pub fn genesis(params: &ConsensusParams) -> Result<Self, CompactError> {
        let genesis = &params.genesis;
        let header = BlockHeader {
            version: genesis.version,
            prev_block: [0u8; 32],
            merkle_root: genesis.merkle_root,
            time: genesis.time,
            bits: genesis.bits,
            nonce: genesis.nonce,
        };
        Ok(Self {
            hash: genesis.hash,
            height: 0,
            work: block_proof(genesis.bits)?,
            header,
        })
    }

    /// Index for `header` on top of `self`.
    pub fn child(&self, hash: Hash256, header: BlockHeader) -> Result<Self, CompactError> {
        Ok(Self {
            hash,
            height: self.height + 1,
            work: self.work.saturating_add(block_proof(header.bits)?),
            header,
        })
    }

    /// Whether `candidate` directly extends this index.
    pub fn is_next(&self, candidate: &BlockIndex) -> bool {
        candidate.header.prev_block == self.hash && candidate.height == self.height + 1
    }

    pub fn header_info(&self) -> HeaderInfo {
        HeaderInfo {
            height: self.height,
            time: self.header.time,
            bits: self.header.bits,
        }
    }

    pub fn encode(&self) -> [u8; ENCODED_INDEX_LEN] {
        let mut encoder = Encoder::with_capacity(ENCODED_INDEX_LEN);
        encoder.write_bytes(&self.header.consensus_encode());
        encoder.write_u32_le(self.height);
        encoder.write_bytes(&self.work.to_big_endian());
        let mut out = [0u8; ENCODED_INDEX_LEN];
        out.copy_from_slice(&encoder.into_inner());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header_bytes = decoder.read_fixed::<HEADER_SIZE>()?;
        let header = BlockHeader::consensus_decode(&header_bytes)?;
        let height = decoder.read_u32_le()?;
        let work = U256::from_big_endian(&decoder.read_fixed::<32>()?);
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            hash: header.hash(),
            height,
            work,
            header,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitnode_consensus::{consensus_params, Network};

    #[test]
    fn genesis_round_trips() {
        let params = consensus_params(Network::Regtest);
        let genesis = BlockIndex::genesis(&params).expect("genesis");
        assert_eq!(genesis.header.hash(), params.genesis.hash);
        let decoded = BlockIndex::decode(&genesis.encode()).expect("decode");
        assert_eq!(decoded, genesis);
    }

    #[test]
    fn child_accumulates_work() {
        let params = consensus_params(Network::Regtest);
        let genesis = BlockIndex::genesis(&params).expect("genesis");
        let header = BlockHeader {
            prev_block: genesis.hash,
            time: genesis.header.time + 1,
            ..genesis.header
        };
        let child = genesis.child(header.hash(), header).expect("child");
        assert_eq!(child.height, 1);
        assert_eq!(child.work, genesis.work + genesis.work);
        assert!(genesis.is_next(&child));
        assert!(!child.is_next(&genesis));
    }
}
