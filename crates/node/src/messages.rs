//! Peer protocol messages the reactor consumes and produces, with their
//! wire payload codecs.

use bitnode_chainstate::Locator;
use bitnode_consensus::constants::MAX_HEADERS_RESULTS;
use bitnode_consensus::Hash256;
use bitnode_primitives::block::{Block, BlockHeader};
use bitnode_primitives::encoding::{decode, Decodable, DecodeError, Decoder, Encodable, Encoder};

pub const PROTOCOL_VERSION: i32 = 70_002;
const MAX_INV_RESULTS: usize = 50_000;
const MAX_LOCATOR_HASHES: usize = 128;

const MSG_TX: u32 = 1;
const MSG_BLOCK: u32 = 2;

/// Connection-local peer identifier assigned by the transport.
pub type PeerId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InvKind {
    Tx,
    Block,
}

impl InvKind {
    fn code(self) -> u32 {
        match self {
            InvKind::Tx => MSG_TX,
            InvKind::Block => MSG_BLOCK,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            MSG_TX => Some(InvKind::Tx),
            MSG_BLOCK => Some(InvKind::Block),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Inventory {
    pub kind: InvKind,
    pub hash: Hash256,
}

impl Inventory {
    pub fn block(hash: Hash256) -> Self {
        Self {
            kind: InvKind::Block,
            hash,
        }
    }

    pub fn tx(hash: Hash256) -> Self {
        Self {
            kind: InvKind::Tx,
            hash,
        }
    }
}

impl Encodable for Inventory {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.kind.code());
        encoder.write_hash(&self.hash);
    }
}

impl Decodable for Inventory {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let code = decoder.read_u32_le()?;
        let kind = InvKind::from_code(code)
            .ok_or(DecodeError::InvalidData("unknown inventory type"))?;
        Ok(Self {
            kind,
            hash: decoder.read_hash()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerMessage {
    Headers(Vec<BlockHeader>),
    Block(Block),
    Inv(Vec<Inventory>),
    GetHeaders(Locator),
    GetData(Vec<Inventory>),
}

impl PeerMessage {
    pub fn command(&self) -> &'static str {
        match self {
            PeerMessage::Headers(_) => "headers",
            PeerMessage::Block(_) => "block",
            PeerMessage::Inv(_) => "inv",
            PeerMessage::GetHeaders(_) => "getheaders",
            PeerMessage::GetData(_) => "getdata",
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        match self {
            PeerMessage::Headers(headers) => {
                encoder.write_varint(headers.len() as u64);
                for header in headers {
                    Encodable::consensus_encode(header, &mut encoder);
                    // Transaction count, always zero in a headers message.
                    encoder.write_varint(0);
                }
            }
            PeerMessage::Block(block) => Encodable::consensus_encode(block, &mut encoder),
            PeerMessage::Inv(items) | PeerMessage::GetData(items) => {
                items.consensus_encode(&mut encoder)
            }
            PeerMessage::GetHeaders(locator) => {
                encoder.write_i32_le(PROTOCOL_VERSION);
                encoder.write_varint(locator.hashes.len() as u64);
                for hash in &locator.hashes {
                    encoder.write_hash(hash);
                }
                encoder.write_hash(&locator.stop);
            }
        }
        encoder.into_inner()
    }

    /// `None` for commands the reactor has no use for.
    pub fn decode(command: &str, payload: &[u8]) -> Result<Option<Self>, DecodeError> {
        let message = match command {
            "headers" => PeerMessage::Headers(decode_headers(payload)?),
            "block" => PeerMessage::Block(decode(payload)?),
            "inv" => PeerMessage::Inv(decode_inventory(payload)?),
            "getdata" => PeerMessage::GetData(decode_inventory(payload)?),
            "getheaders" => PeerMessage::GetHeaders(decode_getheaders(payload)?),
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

fn decode_headers(payload: &[u8]) -> Result<Vec<BlockHeader>, DecodeError> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_len()?;
    if count > MAX_HEADERS_RESULTS {
        return Err(DecodeError::SizeTooLarge);
    }
    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        headers.push(<BlockHeader as Decodable>::consensus_decode(&mut decoder)?);
        if decoder.read_varint()? != 0 {
            return Err(DecodeError::InvalidData("headers entry carries transactions"));
        }
    }
    if !decoder.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(headers)
}

fn decode_inventory(payload: &[u8]) -> Result<Vec<Inventory>, DecodeError> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_len()?;
    if count > MAX_INV_RESULTS {
        return Err(DecodeError::SizeTooLarge);
    }
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(Inventory::consensus_decode(&mut decoder)?);
    }
    if !decoder.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(items)
}

fn decode_getheaders(payload: &[u8]) -> Result<Locator, DecodeError> {
    let mut decoder = Decoder::new(payload);
    let _protocol_version = decoder.read_i32_le()?;
    let count = decoder.read_len()?;
    if count > MAX_LOCATOR_HASHES {
        return Err(DecodeError::SizeTooLarge);
    }
    let mut hashes = Vec::with_capacity(count);
    for _ in 0..count {
        hashes.push(decoder.read_hash()?);
    }
    let stop = decoder.read_hash()?;
    if !decoder.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(Locator { hashes, stop })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block: [7u8; 32],
            merkle_root: [9u8; 32],
            time: 1_296_688_602,
            bits: 0x207f_ffff,
            nonce,
        }
    }

    fn reparse(message: &PeerMessage) -> PeerMessage {
        PeerMessage::decode(message.command(), &message.encode_payload())
            .expect("decode")
            .expect("known command")
    }

    #[test]
    fn headers_payload_carries_zero_tx_counts() {
        let message = PeerMessage::Headers(vec![header(1), header(2)]);
        let payload = message.encode_payload();
        assert_eq!(payload.len(), 1 + 2 * (80 + 1));
        assert_eq!(payload[81], 0);
        assert_eq!(reparse(&message), message);
    }

    #[test]
    fn headers_with_transactions_are_rejected() {
        let mut payload = PeerMessage::Headers(vec![header(1)]).encode_payload();
        let last = payload.len() - 1;
        payload[last] = 1;
        assert!(PeerMessage::decode("headers", &payload).is_err());
    }

    #[test]
    fn getheaders_keeps_locator_and_stop() {
        let locator = Locator {
            hashes: vec![[3u8; 32], [2u8; 32], [0u8; 32]],
            stop: [0u8; 32],
        };
        let message = PeerMessage::GetHeaders(locator);
        let payload = message.encode_payload();
        assert_eq!(&payload[..4], &PROTOCOL_VERSION.to_le_bytes());
        assert_eq!(reparse(&message), message);
    }

    #[test]
    fn inventory_types() {
        let message =
            PeerMessage::GetData(vec![Inventory::block([1u8; 32]), Inventory::tx([2u8; 32])]);
        let payload = message.encode_payload();
        assert_eq!(&payload[1..5], &MSG_BLOCK.to_le_bytes());
        assert_eq!(reparse(&message), message);

        let mut bogus = payload.clone();
        bogus[1] = 9;
        assert!(PeerMessage::decode("inv", &bogus).is_err());
    }

    #[test]
    fn unrelated_commands_are_skipped() {
        assert_eq!(PeerMessage::decode("ping", &[0u8; 8]).expect("decode"), None);
    }
}
