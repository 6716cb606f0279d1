//! What flows into the reactor and what it announces.

use bitnode_chainstate::{Locator, SegmentId};
use bitnode_consensus::money::Amount;
use bitnode_consensus::Hash256;
use bitnode_log::log_trace;
use bitnode_primitives::block::{Block, BlockHeader};
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::messages::{Inventory, PeerId, PeerMessage};

pub type ControlReply = oneshot::Sender<Map<String, Value>>;

/// Input to the reactor.
#[derive(Debug)]
pub enum Event {
    HeadersReceived {
        peer: PeerId,
        headers: Vec<BlockHeader>,
    },
    BlockReceived {
        peer: PeerId,
        block: Block,
    },
    InvReceived {
        peer: PeerId,
        items: Vec<Inventory>,
    },
    HeadersRequested {
        peer: PeerId,
        locator: Locator,
    },
    Control {
        command: String,
        params: Map<String, Value>,
        reply: ControlReply,
    },
}

impl Event {
    /// Route a decoded peer message. Requests for data this node does not
    /// serve yield `None`.
    pub fn from_peer(peer: PeerId, message: PeerMessage) -> Option<Self> {
        match message {
            PeerMessage::Headers(headers) => Some(Event::HeadersReceived { peer, headers }),
            PeerMessage::Block(block) => Some(Event::BlockReceived { peer, block }),
            PeerMessage::Inv(items) => Some(Event::InvReceived { peer, items }),
            PeerMessage::GetHeaders(locator) => Some(Event::HeadersRequested { peer, locator }),
            PeerMessage::GetData(items) => {
                log_trace!("peer {peer} asked for {} items; blocks are not served", items.len());
                None
            }
        }
    }

    pub fn peer(&self) -> Option<PeerId> {
        match self {
            Event::HeadersReceived { peer, .. }
            | Event::BlockReceived { peer, .. }
            | Event::InvReceived { peer, .. }
            | Event::HeadersRequested { peer, .. } => Some(*peer),
            Event::Control { .. } => None,
        }
    }

    /// Whether handling this event may change the chain.
    pub fn mutates_chain(&self) -> bool {
        match self {
            Event::HeadersReceived { .. } | Event::BlockReceived { .. } => true,
            Event::Control { command, .. } => command == crate::control::STOP,
            Event::InvReceived { .. } | Event::HeadersRequested { .. } => false,
        }
    }
}

/// A message the reactor wants delivered to a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outbound {
    pub peer: PeerId,
    pub message: PeerMessage,
}

/// Tip notifications published on the reactor's broadcast channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainEvent {
    /// A segment's headers tip moved.
    HeadersTip {
        segment: SegmentId,
        hash: Hash256,
        height: u32,
    },
    /// A block was validated on the best chain.
    BlockTip {
        hash: Hash256,
        height: u32,
        transactions: usize,
        fees: Amount,
    },
    /// Another segment became the best chain.
    BestChainChanged {
        segment: SegmentId,
        hash: Hash256,
        height: u32,
    },
}
