//! `bitnoded`: follows the best proof-of-work chain from peer headers and
//! blocks, validating each block against the unspent set.

pub mod config;
pub mod control;
mod daemon;
pub mod events;
pub mod messages;
pub mod reactor;

pub use daemon::{run_entry, WORKER_BIN};
pub use events::{ChainEvent, Event, Outbound};
pub use messages::{InvKind, Inventory, PeerId, PeerMessage};
pub use reactor::{Reactor, ReactorClosed, ReactorHandle};
