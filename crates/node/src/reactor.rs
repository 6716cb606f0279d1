//! The event loop that owns the chain.
//!
//! Events are handled one at a time. A block's script batch runs on a
//! blocking thread; while it is outstanding the loop keeps answering events
//! that only read chain state and parks the rest until the block commits.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bitnode_chainstate::{Chain, ChainError, ErrorKind, Locator, ScriptBatch};
use bitnode_consensus::constants::MAX_HEADERS_RESULTS;
use bitnode_consensus::{hash256_to_hex, Hash256};
use bitnode_log::{log_debug, log_error, log_info, log_trace, log_warn};
use bitnode_primitives::block::{Block, BlockHeader};
use bitnode_script::WorkerError;
use bitnode_storage::KeyValueStore;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

use crate::control::{self, Params};
use crate::events::{ChainEvent, Event, Outbound};
use crate::messages::{InvKind, Inventory, PeerId, PeerMessage};

const EVENT_QUEUE: usize = 1024;
const NOTIFY_QUEUE: usize = 256;
/// Blocks requested per `getdata`.
const GETDATA_BATCH: usize = 128;
/// Out-of-order blocks held until their parent connects.
const MAX_PENDING_BLOCKS: usize = 1024;
/// Chain-mutating events parked behind one script barrier.
pub const MAX_DEFERRED_EVENTS: usize = 1024;
/// Peers remembered as candidates for re-requesting blocks.
const MAX_KNOWN_PEERS: usize = 128;
const BLOCK_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub type Clock = fn() -> i64;

pub fn system_clock() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReactorClosed;

impl std::fmt::Display for ReactorClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "reactor has shut down")
    }
}

impl std::error::Error for ReactorClosed {}

/// Cloneable entry point for transports, control surfaces and subscribers.
#[derive(Clone)]
pub struct ReactorHandle {
    events: mpsc::Sender<Event>,
    notify: broadcast::Sender<ChainEvent>,
}

impl ReactorHandle {
    pub async fn send(&self, event: Event) -> Result<(), ReactorClosed> {
        self.events.send(event).await.map_err(|_| ReactorClosed)
    }

    pub async fn deliver(&self, peer: PeerId, message: PeerMessage) -> Result<(), ReactorClosed> {
        match Event::from_peer(peer, message) {
            Some(event) => self.send(event).await,
            None => Ok(()),
        }
    }

    pub async fn control(&self, command: &str, params: Params) -> Result<Params, ReactorClosed> {
        let (reply, answer) = oneshot::channel();
        self.send(Event::Control {
            command: command.to_ascii_lowercase(),
            params,
            reply,
        })
        .await?;
        answer.await.map_err(|_| ReactorClosed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.notify.subscribe()
    }
}

enum Flow {
    Continue,
    Stop,
}

/// An outstanding `getdata` for one block.
#[derive(Clone, Copy, Debug)]
struct Request {
    peer: PeerId,
    deadline: Instant,
}

pub struct Reactor<S> {
    chain: Chain<S>,
    events: mpsc::Receiver<Event>,
    events_closed: bool,
    outbound: mpsc::UnboundedSender<Outbound>,
    notify: broadcast::Sender<ChainEvent>,
    deferred: VecDeque<Event>,
    dropped: usize,
    in_flight: HashMap<Hash256, Request>,
    request_timeout: Duration,
    /// Peers that recently sent us anything, with when.
    peers: HashMap<PeerId, Instant>,
    pending: HashMap<Hash256, (PeerId, Block)>,
    clock: Clock,
}

impl<S: KeyValueStore + 'static> Reactor<S> {
    pub fn new(chain: Chain<S>) -> (Self, ReactorHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (events_tx, events) = mpsc::channel(EVENT_QUEUE);
        let (notify, _) = broadcast::channel(NOTIFY_QUEUE);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let handle = ReactorHandle {
            events: events_tx,
            notify: notify.clone(),
        };
        let reactor = Self {
            chain,
            events,
            events_closed: false,
            outbound,
            notify,
            deferred: VecDeque::new(),
            dropped: 0,
            in_flight: HashMap::new(),
            request_timeout: BLOCK_REQUEST_TIMEOUT,
            peers: HashMap::new(),
            pending: HashMap::new(),
            clock: system_clock,
        };
        (reactor, handle, outbound_rx)
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// How long a requested block may take before it is asked for again.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Process events until `stop` arrives or every handle is dropped.
    /// Hands the chain back on exit.
    pub async fn run(mut self) -> Chain<S> {
        let tip = *self.chain.state().chain().tip();
        log_info!(
            "reactor started: headers at {}, blocks at {}",
            tip.height,
            self.chain.state().last_validated_block().height
        );
        let period = self
            .request_timeout
            .clamp(Duration::from_millis(10), Duration::from_secs(5));
        let mut retry = tokio::time::interval(period);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let event = match self.deferred.pop_front() {
                Some(event) => event,
                None => tokio::select! {
                    received = self.events.recv() => match received {
                        Some(event) => event,
                        None => break,
                    },
                    _ = retry.tick() => {
                        self.retry_expired();
                        continue;
                    }
                },
            };
            if let Flow::Stop = self.handle(event).await {
                break;
            }
        }
        log_info!("reactor stopped");
        self.chain
    }

    async fn handle(&mut self, event: Event) -> Flow {
        let Some(event) = self.try_service(event) else {
            return Flow::Continue;
        };
        match event {
            Event::HeadersReceived { peer, headers } => self.on_headers(peer, headers).await,
            Event::BlockReceived { peer, block } => self.on_block(peer, block).await,
            Event::Control { reply, .. } => {
                let _ = reply.send(control::stopping());
                return Flow::Stop;
            }
            Event::InvReceived { .. } | Event::HeadersRequested { .. } => {}
        }
        Flow::Continue
    }

    /// Handle `event` if it leaves the chain untouched; otherwise hand it
    /// back.
    fn try_service(&mut self, event: Event) -> Option<Event> {
        if let Some(peer) = event.peer() {
            self.heard_from(peer);
        }
        if event.mutates_chain() {
            return Some(event);
        }
        match event {
            Event::InvReceived { peer, items } => self.on_inv(peer, &items),
            Event::HeadersRequested { peer, locator } => self.on_get_headers(peer, &locator),
            Event::Control {
                command,
                params,
                reply,
            } => {
                let _ = reply.send(control::dispatch(&self.chain, &command, &params));
            }
            other => return Some(other),
        }
        None
    }

    fn send(&self, peer: PeerId, message: PeerMessage) {
        log_trace!("-> peer {peer}: {}", message.command());
        if self.outbound.send(Outbound { peer, message }).is_err() {
            log_debug!("outbound queue closed; dropping message for peer {peer}");
        }
    }

    fn publish(&self, event: ChainEvent) {
        // No subscribers is fine.
        let _ = self.notify.send(event);
    }

    fn report(&self, what: &str, err: &ChainError) {
        match err.kind() {
            ErrorKind::Validation => log_debug!("{what} rejected: {err}"),
            ErrorKind::Consistency => log_warn!("{what} not applied: {err}"),
            ErrorKind::Infrastructure => log_error!("{what} failed: {err}"),
            ErrorKind::Stalled => log_error!("{what} not applied: {err}"),
        }
    }

    fn heard_from(&mut self, peer: PeerId) {
        if !self.peers.contains_key(&peer) && self.peers.len() >= MAX_KNOWN_PEERS {
            let oldest = self.peers.iter().min_by_key(|(_, seen)| **seen).map(|(id, _)| *id);
            if let Some(oldest) = oldest {
                self.peers.remove(&oldest);
            }
        }
        self.peers.insert(peer, Instant::now());
    }

    fn ask_headers(&self, peer: PeerId) {
        match self.chain.state().headers_locator() {
            Ok(locator) => self.send(peer, PeerMessage::GetHeaders(locator)),
            Err(err) => self.report("headers locator", &err),
        }
    }

    /// Accept `headers` and announce what moved. False when the batch was
    /// refused.
    fn import_headers(&mut self, peer: PeerId, headers: &[BlockHeader]) -> bool {
        match self.chain.accept_headers(headers, (self.clock)()) {
            Ok(outcome) => {
                if outcome.accepted > 0 {
                    self.publish(ChainEvent::HeadersTip {
                        segment: outcome.segment,
                        hash: outcome.tip.hash,
                        height: outcome.tip.height,
                    });
                }
                if outcome.best_changed {
                    let tip = *self.chain.state().chain().tip();
                    log_info!(
                        "best chain is now segment {} at height {} ({})",
                        outcome.segment,
                        tip.height,
                        hash256_to_hex(&tip.hash)
                    );
                    self.in_flight.clear();
                    self.prune_pending();
                    self.publish(ChainEvent::BestChainChanged {
                        segment: self.chain.state().chain().segment(),
                        hash: tip.hash,
                        height: tip.height,
                    });
                }
                true
            }
            Err(ChainError::UnknownStartHeader(hash)) => {
                log_debug!(
                    "peer {peer} sent headers starting after unknown {}",
                    hash256_to_hex(&hash)
                );
                self.ask_headers(peer);
                false
            }
            Err(err) => {
                self.report(&format!("header batch from peer {peer}"), &err);
                false
            }
        }
    }

    async fn on_headers(&mut self, peer: PeerId, headers: Vec<BlockHeader>) {
        if headers.is_empty() {
            return;
        }
        if !self.import_headers(peer, &headers) {
            return;
        }
        if headers.len() >= MAX_HEADERS_RESULTS {
            self.ask_headers(peer);
        }
        self.connect_pending().await;
        self.request_blocks(peer);
    }

    async fn on_block(&mut self, peer: PeerId, block: Block) {
        let hash = block.header.hash();
        self.in_flight.remove(&hash);
        match self.chain.db().contains_index(&hash) {
            Ok(true) => {}
            Ok(false) => {
                if !self.import_headers(peer, std::slice::from_ref(&block.header)) {
                    return;
                }
            }
            Err(err) => {
                self.report("block lookup", &err);
                return;
            }
        }

        let next = self.chain.state().last_validated_block().height + 1;
        let height = self.chain.state().chain().height_of(&hash);
        match height {
            Some(height) if height == next => {
                if self.connect(peer, block).await {
                    self.connect_pending().await;
                }
            }
            Some(height) if height > next => {
                if self.pending.len() >= MAX_PENDING_BLOCKS {
                    self.prune_pending();
                }
                if self.pending.len() < MAX_PENDING_BLOCKS {
                    log_trace!("holding block {} at height {height}", hash256_to_hex(&hash));
                    self.pending.insert(hash, (peer, block));
                } else {
                    log_debug!("pending block buffer full; dropping {}", hash256_to_hex(&hash));
                }
            }
            _ => log_debug!(
                "ignoring block {} from peer {peer}: not above the validated tip of the best chain",
                hash256_to_hex(&hash)
            ),
        }
        self.request_blocks(peer);
    }

    fn on_inv(&self, peer: PeerId, items: &[Inventory]) {
        let mut unknown_block = false;
        for item in items {
            match item.kind {
                InvKind::Tx => log_trace!("peer {peer} announced tx {}", hash256_to_hex(&item.hash)),
                InvKind::Block => match self.chain.db().contains_index(&item.hash) {
                    Ok(known) => unknown_block |= !known,
                    Err(err) => {
                        self.report("inventory lookup", &err);
                        return;
                    }
                },
            }
        }
        if unknown_block {
            self.ask_headers(peer);
        }
    }

    /// Answer with up to 2000 best-chain headers after the first locator
    /// hash we share with the peer.
    fn on_get_headers(&self, peer: PeerId, locator: &Locator) {
        let view = self.chain.state().chain();
        let fork = locator
            .hashes
            .iter()
            .find_map(|hash| view.height_of(hash))
            .unwrap_or(0);
        let mut headers = Vec::new();
        for height in fork + 1..=view.tip().height {
            let Some(hash) = view.hash_at(height) else {
                break;
            };
            match self.chain.header(&hash) {
                Ok(index) => headers.push(index.header),
                Err(err) => {
                    self.report("headers request", &err);
                    return;
                }
            }
            if hash == locator.stop || headers.len() == MAX_HEADERS_RESULTS {
                break;
            }
        }
        log_debug!("serving {} headers to peer {peer} from height {}", headers.len(), fork + 1);
        self.send(peer, PeerMessage::Headers(headers));
    }

    /// Ask `peer` for the next blocks below the headers tip not already
    /// requested or held.
    fn request_blocks(&mut self, peer: PeerId) {
        self.expire_requests();
        let deadline = Instant::now() + self.request_timeout;
        let mut wanted = Vec::new();
        for hash in self.chain.blocks_to_fetch(GETDATA_BATCH) {
            if self.pending.contains_key(&hash) || self.in_flight.contains_key(&hash) {
                continue;
            }
            self.in_flight.insert(hash, Request { peer, deadline });
            wanted.push(Inventory::block(hash));
        }
        if !wanted.is_empty() {
            log_debug!("requesting {} blocks from peer {peer}", wanted.len());
            self.send(peer, PeerMessage::GetData(wanted));
        }
    }

    /// Forget requests past their deadline. Returns the peers that let
    /// them lapse.
    fn expire_requests(&mut self) -> Vec<PeerId> {
        let now = Instant::now();
        let mut silent = Vec::new();
        self.in_flight.retain(|hash, request| {
            if request.deadline > now {
                return true;
            }
            log_debug!(
                "request for block {} from peer {} timed out",
                hash256_to_hex(hash),
                request.peer
            );
            if !silent.contains(&request.peer) {
                silent.push(request.peer);
            }
            false
        });
        silent
    }

    /// Re-request lapsed blocks, preferring the most recently heard peer
    /// that did not let them lapse.
    fn retry_expired(&mut self) {
        let silent = self.expire_requests();
        if silent.is_empty() {
            return;
        }
        let fallback = silent[0];
        let peer = self
            .peers
            .iter()
            .filter(|(peer, _)| !silent.contains(peer))
            .max_by_key(|(_, seen)| **seen)
            .map_or(fallback, |(peer, _)| *peer);
        log_info!("block download stalled on peer {fallback}; retrying with peer {peer}");
        self.request_blocks(peer);
    }

    /// Drop held blocks that are no longer above the validated tip of the
    /// best chain.
    fn prune_pending(&mut self) {
        let validated = self.chain.state().last_validated_block().height;
        let view = self.chain.state().chain();
        let before = self.pending.len();
        self.pending
            .retain(|hash, _| view.height_of(hash).is_some_and(|height| height > validated));
        let evicted = before - self.pending.len();
        if evicted > 0 {
            log_debug!("evicted {evicted} held blocks off the best chain");
        }
    }

    /// Connect held blocks for as long as the next one is available.
    async fn connect_pending(&mut self) {
        loop {
            let next = self.chain.state().last_validated_block().height + 1;
            let Some(hash) = self.chain.hash_at(next) else {
                return;
            };
            let Some((peer, block)) = self.pending.remove(&hash) else {
                return;
            };
            if !self.connect(peer, block).await {
                return;
            }
        }
    }

    /// Validate and commit one block on top of the validated tip.
    async fn connect(&mut self, peer: PeerId, block: Block) -> bool {
        let what = format!("block {} from peer {peer}", hash256_to_hex(&block.header.hash()));
        let (prepared, batch) = match self.chain.prepare_block(&block) {
            Ok(prepared) => prepared,
            Err(err) => {
                self.report(&what, &err);
                return false;
            }
        };
        let verified = match self.wait_for_scripts(batch).await {
            Ok(verified) => verified,
            Err(err) => {
                self.report(&what, &err);
                return false;
            }
        };
        match self.chain.commit_block(prepared, verified) {
            Ok(outcome) => {
                self.publish(ChainEvent::BlockTip {
                    hash: outcome.index.hash,
                    height: outcome.index.height,
                    transactions: outcome.transactions,
                    fees: outcome.fees,
                });
                true
            }
            Err(err) => {
                self.report(&what, &err);
                false
            }
        }
    }

    /// The script barrier. Events that only read chain state are answered
    /// while the batch runs; the rest wait in `deferred`.
    async fn wait_for_scripts(&mut self, batch: ScriptBatch) -> Result<bool, ChainError> {
        if batch.is_empty() {
            return batch.wait();
        }
        log_trace!("waiting on {} script checks", batch.len());
        let mut barrier = tokio::task::spawn_blocking(move || batch.wait());
        loop {
            tokio::select! {
                joined = &mut barrier => {
                    if self.dropped > 0 {
                        log_warn!("dropped {} peer events while scripts ran", self.dropped);
                        self.dropped = 0;
                    }
                    return joined.unwrap_or_else(|err| {
                        Err(ChainError::Worker(WorkerError::Protocol(format!(
                            "script barrier task failed: {err}"
                        ))))
                    });
                }
                received = self.events.recv(), if !self.events_closed => match received {
                    Some(event) => {
                        if let Some(event) = self.try_service(event) {
                            self.defer(event);
                        }
                    }
                    None => self.events_closed = true,
                },
            }
        }
    }

    /// Park `event` until the barrier lifts. Past the cap, peer data is
    /// dropped; peers announce it again. Control requests always queue.
    fn defer(&mut self, event: Event) {
        if self.deferred.len() < MAX_DEFERRED_EVENTS || matches!(event, Event::Control { .. }) {
            self.deferred.push_back(event);
            return;
        }
        if self.dropped == 0 {
            log_warn!("deferred event queue full; dropping peer data until scripts finish");
        }
        self.dropped += 1;
    }
}
