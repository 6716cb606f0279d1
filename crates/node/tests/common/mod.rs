#![allow(dead_code)]

use std::sync::Arc;

use bitnode::{Outbound, PeerMessage, Reactor, ReactorHandle};
use bitnode_chainstate::validation::merkle_root;
use bitnode_chainstate::{Chain, ScriptValidation};
use bitnode_consensus::money::COIN;
use bitnode_consensus::{ConsensusParams, Hash256};
use bitnode_pow::check_proof_of_work;
use bitnode_primitives::block::{Block, BlockHeader};
use bitnode_primitives::outpoint::OutPoint;
use bitnode_primitives::transaction::{Transaction, TxIn, TxOut};
use bitnode_storage::memory::MemoryStore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const OP_TRUE: u8 = 0x51;

/// Mines regtest blocks paying to `OP_TRUE`.
#[derive(Clone)]
pub struct Miner {
    params: ConsensusParams,
    pub tip: Hash256,
    pub height: u32,
    pub time: u32,
}

impl Miner {
    pub fn new(params: &ConsensusParams) -> Self {
        Self {
            params: params.clone(),
            tip: params.genesis.hash,
            height: 0,
            time: params.genesis.time,
        }
    }

    pub fn coinbase(&self, height: u32, value: i64) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: height.to_le_bytes().to_vec(),
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value,
                script_pubkey: vec![OP_TRUE],
            }],
            lock_time: 0,
        }
    }

    pub fn mine(&mut self, extra: Vec<Transaction>, fees: i64) -> Block {
        self.mine_claiming(extra, 50 * COIN + fees)
    }

    /// Next block with a coinbase claiming exactly `claim`.
    pub fn mine_claiming(&mut self, extra: Vec<Transaction>, claim: i64) -> Block {
        let height = self.height + 1;
        let mut transactions = vec![self.coinbase(height, claim)];
        transactions.extend(extra);
        let txids: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();
        let (root, _) = merkle_root(&txids).expect("merkle root");
        let mut header = BlockHeader {
            version: 1,
            prev_block: self.tip,
            merkle_root: root,
            time: self.time + 1,
            bits: self.params.genesis.bits,
            nonce: 0,
        };
        while check_proof_of_work(&header.hash(), header.bits, &self.params).is_err() {
            header.nonce += 1;
        }
        self.tip = header.hash();
        self.height = height;
        self.time += 1;
        Block {
            header,
            transactions,
        }
    }
}

pub fn spend(prevout: OutPoint, value: i64) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout,
            script_sig: Vec::new(),
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey: vec![OP_TRUE],
        }],
        lock_time: 0,
    }
}

/// Import `block` straight into `chain`, bypassing the reactor.
pub fn connect(chain: &mut Chain<MemoryStore>, block: &Block) {
    let now = i64::from(block.header.time) + 60;
    chain
        .accept_headers(std::slice::from_ref(&block.header), now)
        .expect("header");
    chain.accept_block(block).expect("block");
}

pub fn open_chain(params: &ConsensusParams, scripts: ScriptValidation) -> Chain<MemoryStore> {
    Chain::open(params.clone(), Arc::new(MemoryStore::new()), scripts).expect("open chain")
}

/// A running reactor over an in-memory chain.
pub struct Node {
    pub handle: ReactorHandle,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
    task: JoinHandle<Chain<MemoryStore>>,
}

impl Node {
    pub fn start(chain: Chain<MemoryStore>) -> Self {
        Self::start_with(chain, |reactor| reactor)
    }

    /// Start a reactor after `configure` adjusted it.
    pub fn start_with(
        chain: Chain<MemoryStore>,
        configure: impl FnOnce(Reactor<MemoryStore>) -> Reactor<MemoryStore>,
    ) -> Self {
        let (reactor, handle, outbound) = Reactor::new(chain);
        let reactor = configure(reactor);
        Self {
            handle,
            outbound,
            task: tokio::spawn(reactor.run()),
        }
    }

    pub async fn deliver(&self, peer: u64, message: PeerMessage) {
        self.handle.deliver(peer, message).await.expect("reactor running");
    }

    pub async fn info(&self) -> serde_json::Map<String, serde_json::Value> {
        self.handle
            .control("info", Default::default())
            .await
            .expect("reactor running")
    }

    /// Everything sent to peers so far. Call after a control round trip so
    /// earlier events have been handled.
    pub fn sent(&mut self) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(message) = self.outbound.try_recv() {
            out.push(message);
        }
        out
    }

    pub async fn stop(self) -> Chain<MemoryStore> {
        let answer = self
            .handle
            .control("stop", Default::default())
            .await
            .expect("reactor running");
        assert_eq!(answer.get("stopping"), Some(&serde_json::Value::Bool(true)));
        self.task.await.expect("reactor task")
    }
}
