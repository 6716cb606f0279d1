//! Script-check worker pool.
//!
//! Jobs travel to worker threads over a crossbeam channel as protocol
//! request lines; each worker hands the line to its transport and reports
//! the answer back on the batch's reply channel keyed by `(batch, index)`.
//! Unanswered jobs are redelivered after `timeout` until `max_retries` is
//! exhausted.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bitnode_consensus::hash256_to_hex;
use bitnode_log::{log_debug, log_info, log_warn};
use bitnode_primitives::hex::to_hex;
use bitnode_primitives::transaction::Transaction;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::protocol::{process_line, ScriptCheckRequest, ScriptCheckResponse};
use crate::verifier::ScriptVerifier;
use crate::ScriptFlags;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Some jobs never answered within `attempts` deliveries.
    Timeout { unanswered: usize, attempts: u32 },
    Protocol(String),
    Spawn(String),
    Disconnected,
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::Timeout {
                unanswered,
                attempts,
            } => write!(
                f,
                "{unanswered} script checks unanswered after {attempts} attempts"
            ),
            WorkerError::Protocol(message) => write!(f, "worker protocol error: {message}"),
            WorkerError::Spawn(message) => write!(f, "failed to start script worker: {message}"),
            WorkerError::Disconnected => write!(f, "script worker pool is shut down"),
        }
    }
}

impl std::error::Error for WorkerError {}

/// Carries one request line to a worker and returns its response line.
/// `None` means the request or its answer was lost.
pub trait WorkerTransport: Send + Sync {
    fn call(&self, request: &str) -> Option<String>;
}

/// Answers in-process through a verifier.
pub struct LocalTransport<V> {
    verifier: V,
}

impl<V: ScriptVerifier> LocalTransport<V> {
    pub fn new(verifier: V) -> Self {
        Self { verifier }
    }
}

impl<V: ScriptVerifier> WorkerTransport for LocalTransport<V> {
    fn call(&self, request: &str) -> Option<String> {
        Some(process_line(&self.verifier, request))
    }
}

/// Talks JSON lines to a child process (normally `bitnode-scriptworker`).
///
/// Replies are read on a helper thread so a hung child costs at most
/// `reply_timeout`. A child that stalls or exits is killed and replaced on
/// the next call.
pub struct ProcessTransport {
    program: PathBuf,
    args: Vec<String>,
    reply_timeout: Duration,
    child: Mutex<Option<ChildIo>>,
    restarts: AtomicU32,
}

struct ChildIo {
    child: Child,
    stdin: ChildStdin,
    lines: Receiver<String>,
}

impl ChildIo {
    fn spawn(program: &Path, args: &[String]) -> Result<Self, WorkerError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| WorkerError::Spawn(format!("{}: {err}", program.display())))?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(WorkerError::Spawn("child stdio unavailable".to_string()));
        };
        let (line_tx, lines) = unbounded();
        let reader = std::thread::Builder::new()
            .name("script-worker-reader".to_string())
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
            });
        if let Err(err) = reader {
            let _ = child.kill();
            let _ = child.wait();
            return Err(WorkerError::Spawn(err.to_string()));
        }
        Ok(Self {
            child,
            stdin,
            lines,
        })
    }

    fn exchange(&mut self, request: &str, timeout: Duration) -> Result<String, &'static str> {
        writeln!(self.stdin, "{request}")
            .and_then(|_| self.stdin.flush())
            .map_err(|_| "request not delivered")?;
        match self.lines.recv_timeout(timeout) {
            Ok(line) => Ok(line.trim_end().to_string()),
            Err(RecvTimeoutError::Timeout) => Err("no answer in time"),
            Err(RecvTimeoutError::Disconnected) => Err("worker exited"),
        }
    }
}

impl Drop for ChildIo {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl ProcessTransport {
    pub fn spawn(program: &Path, args: &[String]) -> Result<Self, WorkerError> {
        let io = ChildIo::spawn(program, args)?;
        Ok(Self {
            program: program.to_path_buf(),
            args: args.to_vec(),
            reply_timeout: PoolConfig::default().timeout,
            child: Mutex::new(Some(io)),
            restarts: AtomicU32::new(0),
        })
    }

    /// How long one request may wait for its answer before the child is
    /// replaced.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Children started to replace one that stalled or exited.
    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::Relaxed)
    }
}

impl WorkerTransport for ProcessTransport {
    fn call(&self, request: &str) -> Option<String> {
        let mut slot = self.child.lock().ok()?;
        if slot.is_none() {
            match ChildIo::spawn(&self.program, &self.args) {
                Ok(io) => {
                    let restarts = self.restarts.fetch_add(1, Ordering::Relaxed) + 1;
                    log_info!(
                        "restarted script worker {} ({restarts} restarts)",
                        self.program.display()
                    );
                    *slot = Some(io);
                }
                Err(err) => {
                    log_warn!("{err}");
                    return None;
                }
            }
        }
        let io = slot.as_mut()?;
        match io.exchange(request, self.reply_timeout) {
            Ok(line) => Some(line),
            Err(reason) => {
                log_warn!(
                    "script worker {} pid {}: {reason}; replacing it",
                    self.program.display(),
                    io.child.id()
                );
                slot.take();
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub timeout: Duration,
    pub max_retries: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

/// One input to verify.
#[derive(Debug, Clone)]
pub struct ScriptJob {
    pub tx: Arc<Transaction>,
    pub input_index: usize,
    pub script_pubkey: Vec<u8>,
    /// Value of the output being spent.
    pub amount: i64,
    pub flags: ScriptFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub batch: u64,
    pub index: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct ScriptResult {
    pub key: JobKey,
    pub result: bool,
}

struct Envelope {
    key: JobKey,
    request: Arc<ScriptCheckRequest>,
    line: Arc<str>,
    reply: Sender<ScriptResult>,
}

pub struct WorkerPool {
    work: Option<Sender<Envelope>>,
    handles: Vec<JoinHandle<()>>,
    next_batch: AtomicU64,
    config: PoolConfig,
}

impl WorkerPool {
    /// Starts one worker thread per transport.
    pub fn new(transports: Vec<Box<dyn WorkerTransport>>, config: PoolConfig) -> Result<Self, WorkerError> {
        if transports.is_empty() {
            return Err(WorkerError::Spawn("worker pool needs at least one transport".to_string()));
        }
        let (work_tx, work_rx) = unbounded::<Envelope>();
        let mut handles = Vec::with_capacity(transports.len());
        for (id, transport) in transports.into_iter().enumerate() {
            let work_rx = work_rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("script-worker-{id}"))
                .spawn(move || worker_loop(transport, work_rx))
                .map_err(|err| WorkerError::Spawn(err.to_string()))?;
            handles.push(handle);
        }
        Ok(Self {
            work: Some(work_tx),
            handles,
            next_batch: AtomicU64::new(1),
            config,
        })
    }

    pub fn local<V>(workers: usize, verifier: V, config: PoolConfig) -> Result<Self, WorkerError>
    where
        V: ScriptVerifier + Clone + 'static,
    {
        let transports = (0..workers.max(1))
            .map(|_| Box::new(LocalTransport::new(verifier.clone())) as Box<dyn WorkerTransport>)
            .collect();
        Self::new(transports, config)
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    /// Verifies every job and returns the conjunction of the results.
    /// Returns as soon as any job reports `false`.
    pub fn submit(&self, jobs: &[ScriptJob]) -> Result<bool, WorkerError> {
        if jobs.is_empty() {
            return Ok(true);
        }
        let work = self.work.as_ref().ok_or(WorkerError::Disconnected)?;
        let batch = self.next_batch.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = unbounded::<ScriptResult>();

        let mut encoded_txs: Vec<(*const Transaction, String, String)> = Vec::new();
        let mut envelopes = Vec::with_capacity(jobs.len());
        for (index, job) in jobs.iter().enumerate() {
            let ptr = Arc::as_ptr(&job.tx);
            let (txid, raw) = match encoded_txs.iter().find(|(seen, _, _)| *seen == ptr) {
                Some((_, txid, raw)) => (txid.clone(), raw.clone()),
                None => {
                    let txid = hash256_to_hex(&job.tx.txid());
                    let raw = to_hex(&job.tx.consensus_encode());
                    encoded_txs.push((ptr, txid.clone(), raw.clone()));
                    (txid, raw)
                }
            };
            let vin = u32::try_from(job.input_index)
                .map_err(|_| WorkerError::Protocol("input index out of range".to_string()))?;
            let request = ScriptCheckRequest::from_raw(txid, raw, vin, &job.script_pubkey, job.flags);
            let line = serde_json::to_string(&request)
                .map_err(|err| WorkerError::Protocol(err.to_string()))?;
            envelopes.push(Envelope {
                key: JobKey { batch, index },
                request: Arc::new(request),
                line: Arc::from(line),
                reply: reply_tx.clone(),
            });
        }

        let mut answered = vec![false; jobs.len()];
        let mut remaining = jobs.len();
        let mut attempts = 1u32;
        for envelope in &envelopes {
            work.send(envelope.redeliver()).map_err(|_| WorkerError::Disconnected)?;
        }

        let mut deadline = Instant::now() + self.config.timeout;
        loop {
            let wait = deadline.saturating_duration_since(Instant::now());
            match reply_rx.recv_timeout(wait) {
                Ok(ScriptResult { key, result }) => {
                    if key.batch != batch || answered.get(key.index).copied().unwrap_or(true) {
                        log_debug!("ignoring duplicate script result {}:{}", key.batch, key.index);
                        continue;
                    }
                    answered[key.index] = true;
                    remaining -= 1;
                    if !result {
                        return Ok(false);
                    }
                    if remaining == 0 {
                        return Ok(true);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if attempts > self.config.max_retries {
                        return Err(WorkerError::Timeout {
                            unanswered: remaining,
                            attempts,
                        });
                    }
                    attempts += 1;
                    log_warn!(
                        "script batch {batch}: redelivering {remaining} unanswered jobs (attempt {attempts})"
                    );
                    for envelope in envelopes.iter().filter(|e| !answered[e.key.index]) {
                        work.send(envelope.redeliver()).map_err(|_| WorkerError::Disconnected)?;
                    }
                    deadline = Instant::now() + self.config.timeout;
                }
                Err(RecvTimeoutError::Disconnected) => return Err(WorkerError::Disconnected),
            }
        }
    }
}

impl Envelope {
    fn redeliver(&self) -> Envelope {
        Envelope {
            key: self.key,
            request: Arc::clone(&self.request),
            line: Arc::clone(&self.line),
            reply: self.reply.clone(),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.work.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(transport: Box<dyn WorkerTransport>, work: Receiver<Envelope>) {
    while let Ok(envelope) = work.recv() {
        let Some(reply) = transport.call(&envelope.line) else {
            log_debug!(
                "script job {}:{} lost in transport",
                envelope.key.batch,
                envelope.key.index
            );
            continue;
        };
        let response: ScriptCheckResponse = match serde_json::from_str(&reply) {
            Ok(response) => response,
            Err(err) => {
                log_warn!("unreadable script worker reply: {err}");
                continue;
            }
        };
        if response.txid != envelope.request.txid || response.vin != envelope.request.vin {
            log_warn!(
                "script worker answered {}:{} for {}:{}",
                response.txid,
                response.vin,
                envelope.request.txid,
                envelope.request.vin
            );
            continue;
        }
        // The batch may already have returned; a closed reply channel is fine.
        let _ = envelope.reply.send(ScriptResult {
            key: envelope.key,
            result: response.result,
        });
    }
}
