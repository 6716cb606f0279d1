//! Process wiring for `bitnoded`: settings, logging, storage, script
//! verification, the reactor and its control surface on stdin.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use bitnode_chainstate::{Chain, ScriptValidation};
use bitnode_consensus::ConsensusParams;
use bitnode_log::{self as logging, log_debug, log_info, log_warn};
use bitnode_script::{ProcessTransport, StandardVerifier, WorkerPool, WorkerTransport};
use bitnode_storage::fjall::FjallStore;
use bitnode_storage::memory::MemoryStore;
use bitnode_storage::KeyValueStore;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};

use crate::config::{self, Backend, CliAction, Config};
use crate::control::{self, ControlRequest};
use crate::events::{ChainEvent, Outbound};
use crate::reactor::{Reactor, ReactorHandle};

/// Log records kept in memory for the `info` command.
const LOG_CAPTURE: usize = 512;
pub const WORKER_BIN: &str = "bitnode-scriptworker";

pub async fn run_entry() -> Result<(), String> {
    match config::parse_args()? {
        CliAction::PrintHelp => {
            println!("{}", config::usage());
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("bitnoded {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::Run(config) => run_with_config(*config).await,
    }
}

async fn run_with_config(config: Config) -> Result<(), String> {
    logging::init(config.log);
    logging::enable_capture(LOG_CAPTURE);
    for key in &config.ignored_conf_keys {
        log_warn!("ignoring unknown key '{key}' in {}", config.conf_path.display());
    }
    log_info!(
        "Startup: network={}, backend={}, data_dir={}",
        config.network.as_str(),
        config.backend.as_str(),
        config.data_dir.display()
    );

    let params = config.params();
    let scripts = script_validation(&config)?;
    match config.backend {
        Backend::Memory => serve(params, Arc::new(MemoryStore::new()), scripts).await,
        Backend::Fjall => {
            let path = config.db_path();
            fs::create_dir_all(&path).map_err(|err| format!("{}: {err}", path.display()))?;
            let store = FjallStore::open(&path).map_err(|err| err.to_string())?;
            serve(params, Arc::new(store), scripts).await
        }
    }
}

fn worker_program() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let candidate = exe
        .parent()?
        .join(format!("{WORKER_BIN}{}", std::env::consts::EXE_SUFFIX));
    candidate.is_file().then_some(candidate)
}

fn script_validation(config: &Config) -> Result<ScriptValidation, String> {
    let mut scripts = if config.script_workers == 0 {
        ScriptValidation::inline(StandardVerifier)
    } else {
        let pool = match worker_program() {
            Some(program) => {
                let transports = (0..config.script_workers)
                    .map(|_| {
                        ProcessTransport::spawn(&program, &[]).map(|transport| {
                            Box::new(transport.with_reply_timeout(config.script_timeout))
                                as Box<dyn WorkerTransport>
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|err| err.to_string())?;
                log_info!(
                    "started {} script workers ({})",
                    transports.len(),
                    program.display()
                );
                WorkerPool::new(transports, config.pool_config())
            }
            None => {
                log_warn!(
                    "{WORKER_BIN} not found next to bitnoded; checking scripts on in-process workers"
                );
                WorkerPool::local(config.script_workers, StandardVerifier, config.pool_config())
            }
        }
        .map_err(|err| err.to_string())?;
        ScriptValidation::pool(Arc::new(pool))
    };
    scripts.set_active(config.check_script);
    if !config.check_script {
        log_warn!("script verification is disabled");
    }
    Ok(scripts)
}

async fn serve<S: KeyValueStore + 'static>(
    params: ConsensusParams,
    store: Arc<S>,
    scripts: ScriptValidation,
) -> Result<(), String> {
    let chain = Chain::open(params, store, scripts).map_err(|err| err.to_string())?;
    let (reactor, handle, outbound) = Reactor::new(chain);
    let reactor = tokio::spawn(reactor.run());

    tokio::spawn(drain_outbound(outbound));
    tokio::spawn(log_chain_events(handle.subscribe()));
    tokio::spawn(control_on_stdin(handle.clone()));
    tokio::spawn(stop_on_signal(handle.clone()));
    drop(handle);

    reactor
        .await
        .map(|_| ())
        .map_err(|err| format!("reactor task failed: {err}"))
}

/// No peer transport is attached; outbound requests are only logged.
async fn drain_outbound(mut outbound: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(Outbound { peer, message }) = outbound.recv().await {
        log_debug!("no transport for peer {peer}; dropped {}", message.command());
    }
}

async fn log_chain_events(mut events: broadcast::Receiver<ChainEvent>) {
    loop {
        match events.recv().await {
            Ok(ChainEvent::BestChainChanged { segment, height, .. }) => {
                log_info!("notify: best chain switched to segment {segment} at height {height}");
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log_warn!("notify: skipped {skipped} chain events");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// One control request per line; one JSON answer per line on stdout.
async fn control_on_stdin(handle: ReactorHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let answer = match ControlRequest::parse(&line) {
            Ok(request) => match handle.control(&request.command, request.params).await {
                Ok(answer) => answer,
                Err(err) => control::error_map(&err.to_string()),
            },
            Err(err) => control::error_map(&err),
        };
        let mut encoded = serde_json::Value::Object(answer).to_string();
        encoded.push('\n');
        if stdout.write_all(encoded.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
            return;
        }
    }
}

async fn stop_on_signal(handle: ReactorHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(err) => {
                log_warn!("failed to install SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    log_info!("Signal received; requesting shutdown.");
    let _ = handle.control(control::STOP, control::Params::new()).await;
}
