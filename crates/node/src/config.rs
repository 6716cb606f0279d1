//! Command line and `bitnode.conf` settings for `bitnoded`.
//!
//! Both sources produce the same `key -> values` table. Command line values
//! replace file values key by key; within one source a repeated key keeps
//! every value and scalar settings read the last one.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bitnode_consensus::forks::scaled_threshold;
use bitnode_consensus::{consensus_params, ConsensusParams, Network};
use bitnode_log::{Format, Level, LogConfig};
use bitnode_script::PoolConfig;

pub const CONF_FILE_NAME: &str = "bitnode.conf";
const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_SCRIPT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_SCRIPT_RETRIES: u32 = 3;

const KNOWN_KEYS: [&str; 12] = [
    "network",
    "datadir",
    "conf",
    "backend",
    "loglevel",
    "logformat",
    "logtimestamps",
    "checkscript",
    "scriptworkers",
    "scripttimeoutms",
    "scriptretries",
    "majoritywindow",
];

const BOOL_KEYS: [&str; 2] = ["logtimestamps", "checkscript"];

type Settings = HashMap<String, Vec<String>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Fjall => "fjall",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub network: Network,
    pub data_dir: PathBuf,
    pub conf_path: PathBuf,
    pub backend: Backend,
    pub log: LogConfig,
    pub check_script: bool,
    /// Zero verifies scripts in-process.
    pub script_workers: usize,
    pub script_timeout: Duration,
    pub script_retries: u32,
    /// Overrides the network's supermajority window.
    pub majority_window: Option<usize>,
    /// Keys in the conf file that no setting reads.
    pub ignored_conf_keys: Vec<String>,
}

impl Config {
    pub fn params(&self) -> ConsensusParams {
        let mut params = consensus_params(self.network);
        if let Some(window) = self.majority_window {
            params.majority_window = window;
            params.majority_reject_block_outdated = scaled_threshold(window, 95);
        }
        params
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            timeout: self.script_timeout,
            max_retries: self.script_retries,
        }
    }

    /// Database directory; each network keeps its own.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(self.network.as_str()).join("db")
    }
}

#[derive(Debug)]
pub enum CliAction {
    Run(Box<Config>),
    PrintHelp,
    PrintVersion,
}

pub fn usage() -> String {
    [
        "Usage: bitnoded [help|version] [--flag value | --flag=value]...",
        "",
        "Every flag can also be set as key=value in <datadir>/bitnode.conf.",
        "Command line values win over the file.",
        "",
        "  --network <mainnet|testnet|regtest>   chain to follow (default mainnet)",
        "  --datadir <path>                      data directory (default ./data)",
        "  --conf <path>                         config file (default <datadir>/bitnode.conf)",
        "  --backend <fjall|memory>              storage backend (default fjall)",
        "  --loglevel <error|warn|info|debug|trace>",
        "  --logformat <text|json>",
        "  --logtimestamps <bool>",
        "  --checkscript <bool>                  verify input scripts (default true)",
        "  --scriptworkers <n>                   external script workers, 0 = in-process",
        "  --scripttimeoutms <ms>                wait per script batch delivery (default 30000)",
        "  --scriptretries <n>                   redeliveries before a batch fails (default 3)",
        "  --majoritywindow <n>                  supermajority window override",
        "",
        "Boolean flags may be given bare (--checkscript) or negated (--no-checkscript).",
    ]
    .join("\n")
}

pub fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

pub fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut cli: Settings = HashMap::new();
    let mut args = raw_args.into_iter().peekable();

    if let Some(first) = args.peek().map(String::as_str) {
        match first {
            "help" | "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "version" | "--version" | "-V" => return Ok(CliAction::PrintVersion),
            _ => {}
        }
    }

    while let Some(arg) = args.next() {
        let Some(flag) = arg.strip_prefix("--") else {
            return Err(format!("unexpected argument '{arg}'\n{}", usage()));
        };
        if flag == "help" {
            return Ok(CliAction::PrintHelp);
        }
        let (name, inline) = match flag.split_once('=') {
            Some((name, value)) => (name, Some(value.to_string())),
            None => (flag, None),
        };
        let mut key = normalize_key(name);
        let mut negated = false;
        if !KNOWN_KEYS.contains(&key.as_str()) {
            if let Some(base) = key.strip_prefix("no").filter(|base| BOOL_KEYS.contains(base)) {
                key = base.to_string();
                negated = true;
            } else {
                return Err(format!("unknown flag '--{name}'\n{}", usage()));
            }
        }
        let value = if negated {
            if inline.is_some() {
                return Err(format!("--{name} takes no value\n{}", usage()));
            }
            "0".to_string()
        } else if let Some(value) = inline {
            value
        } else if BOOL_KEYS.contains(&key.as_str()) {
            match args.peek() {
                Some(next) if !next.starts_with("--") => args.next().unwrap_or_default(),
                _ => String::new(),
            }
        } else {
            args.next()
                .filter(|value| !value.starts_with("--"))
                .ok_or_else(|| format!("missing value for --{name}\n{}", usage()))?
        };
        cli.entry(key).or_default().push(value);
    }

    let data_dir = last(&cli, "datadir")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let conf_path = last(&cli, "conf")
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join(CONF_FILE_NAME));
    let file = load_conf(&conf_path)?.unwrap_or_default();

    let ignored_conf_keys = {
        let mut keys: Vec<String> = file
            .keys()
            .filter(|key| !KNOWN_KEYS.contains(&key.as_str()))
            .cloned()
            .collect();
        keys.sort();
        keys
    };
    let settings = merge(file, cli);
    let config = build(&settings, &conf_path, ignored_conf_keys)?;
    Ok(CliAction::Run(Box::new(config)))
}

/// `--data-dir`, `--dataDir` and `datadir` all name the same key.
fn normalize_key(raw: &str) -> String {
    raw.chars()
        .filter(|c| *c != '-' && *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Command line entries replace the file's entries for the same key.
fn merge(mut file: Settings, cli: Settings) -> Settings {
    for (key, values) in cli {
        file.insert(key, values);
    }
    file
}

fn last<'a>(settings: &'a Settings, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .and_then(|values| values.last())
        .map(String::as_str)
}

fn build(
    settings: &Settings,
    conf_path: &Path,
    ignored_conf_keys: Vec<String>,
) -> Result<Config, String> {
    let invalid = |key: &str, raw: &str| format!("invalid {key} '{raw}'");

    let network = match last(settings, "network") {
        Some(raw) => Network::parse(raw).ok_or_else(|| invalid("network", raw))?,
        None => Network::Mainnet,
    };
    let data_dir = last(settings, "datadir")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let backend = match last(settings, "backend") {
        Some(raw) => Backend::parse(raw).ok_or_else(|| invalid("backend", raw))?,
        None => Backend::Fjall,
    };

    let mut log = LogConfig::default();
    if let Some(raw) = last(settings, "loglevel") {
        log.level = Level::parse(raw).ok_or_else(|| invalid("loglevel", raw))?;
    }
    if let Some(raw) = last(settings, "logformat") {
        log.format = Format::parse(raw).ok_or_else(|| invalid("logformat", raw))?;
    }
    if let Some(raw) = last(settings, "logtimestamps") {
        log.timestamps = parse_bool(raw).ok_or_else(|| invalid("logtimestamps", raw))?;
    }

    let check_script = match last(settings, "checkscript") {
        Some(raw) => parse_bool(raw).ok_or_else(|| invalid("checkscript", raw))?,
        None => true,
    };
    let script_workers = match last(settings, "scriptworkers") {
        Some(raw) => raw.trim().parse::<usize>().map_err(|_| invalid("scriptworkers", raw))?,
        None => 0,
    };
    let script_timeout_ms = match last(settings, "scripttimeoutms") {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|ms| *ms > 0)
            .ok_or_else(|| invalid("scripttimeoutms", raw))?,
        None => DEFAULT_SCRIPT_TIMEOUT_MS,
    };
    let script_retries = match last(settings, "scriptretries") {
        Some(raw) => raw.trim().parse::<u32>().map_err(|_| invalid("scriptretries", raw))?,
        None => DEFAULT_SCRIPT_RETRIES,
    };
    let majority_window = match last(settings, "majoritywindow") {
        Some(raw) => Some(
            raw.trim()
                .parse::<usize>()
                .ok()
                .filter(|window| *window > 0)
                .ok_or_else(|| invalid("majoritywindow", raw))?,
        ),
        None => None,
    };

    Ok(Config {
        network,
        data_dir,
        conf_path: conf_path.to_path_buf(),
        backend,
        log,
        check_script,
        script_workers,
        script_timeout: Duration::from_millis(script_timeout_ms),
        script_retries,
        majority_window,
        ignored_conf_keys,
    })
}

/// `None` when the file does not exist.
pub fn load_conf(path: &Path) -> Result<Option<HashMap<String, Vec<String>>>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("{}: {err}", path.display())),
    };
    Ok(Some(parse_conf(&contents)))
}

fn parse_conf(contents: &str) -> Settings {
    let mut out: Settings = HashMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line;
        if let Some(idx) = line.find(['#', ';']) {
            line = &line[..idx];
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(normalize_key(key))
            .or_default()
            .push(value.to_string());
    }
    out
}

fn parse_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
