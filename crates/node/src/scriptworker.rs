//! Script-check worker: one JSON request per stdin line, one JSON answer per
//! stdout line.

use std::io::{self, BufRead, Write};

use bitnode_log::{self as logging, log_error, Level, LogConfig};
use bitnode_script::protocol::process_line;
use bitnode_script::StandardVerifier;

fn main() {
    logging::init(LogConfig {
        level: Level::Warn,
        ..LogConfig::default()
    });
    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                log_error!("reading request: {err}");
                std::process::exit(1);
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let response = process_line(&StandardVerifier, &line);
        if writeln!(stdout, "{response}").and_then(|_| stdout.flush()).is_err() {
            return;
        }
    }
}
