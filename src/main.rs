mod canon;
mod config;
mod db;
mod entities;
mod error;
mod ipc;
mod logging;
mod metrics;
mod remote;
mod repo;
mod store;

use std::io::{self, BufRead, Write};

fn main() {
    logging::init();
    let config = config::Config::from_env();
    tracing::info!(remote = ?config.base_url, "schoold starting");
    let mut state = ipc::AppState::new(config);

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => ipc::handle_request(&mut state, req),
            Err(e) => {
                tracing::debug!(error = %e, "unparsable request line");
                ipc::bad_json(e.to_string())
            }
        };
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}
