use tracing_subscriber::EnvFilter;

pub const ENV_LOG: &str = "SCHOOLD_LOG";
const DEFAULT_DIRECTIVE: &str = "schoold=info";

/// Logs go to stderr; stdout carries the IPC protocol.
pub fn init() {
    let filter = EnvFilter::try_from_env(ENV_LOG)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
