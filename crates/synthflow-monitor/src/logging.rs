use std::io;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. Output is discarded unless
/// `SYNTHFLOW_LOG_STDOUT` is truthy, so the watch printer owns stdout.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_enabled = std::env::var("SYNTHFLOW_LOG_STDOUT")
        .ok()
        .and_then(|value| crate::config::parse_bool_flag(&value))
        .unwrap_or(false);
    if stdout_enabled {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::sink)
            .try_init();
    }
}
