use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. Filter via `RUST_LOG`, defaulting
/// to `info`.
pub fn init() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("install tracing subscriber: {e}"))
}
