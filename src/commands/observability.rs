use tracing_subscriber::EnvFilter;

/// Initialize the process-wide tracing subscriber. Respects `RUST_LOG`;
/// defaults to `info`. Emits structured JSON lines so log output is as
/// machine-readable as the `/metrics` endpoint.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).json().init();
}
