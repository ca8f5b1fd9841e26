//! Console logging bootstrap shared by both service binaries.
//!
//! Filtering comes from `RUST_LOG`, with an optional override passed on the
//! command line (`--log-level`).

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// `level_override` takes precedence over `RUST_LOG`; when neither is set the
/// service logs at `info`.
pub fn init(service: &str, level_override: Option<&str>) {
    let filter = match level_override {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    tracing::info!("{} logging initialized", service);
}
