use tracing_subscriber::{EnvFilter, fmt};

/// Installs the global `tracing` subscriber. `RUST_LOG` wins over
/// `default_filter`. Records emitted through the `log` facade by
/// `mural-core` are bridged into the same subscriber.
///
/// Returns `false` when a subscriber was already installed.
pub fn init_logging(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    fmt()
        .with_target(true)
        .with_timer(fmt::time::uptime())
        .with_level(true)
        .with_ansi(false)
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}
