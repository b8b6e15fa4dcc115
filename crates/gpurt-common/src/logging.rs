use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable consulted for the log filter.
pub const LOG_ENV: &str = "GPURT_LOG";

/// Initialize structured logging with environment filter.
/// Set GPURT_LOG=debug (or trace, info, warn, error) for verbosity control.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Like [`init_logging`], but tolerates a subscriber that is already installed.
/// Test binaries call this from every test; only the first call wins.
pub fn try_init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_test_writer()
        .try_init();
}
