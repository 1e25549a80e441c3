//! Tracing subscriber setup for the binaries.

use crate::config::LoggingConfig;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` wins over the configured level;
/// `WORKER_BRIDGE_LOG_FORMAT` wins over the configured format.
///
/// Logs go to stderr so stdout stays free for command output.
pub fn init(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let format = crate::env::log_format().unwrap_or_else(|| config.format.clone());

    let result = match format.as_str() {
        "json" => fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init(),
        _ => fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init(),
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "Tracing subscriber already installed");
    }
}

/// Run `f` under a temporary stderr subscriber filtered by `RUST_LOG` alone.
///
/// Covers work done before the configured subscriber can exist, such as
/// loading the configuration that names the log level.
pub fn bootstrap<T>(f: impl FnOnce() -> T) -> T {
    let subscriber = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::with_default(subscriber, f)
}
