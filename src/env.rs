//! Environment lookups. One function per variable, each traced on resolution.

use std::path::PathBuf;

const ENV_CONFIG: &str = "WORKER_BRIDGE_CONFIG";
const ENV_CONFIG_DIR: &str = "WORKER_BRIDGE_CONFIG_DIR";
const ENV_LOG_FORMAT: &str = "WORKER_BRIDGE_LOG_FORMAT";

const FALLBACK_CONFIG_DIR: &str = "~/.config";
const BRIDGE_SUBDIR: &str = "worker-bridge";
const CONFIG_FILE: &str = "config.toml";

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Config directory ($WORKER_BRIDGE_CONFIG_DIR or ~/.config/worker-bridge)
pub fn config_dir() -> PathBuf {
    let dir = env_opt(ENV_CONFIG_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_CONFIG_DIR))
                .join(BRIDGE_SUBDIR)
        });
    tracing::trace!(dir = %dir.display(), "Resolved config directory");
    dir
}

/// Config file ($WORKER_BRIDGE_CONFIG or <config_dir>/config.toml)
pub fn config_path() -> PathBuf {
    let path = env_opt(ENV_CONFIG)
        .map(PathBuf::from)
        .unwrap_or_else(|| config_dir().join(CONFIG_FILE));
    tracing::trace!(path = %path.display(), "Resolved config path");
    path
}

/// Log format override ($WORKER_BRIDGE_LOG_FORMAT, "json" or "pretty")
pub fn log_format() -> Option<String> {
    let val = env_opt(ENV_LOG_FORMAT);
    tracing::trace!(value = ?val, "WORKER_BRIDGE_LOG_FORMAT env var");
    val
}
