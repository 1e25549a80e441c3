#![allow(dead_code)]

use serde_json::Value;
use worker_bridge::worker::Outcome;
use worker_bridge::{BridgeConfig, WorkerCommand, WorkerManager, WorkerType};

pub fn mock_worker() -> WorkerCommand {
    WorkerCommand::new(env!("CARGO_BIN_EXE_mock-worker"))
}

/// Config running the mock worker for `types`, with the watchdog and sweeper
/// off so tests drive them explicitly.
pub fn config_for(types: &[WorkerType]) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    for worker_type in types {
        config = config.with_worker(*worker_type, mock_worker());
    }
    config.health.enabled = false;
    config.health.backoff_base_ms = 10;
    config.cache.sweep_interval_secs = 0;
    config.timeouts.call_ms = 5_000;
    config.timeouts.health_probe_ms = 300;
    config.timeouts.shutdown_grace_ms = 500;
    config
}

/// Success data of a manager call, panicking on any failure
pub async fn call_ok(
    manager: &WorkerManager,
    worker_type: WorkerType,
    action: &str,
    payload: Value,
) -> Value {
    let response = manager
        .execute(worker_type, action, payload, None)
        .await
        .unwrap_or_else(|e| panic!("{worker_type}.{action} failed: {e}"));
    match response.outcome {
        Outcome::Success(data) => data,
        Outcome::Failure { code, message } => {
            panic!("{worker_type}.{action} reported {code}: {message}")
        }
    }
}

pub async fn pid_of(manager: &WorkerManager, worker_type: WorkerType) -> u64 {
    call_ok(manager, worker_type, "pid", Value::Null).await["pid"]
        .as_u64()
        .unwrap_or_else(|| panic!("{worker_type} did not report a pid"))
}
