use super::{report, Status};
use anyhow::Context;
use serde_json::Value;
use std::time::Duration;
use worker_bridge::worker::Outcome;
use worker_bridge::{Bridge, BridgeConfig, BridgeError, WorkerType};

pub(crate) async fn cmd_call(
    config: &BridgeConfig,
    worker: WorkerType,
    action: &str,
    data: Option<String>,
    timeout_ms: Option<u64>,
) -> anyhow::Result<Status> {
    let payload = match data {
        Some(raw) => serde_json::from_str(&raw).context("--data is not valid JSON")?,
        None => Value::Object(Default::default()),
    };

    let bridge = Bridge::new(config)?;
    let result = bridge
        .manager()
        .execute(worker, action, payload, timeout_ms.map(Duration::from_millis))
        .await
        .and_then(|response| match response.outcome {
            Outcome::Success(data) => Ok(data),
            Outcome::Failure { code, message } => Err(BridgeError::Worker {
                worker,
                code,
                message,
            }),
        });
    bridge.shutdown().await;

    report(result)
}
