use super::{report, Status};
use worker_bridge::{Bridge, BridgeConfig, WorkerType};

pub(crate) async fn cmd_list(config: &BridgeConfig, domain: WorkerType) -> anyhow::Result<Status> {
    let bridge = Bridge::new(config)?;
    let result = bridge.coordinator().list(domain).await;
    bridge.shutdown().await;
    report(result)
}

pub(crate) async fn cmd_ensure(
    config: &BridgeConfig,
    domain: WorkerType,
    id: &str,
) -> anyhow::Result<Status> {
    let bridge = Bridge::new(config)?;
    let result = bridge.coordinator().ensure(domain, id).await;
    bridge.shutdown().await;
    report(result)
}
