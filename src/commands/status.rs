use super::{print_json, Status};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use worker_bridge::worker::{HealthManager, HealthStatus};
use worker_bridge::{Bridge, BridgeConfig};

pub(crate) async fn cmd_status(
    config: &BridgeConfig,
    probe: bool,
    lines: usize,
) -> anyhow::Result<Status> {
    let bridge = Bridge::new(config)?;
    let manager = bridge.manager();

    let mut probes = BTreeMap::new();
    if probe {
        let health = HealthManager::new(Arc::clone(manager));
        for worker in manager.configured() {
            // drop the lease right away so the probe can take the permit
            if let Err(e) = manager.acquire(worker).await {
                tracing::warn!(%worker, error = %e, "Worker could not be started");
            }
            probes.insert(worker, health.check(worker).await);
        }
    }

    let workers = manager.status().await;
    let summary = HealthStatus::from_manager(manager).await;
    let logs: BTreeMap<_, _> = manager
        .configured()
        .into_iter()
        .filter(|_| lines > 0)
        .map(|worker| (worker, manager.logs(worker, lines)))
        .collect();

    bridge.shutdown().await;

    print_json(&json!({
        "workers": workers,
        "summary": summary,
        "probes": probes,
        "logs": logs,
    }))?;

    Ok(if summary.is_healthy() {
        Status::Success
    } else {
        Status::Failed
    })
}
