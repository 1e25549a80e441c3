mod support;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use support::config_for;
use worker_bridge::translator::codes;
use worker_bridge::{
    Bridge, CacheKey, DomainConfig, Operation, Severity, WorkerCommand, WorkerType,
};

#[tokio::test]
async fn cold_device_listing_is_fetched_once_and_cached() {
    let bridge = Bridge::new(&config_for(&[WorkerType::Device])).unwrap();
    let coordinator = bridge.coordinator();

    let devices = coordinator.list(WorkerType::Device).await.unwrap();
    let ids: Vec<&str> = devices.iter().filter_map(|d| d["id"].as_str()).collect();
    assert_eq!(ids, vec!["gpu-0", "gpu-1"]);
    assert!(bridge.manager().current(WorkerType::Device).await.is_some());

    for id in ["gpu-0", "gpu-1"] {
        let info = bridge
            .cache()
            .entry_info(WorkerType::Device, &CacheKey::entity(id))
            .unwrap();
        assert!(info.remaining <= Duration::from_secs(120));
        assert!(info.remaining > Duration::from_secs(110));
    }

    // second call within the TTL is served from cache
    let again = coordinator.list(WorkerType::Device).await.unwrap();
    assert_eq!(again, devices);
    let gpu = coordinator.ensure(WorkerType::Device, "gpu-1").await.unwrap();
    assert_eq!(gpu["generation"], 1);

    let stats = &bridge.cache().stats()[WorkerType::Device.rank()];
    assert_eq!(stats.entries, 3);
    assert!(stats.hits >= 2);

    bridge.shutdown().await;
}

#[tokio::test]
async fn invalidate_forces_a_fresh_worker_call() {
    let bridge = Bridge::new(&config_for(&[WorkerType::Device])).unwrap();
    let coordinator = bridge.coordinator();

    let gpu = coordinator.ensure(WorkerType::Device, "gpu-0").await.unwrap();
    assert_eq!(gpu["generation"], 1);
    let gpu = coordinator.ensure(WorkerType::Device, "gpu-0").await.unwrap();
    assert_eq!(gpu["generation"], 1);

    coordinator.invalidate(WorkerType::Device, "gpu-0");
    let gpu = coordinator.ensure(WorkerType::Device, "gpu-0").await.unwrap();
    assert_eq!(gpu["generation"], 2);

    bridge.shutdown().await;
}

#[tokio::test]
async fn unreachable_upstream_is_an_unresolved_dependency() {
    let mut config = config_for(&[WorkerType::Memory]).with_worker(
        WorkerType::Device,
        WorkerCommand::new("/nonexistent/device-worker"),
    );
    config.health.transport_retries = 1;
    let bridge = Bridge::new(&config).unwrap();

    let op = Operation::new(
        WorkerType::Memory,
        "allocate",
        json!({"device_id": "gpu-0", "bytes": 1024}),
    )
    .depends_on(WorkerType::Device, "gpu-0");
    let failure = bridge.coordinator().execute(op).await.unwrap_err();

    assert_eq!(failure.code(), codes::UNRESOLVED_DEPENDENCY);
    assert_eq!(failure.origin, WorkerType::Device);
    assert!(failure.upstream);
    assert!(failure.error.retryable);
    assert!(failure.error.message.contains("gpu-0"));
    // never dispatched, so the memory worker was never started
    assert!(bridge.manager().current(WorkerType::Memory).await.is_none());

    bridge.shutdown().await;
}

#[tokio::test]
async fn unknown_upstream_entity_is_rejected_before_dispatch() {
    let bridge = Bridge::new(&config_for(&[WorkerType::Device, WorkerType::Memory])).unwrap();

    let op = Operation::new(WorkerType::Memory, "allocate", json!({"device_id": "gpu-7"}))
        .depends_on(WorkerType::Device, "gpu-7");
    let failure = bridge.coordinator().execute(op).await.unwrap_err();

    assert_eq!(failure.code(), codes::UNRESOLVED_DEPENDENCY);
    assert_eq!(failure.origin, WorkerType::Device);
    assert!(bridge.manager().current(WorkerType::Memory).await.is_none());

    bridge.shutdown().await;
}

#[tokio::test]
async fn mutation_propagates_dependencies_and_invalidates() {
    let bridge = Bridge::new(&config_for(&[WorkerType::Device, WorkerType::Memory])).unwrap();
    let coordinator = bridge.coordinator();

    let op = Operation::new(
        WorkerType::Memory,
        "allocate",
        json!({"device_id": "gpu-0", "bytes": 1024}),
    )
    .depends_on(WorkerType::Device, "gpu-0")
    .mutates(WorkerType::Device, "gpu-0")
    .propagate(true);
    let result = coordinator.execute(op).await.unwrap();

    assert_eq!(result["allocation_id"], "alloc-1");
    assert_eq!(result["dependencies"]["device"]["gpu-0"]["id"], "gpu-0");

    // the allocation changed gpu-0, so its state is fetched again
    assert!(bridge
        .cache()
        .get(WorkerType::Device, &CacheKey::entity("gpu-0"))
        .is_none());
    let gpu = coordinator.ensure(WorkerType::Device, "gpu-0").await.unwrap();
    assert_eq!(gpu["generation"], 2);

    bridge.shutdown().await;
}

#[tokio::test]
async fn own_domain_failure_is_not_upstream() {
    let bridge = Bridge::new(&config_for(&[WorkerType::Device, WorkerType::Model])).unwrap();

    let op = Operation::new(
        WorkerType::Model,
        "fail",
        json!({"code": "MODEL_NOT_FOUND", "message": "no such model"}),
    )
    .depends_on(WorkerType::Device, "gpu-1")
    .timeout(Duration::from_secs(2));
    let failure = bridge.coordinator().execute(op).await.unwrap_err();

    assert_eq!(failure.code(), "MODEL_NOT_FOUND");
    assert_eq!(failure.origin, WorkerType::Model);
    assert!(!failure.upstream);
    assert_eq!(failure.error.severity, Severity::Low);
    assert!(!failure.error.retryable);

    bridge.shutdown().await;
}

#[tokio::test]
async fn batch_reports_partial_failure_in_submission_order() {
    let bridge = Bridge::new(&config_for(&[
        WorkerType::Device,
        WorkerType::Memory,
        WorkerType::Model,
    ]))
    .unwrap();
    let coordinator = Arc::clone(bridge.coordinator());

    let ops = vec![
        Operation::new(WorkerType::Memory, "allocate", json!({"device_id": "gpu-0"}))
            .depends_on(WorkerType::Device, "gpu-0"),
        Operation::new(WorkerType::Memory, "allocate", json!({"device_id": "gpu-9"}))
            .depends_on(WorkerType::Device, "gpu-9"),
        Operation::new(WorkerType::Model, "fail", json!({"code": "MODEL_NOT_FOUND"})),
        Operation::new(WorkerType::Model, "echo", json!({"model": "llama"})),
    ];
    let report = coordinator.execute_all(ops).await;

    assert!(report.is_partial());
    let completed: Vec<usize> = report.completed.iter().map(|(i, _)| *i).collect();
    assert_eq!(completed, vec![0, 3]);
    assert_eq!(report.completed[1].1, json!({"model": "llama"}));

    let failed: Vec<(usize, WorkerType, bool)> = report
        .failed
        .iter()
        .map(|(i, f)| (*i, f.origin, f.upstream))
        .collect();
    assert_eq!(
        failed,
        vec![(1, WorkerType::Device, true), (2, WorkerType::Model, false)]
    );

    bridge.shutdown().await;
}

#[tokio::test]
async fn configured_listing_shape_is_honoured() {
    let mut config = config_for(&[WorkerType::Device]).with_domain(
        WorkerType::Device,
        DomainConfig {
            items_field: Some("devices".into()),
            ..DomainConfig::default()
        },
    );
    config.workers.get_mut("device").unwrap().env.insert(
        "MOCK_DEVICES".into(),
        "npu-0, npu-1, npu-2".into(),
    );
    let bridge = Bridge::new(&config).unwrap();

    let devices = bridge.coordinator().list(WorkerType::Device).await.unwrap();
    assert_eq!(devices.len(), 3);
    let npu = bridge
        .coordinator()
        .ensure(WorkerType::Device, "npu-2")
        .await
        .unwrap();
    assert_eq!(npu["id"], "npu-2");

    bridge.shutdown().await;
}
