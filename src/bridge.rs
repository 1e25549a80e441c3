use crate::cache::ResponseCache;
use crate::config::{BridgeConfig, ConfigError};
use crate::coordinator::DomainCoordinator;
use crate::worker::{HealthManager, HealthStatus, LogBuffer, WorkerManager};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Wires the worker manager, cache and coordinator together and owns the
/// background tasks (health watchdog, cache sweeper).
pub struct Bridge {
    coordinator: Arc<DomainCoordinator>,
    manager: Arc<WorkerManager>,
    cache: Arc<ResponseCache<Value>>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Bridge {
    /// Build every component without starting background tasks
    pub fn new(config: &BridgeConfig) -> Result<Self, ConfigError> {
        let log_buffer = Arc::new(LogBuffer::default());
        let manager = Arc::new(WorkerManager::new(config, log_buffer)?);
        let cache = Arc::new(ResponseCache::new(&config.cache));
        let coordinator = Arc::new(DomainCoordinator::new(
            Arc::clone(&manager),
            Arc::clone(&cache),
            config,
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            coordinator,
            manager,
            cache,
            shutdown_tx,
            tasks: Vec::new(),
        })
    }

    /// Build the bridge and start the health watchdog and cache sweeper
    pub fn start(config: &BridgeConfig) -> Result<Self, ConfigError> {
        let mut bridge = Self::new(config)?;

        if config.health.enabled {
            let health = HealthManager::new(Arc::clone(&bridge.manager))
                .with_interval(config.health.interval());
            let shutdown = bridge.shutdown_tx.subscribe();
            bridge
                .tasks
                .push(tokio::spawn(async move { health.run(shutdown).await }));
        }

        if let Some(interval) = config.cache.sweep_interval() {
            let shutdown = bridge.shutdown_tx.subscribe();
            bridge
                .tasks
                .push(bridge.cache.spawn_sweeper(interval, shutdown));
        }

        info!(
            workers = bridge.manager.configured().len(),
            health = config.health.enabled,
            "Worker bridge started"
        );
        Ok(bridge)
    }

    pub fn coordinator(&self) -> &Arc<DomainCoordinator> {
        &self.coordinator
    }

    pub fn manager(&self) -> &Arc<WorkerManager> {
        &self.manager
    }

    pub fn cache(&self) -> &Arc<ResponseCache<Value>> {
        &self.cache
    }

    pub async fn health(&self) -> HealthStatus {
        HealthStatus::from_manager(&self.manager).await
    }

    /// Stop background tasks, terminate every worker and drop cached state
    pub async fn shutdown(mut self) {
        info!("Shutting down worker bridge...");
        // no receivers when nothing was started
        let _ = self.shutdown_tx.send(());
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        self.manager.shutdown().await;
        self.cache.clear();
        info!("Worker bridge stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerCommand;
    use crate::error::BridgeError;
    use crate::worker::WorkerType;

    #[tokio::test]
    async fn start_and_shutdown_without_workers() {
        let bridge = Bridge::start(&BridgeConfig::default()).unwrap();
        assert!(bridge.health().await.is_healthy());
        let manager = Arc::clone(bridge.manager());
        bridge.shutdown().await;
        assert!(manager.is_shutting_down());
    }

    #[tokio::test]
    async fn calls_after_shutdown_are_rejected() {
        let config = BridgeConfig::default()
            .with_worker(WorkerType::Device, WorkerCommand::new("/nonexistent/device"));
        let bridge = Bridge::new(&config).unwrap();
        let coordinator = Arc::clone(bridge.coordinator());
        bridge.shutdown().await;

        let err = coordinator.list(WorkerType::Device).await.unwrap_err();
        assert!(matches!(err, BridgeError::ShuttingDown));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = BridgeConfig::default()
            .with_worker(WorkerType::Device, WorkerCommand::new("  "));
        assert!(Bridge::new(&config).is_err());
    }
}
