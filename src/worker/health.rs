use super::manager::WorkerManager;
use super::protocol::{Codec, Outcome};
use super::types::{WorkerState, WorkerType};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Default health check interval
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Result of probing one worker type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeResult {
    /// No live process to probe
    Idle,
    /// Every permit was held by a real call
    Busy,
    Healthy,
    /// Probe failed, restart threshold not yet reached
    Failed { streak: u32 },
    /// Process exited or failed too many probes and was replaced
    Restarted,
}

/// Watchdog that probes every live worker on an interval
pub struct HealthManager {
    manager: Arc<WorkerManager>,
    check_interval: Duration,
}

impl HealthManager {
    pub fn new(manager: Arc<WorkerManager>) -> Self {
        Self {
            manager,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Run the check loop until a shutdown signal arrives.
    ///
    /// Meant to be spawned as a background task.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(interval = ?self.check_interval, "Health manager started");

        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // first tick completes immediately; workers spawn lazily so skip it
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all().await;
                }
                _ = shutdown.recv() => {
                    info!("Health manager received shutdown signal");
                    break;
                }
            }
        }
    }

    /// Probe every configured worker type once
    pub async fn check_all(&self) -> Vec<(WorkerType, ProbeResult)> {
        let mut results = Vec::new();
        for worker_type in self.manager.configured() {
            let result = self.check(worker_type).await;
            results.push((worker_type, result));
        }
        results
    }

    /// Probe one worker type. Failures only ever restart that type.
    pub async fn check(&self, worker_type: WorkerType) -> ProbeResult {
        let Some(process) = self.manager.current(worker_type).await else {
            return ProbeResult::Idle;
        };
        if !matches!(process.state(), WorkerState::Ready | WorkerState::Starting) {
            return ProbeResult::Idle;
        }

        if !process.is_alive().await {
            warn!(
                worker = %worker_type,
                instance = process.instance(),
                pid = ?process.pid(),
                "Worker has died unexpectedly"
            );
            process.set_state(WorkerState::Unhealthy);
            self.manager
                .restart_instance(worker_type, process.instance(), "process exited")
                .await;
            return ProbeResult::Restarted;
        }

        let Some(_permit) = self.manager.try_permit(worker_type) else {
            debug!(worker = %worker_type, "Worker busy, skipping probe");
            return ProbeResult::Busy;
        };

        let probe = Codec::ping(worker_type);
        let healthy = match process
            .call(&probe, self.manager.settings().probe_timeout)
            .await
        {
            Ok(response) => match response.outcome {
                Outcome::Success(_) => true,
                Outcome::Failure { code, message } => {
                    warn!(worker = %worker_type, %code, %message, "Health probe rejected");
                    false
                }
            },
            Err(e) => {
                warn!(worker = %worker_type, error = %e, "Health probe failed");
                false
            }
        };

        let streak = process.record_probe(healthy);
        if healthy {
            self.manager.record_answer(worker_type).await;
            debug!(worker = %worker_type, instance = process.instance(), "Worker is healthy");
            return ProbeResult::Healthy;
        }

        if streak >= self.manager.settings().failure_threshold {
            process.set_state(WorkerState::Unhealthy);
            let restarted = self
                .manager
                .restart_instance(
                    worker_type,
                    process.instance(),
                    &format!("{} consecutive failed health checks", streak),
                )
                .await;
            if restarted {
                return ProbeResult::Restarted;
            }
        }
        ProbeResult::Failed { streak }
    }
}

/// Health summary across worker types
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthStatus {
    pub total: usize,
    pub ready: usize,
    pub stopped: usize,
    /// Worker types needing attention (unhealthy, or restarting often)
    pub unhealthy: Vec<WorkerType>,
}

impl HealthStatus {
    pub async fn from_manager(manager: &WorkerManager) -> Self {
        let workers = manager.status().await;
        let mut status = HealthStatus {
            total: workers.len(),
            ..Default::default()
        };

        for worker in &workers {
            match worker.state {
                WorkerState::Ready => status.ready += 1,
                WorkerState::Stopped => status.stopped += 1,
                WorkerState::Unhealthy => status.unhealthy.push(worker.worker_type),
                WorkerState::Starting | WorkerState::Restarting => {}
            }

            if worker.restarts >= 2 && !status.unhealthy.contains(&worker.worker_type) {
                status.unhealthy.push(worker.worker_type);
            }
        }

        status
    }

    pub fn is_healthy(&self) -> bool {
        self.unhealthy.is_empty()
    }
}
