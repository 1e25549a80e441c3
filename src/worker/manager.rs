use super::log_buffer::{DiagnosticLine, LogBuffer};
use super::process::WorkerProcess;
use super::protocol::{Codec, Request, Response};
use super::types::{WorkerState, WorkerStatus, WorkerType};
use crate::config::{BridgeConfig, ConfigError, WorkerCommand};
use crate::error::{BridgeError, Result};
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Tunables the manager reads from [`BridgeConfig`]
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub call_timeout: Duration,
    pub probe_timeout: Duration,
    pub shutdown_grace: Duration,
    pub timeout_threshold: u32,
    pub failure_threshold: u32,
    pub max_restarts: u32,
    pub transport_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl ManagerSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            call_timeout: config.timeouts.call(),
            probe_timeout: config.timeouts.health_probe(),
            shutdown_grace: config.timeouts.shutdown_grace(),
            timeout_threshold: config.health.timeout_threshold,
            failure_threshold: config.health.failure_threshold,
            max_restarts: config.health.max_restarts,
            transport_retries: config.health.transport_retries,
            backoff_base: Duration::from_millis(config.health.backoff_base_ms),
            backoff_max: Duration::from_millis(config.health.backoff_max_ms),
        }
    }
}

struct SlotState {
    process: Option<Arc<WorkerProcess>>,
    state: WorkerState,
    restarts: u32,
    spawn_failures: u32,
    /// Processes lost (crashed, restarted) since the last answered call
    losses: u32,
    /// Set once spawns or losses reach `max_restarts` in a row
    exhausted: bool,
    last_error: Option<String>,
}

/// Everything the manager tracks for one worker type
struct WorkerSlot {
    worker_type: WorkerType,
    command: WorkerCommand,
    permits: Arc<Semaphore>,
    state: Mutex<SlotState>,
}

/// A held concurrency permit plus the process it was granted on.
///
/// Dropping the lease frees the permit.
pub struct WorkerLease {
    process: Arc<WorkerProcess>,
    _permit: OwnedSemaphorePermit,
}

impl WorkerLease {
    pub fn process(&self) -> &Arc<WorkerProcess> {
        &self.process
    }
}

/// Owns every worker subprocess.
///
/// Calls to different worker types never contend; calls to the same type are
/// bounded by that worker's `pool_size`.
pub struct WorkerManager {
    slots: HashMap<WorkerType, Arc<WorkerSlot>>,
    settings: ManagerSettings,
    log_buffer: Arc<LogBuffer>,
    next_instance: AtomicU64,
    shutting_down: AtomicBool,
}

impl WorkerManager {
    pub fn new(
        config: &BridgeConfig,
        log_buffer: Arc<LogBuffer>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let slots = config
            .worker_commands()?
            .into_iter()
            .map(|(worker_type, command)| {
                let slot = WorkerSlot {
                    worker_type,
                    permits: Arc::new(Semaphore::new(command.pool_size)),
                    command,
                    state: Mutex::new(SlotState {
                        process: None,
                        state: WorkerState::Stopped,
                        restarts: 0,
                        spawn_failures: 0,
                        losses: 0,
                        exhausted: false,
                        last_error: None,
                    }),
                };
                (worker_type, Arc::new(slot))
            })
            .collect();

        Ok(Self {
            slots,
            settings: ManagerSettings::from_config(config),
            log_buffer,
            next_instance: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn log_buffer(&self) -> &Arc<LogBuffer> {
        &self.log_buffer
    }

    /// Worker types that have a launch command
    pub fn configured(&self) -> Vec<WorkerType> {
        let mut types: Vec<WorkerType> = self.slots.keys().copied().collect();
        types.sort();
        types
    }

    fn slot(&self, worker_type: WorkerType) -> Result<&Arc<WorkerSlot>> {
        self.slots
            .get(&worker_type)
            .ok_or(BridgeError::NotConfigured {
                worker: worker_type,
            })
    }

    /// Wait for a concurrency permit and return the live process, spawning
    /// one if needed.
    pub async fn acquire(&self, worker_type: WorkerType) -> Result<WorkerLease> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(BridgeError::ShuttingDown);
        }
        let slot = self.slot(worker_type)?;
        let permit = Arc::clone(&slot.permits)
            .acquire_owned()
            .await
            .map_err(|_| BridgeError::ShuttingDown)?;
        let process = self.live_process(slot).await?;
        Ok(WorkerLease {
            process,
            _permit: permit,
        })
    }

    async fn live_process(&self, slot: &WorkerSlot) -> Result<Arc<WorkerProcess>> {
        let mut state = slot.state.lock().await;
        if let Some(process) = &state.process {
            if process.is_accepting() {
                return Ok(Arc::clone(process));
            }
        }
        if let Some(dead) = state.process.take() {
            debug!(worker = %slot.worker_type, instance = dead.instance(), "Replacing worker that stopped accepting calls");
            self.reap(dead);
            self.record_loss(slot.worker_type, &mut state);
        }
        if state.exhausted {
            return Err(BridgeError::Unavailable {
                worker: slot.worker_type,
                failures: state.spawn_failures.max(state.losses),
            });
        }
        self.spawn_into(slot, &mut state)
    }

    fn spawn_into(&self, slot: &WorkerSlot, state: &mut SlotState) -> Result<Arc<WorkerProcess>> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(BridgeError::ShuttingDown);
        }
        state.state = WorkerState::Starting;
        let instance = self.next_instance.fetch_add(1, Ordering::SeqCst) + 1;

        match WorkerProcess::spawn(slot.worker_type, instance, &slot.command, &self.log_buffer) {
            Ok(process) => {
                state.process = Some(Arc::clone(&process));
                state.state = WorkerState::Ready;
                state.spawn_failures = 0;
                state.last_error = None;
                debug!(worker = %slot.worker_type, instance, "Worker ready");
                Ok(process)
            }
            Err(e) => {
                state.spawn_failures += 1;
                state.last_error = Some(e.to_string());
                if state.spawn_failures >= self.settings.max_restarts {
                    state.exhausted = true;
                    state.state = WorkerState::Stopped;
                    error!(
                        worker = %slot.worker_type,
                        failures = state.spawn_failures,
                        "Worker failed to start too many times, giving up"
                    );
                } else {
                    state.state = WorkerState::Stopped;
                    warn!(worker = %slot.worker_type, error = %e, "Failed to start worker");
                }
                Err(e)
            }
        }
    }

    /// Count a lost process; gives up on the type after `max_restarts` in a row
    fn record_loss(&self, worker_type: WorkerType, state: &mut SlotState) {
        state.losses += 1;
        if state.losses >= self.settings.max_restarts && !state.exhausted {
            state.exhausted = true;
            state.state = WorkerState::Stopped;
            error!(
                worker = %worker_type,
                losses = state.losses,
                "Worker keeps failing without answering, giving up"
            );
        }
    }

    /// An answered call proves the worker can do work again
    pub(crate) async fn record_answer(&self, worker_type: WorkerType) {
        if let Ok(slot) = self.slot(worker_type) {
            slot.state.lock().await.losses = 0;
        }
    }

    /// Terminate a replaced process in the background
    fn reap(&self, process: Arc<WorkerProcess>) {
        let grace = self.settings.shutdown_grace;
        tokio::spawn(async move {
            process.terminate(grace).await;
        });
    }

    /// Encode and execute one call
    pub async fn execute(
        &self,
        worker_type: WorkerType,
        action: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let request = Codec::encode(worker_type, action, payload);
        self.execute_request(&request, timeout.unwrap_or(self.settings.call_timeout))
            .await
    }

    /// Execute a prepared request, resending it only when it provably never
    /// reached a worker.
    pub async fn execute_request(&self, request: &Request, timeout: Duration) -> Result<Response> {
        let mut attempt = 0;
        loop {
            let result = match self.acquire(request.worker_type).await {
                Ok(lease) => self.call_on(&lease, request, timeout).await,
                Err(e) => Err(e),
            };
            match result {
                Err(e) if e.is_undelivered() && attempt < self.settings.transport_retries => {
                    attempt += 1;
                    let delay = backoff(attempt, self.settings.backoff_base, self.settings.backoff_max);
                    warn!(
                        worker = %request.worker_type,
                        request_id = %request.request_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Request not delivered, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn call_on(
        &self,
        lease: &WorkerLease,
        request: &Request,
        timeout: Duration,
    ) -> Result<Response> {
        let process = lease.process();
        match process.call(request, timeout).await {
            Ok(response) => {
                process.record_answer();
                self.record_answer(request.worker_type).await;
                Ok(response)
            }
            Err(e @ BridgeError::Timeout { .. }) => {
                let streak = process.record_timeout();
                warn!(
                    worker = %request.worker_type,
                    instance = process.instance(),
                    request_id = %request.request_id,
                    streak,
                    "Worker call timed out"
                );
                if streak >= self.settings.timeout_threshold {
                    process.set_state(WorkerState::Unhealthy);
                    self.restart_instance(
                        request.worker_type,
                        process.instance(),
                        &format!("{} consecutive timeouts", streak),
                    )
                    .await;
                }
                Err(e)
            }
            Err(e @ BridgeError::Protocol { .. }) => {
                process.record_answer();
                self.record_answer(request.worker_type).await;
                Err(e)
            }
            Err(e @ (BridgeError::ProcessExited { .. } | BridgeError::Disconnected { .. })) => {
                self.discard(request.worker_type, process.instance(), &e).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Drop a dead process so the next call spawns a fresh one
    async fn discard(&self, worker_type: WorkerType, instance: u64, cause: &BridgeError) {
        let Ok(slot) = self.slot(worker_type) else {
            return;
        };
        let mut state = slot.state.lock().await;
        match state.process.take() {
            Some(p) if p.instance() == instance => {
                warn!(worker = %worker_type, instance, error = %cause, "Worker lost, will respawn on next call");
                state.state = WorkerState::Stopped;
                state.last_error = Some(cause.to_string());
                self.reap(p);
                self.record_loss(worker_type, &mut state);
            }
            other => state.process = other,
        }
    }

    /// Replace `instance` with a fresh process.
    ///
    /// Returns false when the slot already holds a different instance, so
    /// concurrent triggers for the same failure restart only once.
    pub async fn restart_instance(
        &self,
        worker_type: WorkerType,
        instance: u64,
        reason: &str,
    ) -> bool {
        let Ok(slot) = self.slot(worker_type) else {
            return false;
        };
        let mut state = slot.state.lock().await;
        let old = match state.process.take() {
            Some(p) if p.instance() == instance => p,
            other => {
                state.process = other;
                return false;
            }
        };

        old.set_state(WorkerState::Restarting);
        state.state = WorkerState::Restarting;
        state.restarts += 1;
        state.last_error = Some(reason.to_string());
        info!(
            worker = %worker_type,
            instance,
            restarts = state.restarts,
            reason,
            "Restarting worker"
        );
        self.reap(old);
        self.record_loss(worker_type, &mut state);
        if state.exhausted {
            return true;
        }

        if let Err(e) = self.spawn_into(slot, &mut state) {
            error!(worker = %worker_type, error = %e, "Failed to respawn worker");
        }
        true
    }

    /// Operator restart: clears an exhausted slot and replaces the current process
    pub async fn restart(&self, worker_type: WorkerType) -> Result<()> {
        let slot = self.slot(worker_type)?;
        let current = {
            let mut state = slot.state.lock().await;
            state.exhausted = false;
            state.spawn_failures = 0;
            state.losses = 0;
            state.process.as_ref().map(|p| p.instance())
        };
        match current {
            Some(instance) => {
                self.restart_instance(worker_type, instance, "requested").await;
                Ok(())
            }
            None => {
                let mut state = slot.state.lock().await;
                self.spawn_into(slot, &mut state).map(|_| ())
            }
        }
    }

    /// Current process of a worker type without spawning one
    pub async fn current(&self, worker_type: WorkerType) -> Option<Arc<WorkerProcess>> {
        let slot = self.slots.get(&worker_type)?;
        slot.state.lock().await.process.clone()
    }

    /// A permit if the worker type has spare capacity right now
    pub fn try_permit(&self, worker_type: WorkerType) -> Option<OwnedSemaphorePermit> {
        let slot = self.slots.get(&worker_type)?;
        Arc::clone(&slot.permits).try_acquire_owned().ok()
    }

    pub async fn status(&self) -> Vec<WorkerStatus> {
        let mut list = Vec::with_capacity(self.slots.len());
        for worker_type in self.configured() {
            let Some(slot) = self.slots.get(&worker_type) else {
                continue;
            };
            let state = slot.state.lock().await;
            let process = state.process.as_ref();
            list.push(WorkerStatus {
                worker_type,
                state: process.map(|p| p.state()).unwrap_or(state.state),
                pid: process.and_then(|p| p.pid()),
                instance: process.map(|p| p.instance()).unwrap_or(0),
                uptime_secs: process.map(|p| p.uptime().as_secs()),
                last_probe_secs: process
                    .and_then(|p| p.last_health_check())
                    .map(|at| at.elapsed().as_secs()),
                restarts: state.restarts,
                in_flight: process.map(|p| p.in_flight()).unwrap_or(0),
                last_error: state.last_error.clone(),
            });
        }
        list
    }

    /// Restarts performed for a worker type since the manager was created
    pub async fn restarts(&self, worker_type: WorkerType) -> u32 {
        match self.slots.get(&worker_type) {
            Some(slot) => slot.state.lock().await.restarts,
            None => 0,
        }
    }

    pub fn logs(&self, worker_type: WorkerType, lines: usize) -> Vec<DiagnosticLine> {
        self.log_buffer.tail(worker_type, lines)
    }

    /// Stop accepting calls and terminate every worker within the grace period
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping all workers...");

        let mut stopping = JoinSet::new();
        for slot in self.slots.values() {
            slot.permits.close();
            let mut state = slot.state.lock().await;
            state.state = WorkerState::Stopped;
            if let Some(process) = state.process.take() {
                let grace = self.settings.shutdown_grace;
                stopping.spawn(async move {
                    process.terminate(grace).await;
                });
            }
        }
        while let Some(result) = stopping.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Worker termination task failed");
            }
        }
        info!("All workers stopped");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

/// Exponential backoff with up to 10% jitter
fn backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let base_ms = base.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    let delay_ms = base_ms
        .saturating_mul(2u64.saturating_pow(attempt - 1))
        .min(max_ms);
    let jitter_range = delay_ms / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };
    Duration::from_millis(delay_ms + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with(workers: &[(WorkerType, &str)]) -> WorkerManager {
        let mut config = BridgeConfig::default();
        for (worker_type, command) in workers {
            config = config.with_worker(*worker_type, WorkerCommand::new(*command));
        }
        config.health.max_restarts = 2;
        config.health.transport_retries = 1;
        config.health.backoff_base_ms = 1;
        WorkerManager::new(&config, Arc::new(LogBuffer::default())).unwrap()
    }

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(1000);
        assert_eq!(backoff(0, base, max), Duration::ZERO);
        assert!(backoff(1, base, max) >= Duration::from_millis(100));
        assert!(backoff(2, base, max) >= Duration::from_millis(200));
        let capped = backoff(10, base, max);
        assert!(capped >= max && capped < Duration::from_millis(1100));
    }

    #[tokio::test]
    async fn unconfigured_worker_is_rejected() {
        let manager = manager_with(&[]);
        let err = manager
            .execute(WorkerType::Model, "list", Value::Null, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::NotConfigured {
                worker: WorkerType::Model
            }
        ));
    }

    #[tokio::test]
    async fn spawn_failures_exhaust_the_slot() {
        let manager = manager_with(&[(WorkerType::Device, "/nonexistent/device-worker")]);

        // first call: initial spawn plus one retry, both fail
        let err = manager
            .execute(WorkerType::Device, "list", Value::Null, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Spawn { .. }));

        let err = manager
            .execute(WorkerType::Device, "list", Value::Null, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Unavailable { failures: 2, .. }));

        let status = manager.status().await;
        assert_eq!(status[0].state, WorkerState::Stopped);
        assert!(status[0].last_error.is_some());
    }

    #[tokio::test]
    async fn shutdown_rejects_new_calls() {
        let manager = manager_with(&[(WorkerType::Device, "/nonexistent/device-worker")]);
        manager.shutdown().await;
        let err = manager
            .execute(WorkerType::Device, "list", Value::Null, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ShuttingDown));
    }

    #[tokio::test]
    async fn status_lists_configured_workers_in_dependency_order() {
        let manager = manager_with(&[
            (WorkerType::Inference, "/bin/inference"),
            (WorkerType::Device, "/bin/device"),
        ]);
        let status = manager.status().await;
        let types: Vec<WorkerType> = status.iter().map(|s| s.worker_type).collect();
        assert_eq!(types, vec![WorkerType::Device, WorkerType::Inference]);
        assert!(status.iter().all(|s| s.pid.is_none() && s.restarts == 0));
    }
}
