//! Worker identity and lifecycle state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Capability domain served by one worker subprocess.
///
/// Declaration order is the dependency order: a domain may only depend on
/// domains declared before it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum WorkerType {
    Device,
    Memory,
    Model,
    Processing,
    Inference,
    Postprocessing,
}

impl WorkerType {
    /// All worker types in dependency order.
    pub const ALL: [WorkerType; 6] = [
        WorkerType::Device,
        WorkerType::Memory,
        WorkerType::Model,
        WorkerType::Processing,
        WorkerType::Inference,
        WorkerType::Postprocessing,
    ];

    /// Wire identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerType::Device => "device",
            WorkerType::Memory => "memory",
            WorkerType::Model => "model",
            WorkerType::Processing => "processing",
            WorkerType::Inference => "inference",
            WorkerType::Postprocessing => "postprocessing",
        }
    }

    /// Position in the dependency order (device = 0).
    pub fn rank(&self) -> usize {
        *self as usize
    }

    /// Prefix used for error codes raised on behalf of this domain, e.g. `DEVICE`.
    pub fn code_prefix(&self) -> String {
        self.as_str().to_ascii_uppercase()
    }
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown worker type '{0}'")]
pub struct UnknownWorkerType(pub String);

impl FromStr for WorkerType {
    type Err = UnknownWorkerType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkerType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownWorkerType(s.to_string()))
    }
}

/// Lifecycle state of a worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Process is being spawned
    Starting,
    /// Process is accepting requests
    Ready,
    /// Process failed health checks or timed out repeatedly
    Unhealthy,
    /// Process is being replaced
    Restarting,
    /// No process, either never started, shut down, or restarts exhausted
    Stopped,
}

impl WorkerState {
    pub fn is_ready(&self) -> bool {
        matches!(self, WorkerState::Ready)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::Ready => "ready",
            WorkerState::Unhealthy => "unhealthy",
            WorkerState::Restarting => "restarting",
            WorkerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one worker type, returned by `WorkerManager::status`.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub worker_type: WorkerType,
    pub state: WorkerState,
    pub pid: Option<u32>,
    /// Spawn sequence number, unique within the manager
    pub instance: u64,
    pub uptime_secs: Option<u64>,
    /// Seconds since the watchdog last probed the process
    pub last_probe_secs: Option<u64>,
    pub restarts: u32,
    pub in_flight: usize,
    pub last_error: Option<String>,
}
