use crate::worker::protocol::ProtocolError;
use crate::worker::WorkerType;
use std::time::Duration;
use thiserror::Error;

/// Raw failure raised anywhere inside the bridge.
///
/// Callers normally see these through [`crate::translator::ErrorTranslator`],
/// which turns them into stable codes.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("no command configured for the {worker} worker")]
    NotConfigured { worker: WorkerType },

    #[error("failed to spawn the {worker} worker: {source}")]
    Spawn {
        worker: WorkerType,
        #[source]
        source: std::io::Error,
    },

    /// The request never reached the worker (stdin closed or write failed)
    #[error("{worker} worker is disconnected: {reason}")]
    Disconnected { worker: WorkerType, reason: String },

    /// The worker went away while a request was in flight
    #[error("{worker} worker exited while handling the request{}", fmt_status(.status))]
    ProcessExited {
        worker: WorkerType,
        status: Option<i32>,
    },

    #[error("{worker} worker did not answer '{action}' within {timeout:?}")]
    Timeout {
        worker: WorkerType,
        action: String,
        timeout: Duration,
    },

    #[error("{worker} worker sent an invalid frame: {source}")]
    Protocol {
        worker: WorkerType,
        #[source]
        source: ProtocolError,
    },

    /// Business error reported by the worker itself
    #[error("{worker} worker reported {code}: {message}")]
    Worker {
        worker: WorkerType,
        code: String,
        message: String,
    },

    #[error("{worker} worker is unavailable after {failures} consecutive failures")]
    Unavailable { worker: WorkerType, failures: u32 },

    #[error("{domain} listing has an unexpected shape: {reason}")]
    InvalidListing { domain: WorkerType, reason: String },

    #[error("unresolved dependency {domain}/{id}: {reason}")]
    UnresolvedDependency {
        domain: WorkerType,
        id: String,
        reason: String,
    },

    #[error("a {dependent} operation cannot depend on {dependency} state")]
    DependencyOrder {
        dependent: WorkerType,
        dependency: WorkerType,
    },

    #[error("bridge is shutting down")]
    ShuttingDown,
}

fn fmt_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!(" (exit code {})", code),
        None => String::new(),
    }
}

impl BridgeError {
    /// Worker type the failure is attributed to, if any
    pub fn worker(&self) -> Option<WorkerType> {
        match self {
            Self::NotConfigured { worker }
            | Self::Spawn { worker, .. }
            | Self::Disconnected { worker, .. }
            | Self::ProcessExited { worker, .. }
            | Self::Timeout { worker, .. }
            | Self::Protocol { worker, .. }
            | Self::Worker { worker, .. }
            | Self::Unavailable { worker, .. } => Some(*worker),
            Self::InvalidListing { domain, .. }
            | Self::UnresolvedDependency { domain, .. } => Some(*domain),
            Self::DependencyOrder { dependent, .. } => Some(*dependent),
            Self::ShuttingDown => None,
        }
    }

    /// Transport failure where the request provably never reached a worker,
    /// so sending it again cannot duplicate work.
    pub fn is_undelivered(&self) -> bool {
        matches!(self, Self::Spawn { .. } | Self::Disconnected { .. })
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
