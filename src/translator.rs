//! Maps raw bridge failures onto the stable error surface shown to callers.

use crate::error::BridgeError;
use crate::worker::WorkerType;
use serde::Serialize;
use std::fmt;

/// Stable codes raised by the bridge itself. Worker codes pass through as-is.
pub mod codes {
    pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
    pub const UNRESOLVED_DEPENDENCY: &str = "UNRESOLVED_DEPENDENCY";
    pub const DEPENDENCY_ORDER_ERROR: &str = "DEPENDENCY_ORDER_ERROR";
    pub const WORKER_NOT_CONFIGURED: &str = "WORKER_NOT_CONFIGURED";
    pub const BRIDGE_SHUTTING_DOWN: &str = "BRIDGE_SHUTTING_DOWN";

    pub const SUFFIX_NOT_FOUND: &str = "_NOT_FOUND";
    pub const SUFFIX_NOT_AVAILABLE: &str = "_NOT_AVAILABLE";
    pub const SUFFIX_TIMEOUT: &str = "_TIMEOUT";
    pub const SUFFIX_HARDWARE_ERROR: &str = "_HARDWARE_ERROR";
    pub const SUFFIX_DRIVER_ERROR: &str = "_DRIVER_ERROR";
    pub const SUFFIX_VALIDATION_ERROR: &str = "_VALIDATION_ERROR";
    pub const SUFFIX_OUT_OF_MEMORY: &str = "_OUT_OF_MEMORY";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Caller mistake, e.g. unknown id or bad input
    Low,
    Medium,
    High,
}

/// What the caller should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recovery {
    Retry,
    /// Retry once the worker has been restarted
    RetryAfterRestart,
    FixRequest,
    /// Refresh or create the upstream entity first
    ResolveDependency,
    CheckHardware,
    /// Needs an operator (configuration, worker bug)
    Escalate,
}

/// Failure as presented to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    pub severity: Severity,
    pub recovery: Recovery,
    pub domain: Option<WorkerType>,
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for DomainError {}

/// Stateless mapping from [`BridgeError`] to [`DomainError`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorTranslator;

impl ErrorTranslator {
    pub fn new() -> Self {
        Self
    }

    pub fn translate(&self, error: &BridgeError) -> DomainError {
        let domain = error.worker();
        let message = error.to_string();
        let (code, retryable, severity, recovery) = match error {
            BridgeError::Timeout { worker, .. } => (
                scoped(*worker, codes::SUFFIX_TIMEOUT),
                true,
                Severity::Medium,
                Recovery::Retry,
            ),
            BridgeError::Spawn { worker, .. }
            | BridgeError::Disconnected { worker, .. }
            | BridgeError::ProcessExited { worker, .. } => (
                scoped(*worker, codes::SUFFIX_NOT_AVAILABLE),
                true,
                Severity::Medium,
                Recovery::RetryAfterRestart,
            ),
            BridgeError::Unavailable { worker, .. } => (
                scoped(*worker, codes::SUFFIX_NOT_AVAILABLE),
                false,
                Severity::High,
                Recovery::Escalate,
            ),
            BridgeError::Protocol { .. } | BridgeError::InvalidListing { .. } => (
                codes::PROTOCOL_ERROR.to_string(),
                false,
                Severity::High,
                Recovery::Escalate,
            ),
            BridgeError::Worker { code, message, .. } => {
                let class = classify(code);
                return DomainError {
                    code: code.clone(),
                    message: message.clone(),
                    retryable: class.retryable,
                    severity: class.severity,
                    recovery: class.recovery,
                    domain,
                };
            }
            BridgeError::UnresolvedDependency { .. } => (
                codes::UNRESOLVED_DEPENDENCY.to_string(),
                true,
                Severity::Medium,
                Recovery::ResolveDependency,
            ),
            BridgeError::DependencyOrder { .. } => (
                codes::DEPENDENCY_ORDER_ERROR.to_string(),
                false,
                Severity::Low,
                Recovery::FixRequest,
            ),
            BridgeError::NotConfigured { .. } => (
                codes::WORKER_NOT_CONFIGURED.to_string(),
                false,
                Severity::High,
                Recovery::Escalate,
            ),
            BridgeError::ShuttingDown => (
                codes::BRIDGE_SHUTTING_DOWN.to_string(),
                false,
                Severity::Medium,
                Recovery::Escalate,
            ),
        };

        DomainError {
            code,
            message,
            retryable,
            severity,
            recovery,
            domain,
        }
    }
}

fn scoped(domain: WorkerType, suffix: &str) -> String {
    format!("{}{}", domain.code_prefix(), suffix)
}

struct Class {
    retryable: bool,
    severity: Severity,
    recovery: Recovery,
}

/// Fixed severity table for worker-reported codes, keyed by suffix
fn classify(code: &str) -> Class {
    let class = |retryable, severity, recovery| Class {
        retryable,
        severity,
        recovery,
    };
    if code.ends_with(codes::SUFFIX_NOT_FOUND) || code.ends_with(codes::SUFFIX_VALIDATION_ERROR) {
        class(false, Severity::Low, Recovery::FixRequest)
    } else if code.ends_with(codes::SUFFIX_HARDWARE_ERROR)
        || code.ends_with(codes::SUFFIX_DRIVER_ERROR)
    {
        class(false, Severity::High, Recovery::CheckHardware)
    } else if code.ends_with(codes::SUFFIX_OUT_OF_MEMORY) {
        class(false, Severity::High, Recovery::FixRequest)
    } else if code.ends_with(codes::SUFFIX_NOT_AVAILABLE) || code.ends_with(codes::SUFFIX_TIMEOUT) {
        class(true, Severity::Medium, Recovery::Retry)
    } else if code == codes::UNRESOLVED_DEPENDENCY {
        class(true, Severity::Medium, Recovery::ResolveDependency)
    } else if code == codes::PROTOCOL_ERROR {
        class(false, Severity::High, Recovery::Escalate)
    } else {
        class(false, Severity::Medium, Recovery::Escalate)
    }
}
