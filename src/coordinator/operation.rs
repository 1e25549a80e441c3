use super::graph::EntityRef;
use crate::translator::DomainError;
use crate::worker::WorkerType;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// One domain call plus the upstream entities it needs and the entities it
/// changes.
#[derive(Debug, Clone)]
pub struct Operation {
    pub domain: WorkerType,
    pub action: String,
    pub payload: Value,
    pub dependencies: Vec<EntityRef>,
    pub mutates: Vec<EntityRef>,
    pub timeout: Option<Duration>,
    /// Pass resolved upstream entities to the worker under `dependencies`
    pub propagate: bool,
}

impl Operation {
    pub fn new(domain: WorkerType, action: impl Into<String>, payload: Value) -> Self {
        Self {
            domain,
            action: action.into(),
            payload,
            dependencies: Vec::new(),
            mutates: Vec::new(),
            timeout: None,
            propagate: false,
        }
    }

    /// Require `id` to exist in the latest `domain` listing before dispatch
    pub fn depends_on(mut self, domain: WorkerType, id: impl Into<String>) -> Self {
        self.dependencies.push(EntityRef::new(domain, id));
        self
    }

    /// Invalidate `id` in `domain` once the call has been dispatched
    pub fn mutates(mut self, domain: WorkerType, id: impl Into<String>) -> Self {
        self.mutates.push(EntityRef::new(domain, id));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn propagate(mut self, propagate: bool) -> Self {
        self.propagate = propagate;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    ResolvingDependencies,
    Dispatching,
    Completed,
    Failed { origin: WorkerType, code: String },
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationState::Completed | OperationState::Failed { .. })
    }

    fn can_advance_to(&self, next: &OperationState) -> bool {
        use OperationState::*;
        matches!(
            (self, next),
            (Pending, ResolvingDependencies)
                | (ResolvingDependencies, Dispatching)
                | (Dispatching, Completed)
                | (Pending | ResolvingDependencies | Dispatching, Failed { .. })
        )
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationState::Pending => f.write_str("pending"),
            OperationState::ResolvingDependencies => f.write_str("resolving_dependencies"),
            OperationState::Dispatching => f.write_str("dispatching"),
            OperationState::Completed => f.write_str("completed"),
            OperationState::Failed { origin, code } => write!(f, "failed({origin}: {code})"),
        }
    }
}

/// Failure of a coordinated operation.
///
/// `origin` is the domain whose failure ended the operation; `upstream` is
/// set when that is a dependency rather than the operation's own domain.
#[derive(Debug, Clone, Error)]
#[error("{action} failed in {origin}: {error}")]
pub struct OperationFailure {
    pub operation_id: Uuid,
    pub action: String,
    pub domain: WorkerType,
    pub origin: WorkerType,
    pub upstream: bool,
    pub error: DomainError,
    pub history: Vec<OperationState>,
}

impl OperationFailure {
    pub fn code(&self) -> &str {
        &self.error.code
    }

    pub fn state(&self) -> OperationState {
        OperationState::Failed {
            origin: self.origin,
            code: self.error.code.clone(),
        }
    }
}

/// Tracks one operation through its state machine
pub(crate) struct OperationRun {
    id: Uuid,
    domain: WorkerType,
    action: String,
    history: Vec<OperationState>,
}

impl OperationRun {
    pub(crate) fn new(op: &Operation) -> Self {
        Self {
            id: Uuid::new_v4(),
            domain: op.domain,
            action: op.action.clone(),
            history: vec![OperationState::Pending],
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn state(&self) -> &OperationState {
        // history always starts with Pending
        self.history.last().unwrap_or(&OperationState::Pending)
    }

    pub(crate) fn advance(&mut self, next: OperationState) {
        if !self.state().can_advance_to(&next) {
            warn!(
                operation = %self.id,
                from = %self.state(),
                to = %next,
                "Illegal operation state transition"
            );
            return;
        }
        debug!(operation = %self.id, action = %self.action, state = %next, "Operation state");
        self.history.push(next);
    }

    pub(crate) fn fail(mut self, origin: WorkerType, error: DomainError) -> OperationFailure {
        self.advance(OperationState::Failed {
            origin,
            code: error.code.clone(),
        });
        OperationFailure {
            operation_id: self.id,
            action: self.action,
            domain: self.domain,
            origin,
            upstream: origin != self.domain,
            error,
            history: self.history,
        }
    }

    #[cfg(test)]
    fn history(&self) -> &[OperationState] {
        &self.history
    }
}

/// Outcome of a batch of independent operations
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Successful results by submission index
    pub completed: Vec<(usize, Value)>,
    /// Failures by submission index
    pub failed: Vec<(usize, OperationFailure)>,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Some but not all operations succeeded
    pub fn is_partial(&self) -> bool {
        !self.completed.is_empty() && !self.failed.is_empty()
    }

    /// Failures grouped by the domain that caused them
    pub fn failures_by_origin(&self) -> Vec<(WorkerType, usize)> {
        let mut counts: Vec<(WorkerType, usize)> = Vec::new();
        for (_, failure) in &self.failed {
            match counts.iter_mut().find(|(d, _)| *d == failure.origin) {
                Some((_, n)) => *n += 1,
                None => counts.push((failure.origin, 1)),
            }
        }
        counts.sort();
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translator::{Recovery, Severity};
    use serde_json::json;

    fn domain_error(code: &str) -> DomainError {
        DomainError {
            code: code.into(),
            message: "boom".into(),
            retryable: false,
            severity: Severity::Medium,
            recovery: Recovery::Escalate,
            domain: None,
        }
    }

    #[test]
    fn builder_collects_dependencies_and_mutations() {
        let op = Operation::new(WorkerType::Memory, "allocate", json!({"bytes": 1}))
            .depends_on(WorkerType::Device, "gpu-0")
            .mutates(WorkerType::Device, "gpu-0")
            .timeout(Duration::from_secs(2))
            .propagate(true);
        assert_eq!(op.dependencies, vec![EntityRef::new(WorkerType::Device, "gpu-0")]);
        assert_eq!(op.mutates.len(), 1);
        assert_eq!(op.timeout, Some(Duration::from_secs(2)));
        assert!(op.propagate);
    }

    #[test]
    fn happy_path_transitions() {
        let op = Operation::new(WorkerType::Model, "load", json!({}));
        let mut run = OperationRun::new(&op);
        run.advance(OperationState::ResolvingDependencies);
        run.advance(OperationState::Dispatching);
        run.advance(OperationState::Completed);
        assert_eq!(run.state(), &OperationState::Completed);
        assert_eq!(run.history().len(), 4);
        assert!(run.state().is_terminal());
    }

    #[test]
    fn upstream_failure_is_distinguishable() {
        let op = Operation::new(WorkerType::Memory, "allocate", json!({}));
        let mut run = OperationRun::new(&op);
        run.advance(OperationState::ResolvingDependencies);
        let failure = run.fail(WorkerType::Device, domain_error("UNRESOLVED_DEPENDENCY"));
        assert!(failure.upstream);
        assert_eq!(failure.origin, WorkerType::Device);
        assert_eq!(failure.domain, WorkerType::Memory);
        assert_eq!(
            failure.history.last(),
            Some(&OperationState::Failed {
                origin: WorkerType::Device,
                code: "UNRESOLVED_DEPENDENCY".into()
            })
        );
        assert_eq!(failure.state(), failure.history.last().cloned().unwrap());
    }

    #[test]
    fn own_failure_is_not_upstream() {
        let op = Operation::new(WorkerType::Memory, "allocate", json!({}));
        let mut run = OperationRun::new(&op);
        run.advance(OperationState::ResolvingDependencies);
        run.advance(OperationState::Dispatching);
        let failure = run.fail(WorkerType::Memory, domain_error("MEMORY_OUT_OF_MEMORY"));
        assert!(!failure.upstream);
        assert_eq!(failure.code(), "MEMORY_OUT_OF_MEMORY");
    }

    #[test]
    fn terminal_states_do_not_advance() {
        assert!(!OperationState::Completed.can_advance_to(&OperationState::Dispatching));
        assert!(!OperationState::Pending.can_advance_to(&OperationState::Completed));
        assert!(OperationState::Pending.can_advance_to(&OperationState::Failed {
            origin: WorkerType::Device,
            code: "X".into()
        }));
    }

    #[test]
    fn batch_report_groups_failures() {
        let op = Operation::new(WorkerType::Inference, "run", json!({}));
        let mk = |origin| OperationRun::new(&op).fail(origin, domain_error("E"));
        let report = BatchReport {
            completed: vec![(0, json!(1))],
            failed: vec![
                (1, mk(WorkerType::Model)),
                (2, mk(WorkerType::Inference)),
                (3, mk(WorkerType::Model)),
            ],
        };
        assert!(report.is_partial());
        assert!(!report.is_complete());
        assert_eq!(
            report.failures_by_origin(),
            vec![(WorkerType::Model, 2), (WorkerType::Inference, 1)]
        );
    }
}
