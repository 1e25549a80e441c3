//! Static cross-domain ordering:
//! device ≺ memory ≺ model ≺ processing ≺ inference ≺ postprocessing.

use crate::error::{BridgeError, Result};
use crate::worker::WorkerType;

/// Reference to one entity of a domain
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub domain: WorkerType,
    pub id: String,
}

impl EntityRef {
    pub fn new(domain: WorkerType, id: impl Into<String>) -> Self {
        Self {
            domain,
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyGraph;

impl DependencyGraph {
    pub fn may_depend(dependent: WorkerType, dependency: WorkerType) -> bool {
        dependency.rank() < dependent.rank()
    }

    pub fn check(dependent: WorkerType, dependency: WorkerType) -> Result<()> {
        if Self::may_depend(dependent, dependency) {
            Ok(())
        } else {
            Err(BridgeError::DependencyOrder {
                dependent,
                dependency,
            })
        }
    }

    /// Sort references so earlier domains resolve first, dropping duplicates
    pub fn resolution_order(refs: &[EntityRef]) -> Vec<EntityRef> {
        let mut ordered = refs.to_vec();
        ordered.sort_by(|a, b| a.domain.cmp(&b.domain).then_with(|| a.id.cmp(&b.id)));
        ordered.dedup();
        ordered
    }
}
