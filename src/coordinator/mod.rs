//! Cross-domain coordination.
//!
//! The coordinator sits between callers and the [`WorkerManager`]: it keeps
//! domain listings in the [`ResponseCache`], resolves the upstream entities an
//! operation depends on before dispatching it, and invalidates whatever the
//! operation changed.

pub mod graph;
pub mod operation;

pub use graph::{DependencyGraph, EntityRef};
pub use operation::{BatchReport, Operation, OperationFailure, OperationState};

use crate::cache::{CacheKey, ResponseCache, Scope};
use crate::config::{BridgeConfig, DomainConfig};
use crate::error::{BridgeError, Result};
use crate::translator::ErrorTranslator;
use crate::worker::{Outcome, Response, WorkerManager, WorkerType};
use operation::OperationRun;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub struct DomainCoordinator {
    manager: Arc<WorkerManager>,
    cache: Arc<ResponseCache<Value>>,
    translator: ErrorTranslator,
    domains: HashMap<WorkerType, DomainConfig>,
    /// One listing refresh in flight per domain
    refreshing: HashMap<WorkerType, Mutex<()>>,
}

impl DomainCoordinator {
    pub fn new(
        manager: Arc<WorkerManager>,
        cache: Arc<ResponseCache<Value>>,
        config: &BridgeConfig,
    ) -> Self {
        let domains = WorkerType::ALL
            .into_iter()
            .map(|domain| (domain, config.domain(domain)))
            .collect();
        let refreshing = WorkerType::ALL
            .into_iter()
            .map(|domain| (domain, Mutex::new(())))
            .collect();
        Self {
            manager,
            cache,
            translator: ErrorTranslator::new(),
            domains,
            refreshing,
        }
    }

    pub fn manager(&self) -> &Arc<WorkerManager> {
        &self.manager
    }

    pub fn cache(&self) -> &Arc<ResponseCache<Value>> {
        &self.cache
    }

    pub fn translator(&self) -> &ErrorTranslator {
        &self.translator
    }

    fn domain_config(&self, domain: WorkerType) -> &DomainConfig {
        // populated for every worker type in `new`
        &self.domains[&domain]
    }

    /// Every entity of `domain`, served from cache while the listing is fresh
    pub async fn list(&self, domain: WorkerType) -> Result<Vec<Value>> {
        if let Some(items) = self.cached_listing(domain) {
            return Ok(items);
        }

        let _refresh = self.refreshing[&domain].lock().await;
        // another caller may have refreshed while we waited
        if let Some(items) = self.cached_listing(domain) {
            return Ok(items);
        }
        self.refresh(domain).await
    }

    fn cached_listing(&self, domain: WorkerType) -> Option<Vec<Value>> {
        match self.cache.get(domain, &CacheKey::Listing)? {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Fetch the listing from the worker and replace the domain's cache with it
    async fn refresh(&self, domain: WorkerType) -> Result<Vec<Value>> {
        let config = self.domain_config(domain);
        debug!(%domain, action = %config.list_action, "Refreshing domain listing");

        let response = self
            .manager
            .execute(domain, &config.list_action, Value::Object(Map::new()), None)
            .await?;
        let data = response_data(domain, response)?;
        let items = extract_items(domain, config, data)?;

        let mut entries = Vec::with_capacity(items.len() + 1);
        for item in &items {
            let id = entity_id(item, &config.id_field).ok_or_else(|| {
                BridgeError::InvalidListing {
                    domain,
                    reason: format!("entity without a usable '{}' field", config.id_field),
                }
            })?;
            entries.push((CacheKey::Entity(id), item.clone()));
        }
        entries.push((CacheKey::Listing, Value::Array(items.clone())));

        self.cache.replace_all(domain, entries, None);
        info!(%domain, entities = items.len(), "Domain listing cached");
        Ok(items)
    }

    /// Entity `id` of `domain`, refreshing the listing when it is not cached.
    ///
    /// An id absent from the fresh listing is an unresolved dependency.
    pub async fn ensure(&self, domain: WorkerType, id: &str) -> Result<Value> {
        let key = CacheKey::entity(id);
        if let Some(value) = self.cache.get(domain, &key) {
            return Ok(value);
        }

        let id_field = &self.domain_config(domain).id_field;
        let items = self.list(domain).await?;
        items
            .into_iter()
            .find(|item| entity_id(item, id_field).as_deref() == Some(id))
            .ok_or_else(|| BridgeError::UnresolvedDependency {
                domain,
                id: id.to_string(),
                reason: "not present in the latest listing".into(),
            })
    }

    /// Drop entity `id` and the listing it came from, so the next `ensure`
    /// goes back to the worker.
    pub fn invalidate(&self, domain: WorkerType, id: &str) -> usize {
        self.cache
            .invalidate(domain, Scope::Key(CacheKey::entity(id)))
            + self.cache.invalidate(domain, Scope::Key(CacheKey::Listing))
    }

    /// Resolve dependencies, dispatch, then invalidate mutated entities
    pub async fn execute(&self, op: Operation) -> std::result::Result<Value, OperationFailure> {
        let mut run = OperationRun::new(&op);
        debug!(
            operation = %run.id(),
            domain = %op.domain,
            action = %op.action,
            dependencies = op.dependencies.len(),
            "Executing operation"
        );

        run.advance(OperationState::ResolvingDependencies);
        for dep in &op.dependencies {
            if let Err(e) = DependencyGraph::check(op.domain, dep.domain) {
                return Err(run.fail(op.domain, self.translator.translate(&e)));
            }
        }

        let mut resolved = Vec::with_capacity(op.dependencies.len());
        for dep in DependencyGraph::resolution_order(&op.dependencies) {
            match self.ensure(dep.domain, &dep.id).await {
                Ok(value) => resolved.push((dep, value)),
                Err(e) => {
                    let err = unresolved(&dep, e);
                    warn!(
                        operation = %run.id(),
                        domain = %op.domain,
                        upstream = %dep.domain,
                        id = %dep.id,
                        error = %err,
                        "Dependency could not be resolved"
                    );
                    return Err(run.fail(dep.domain, self.translator.translate(&err)));
                }
            }
        }

        let payload = if op.propagate {
            with_dependencies(op.payload, &resolved)
        } else {
            op.payload
        };

        run.advance(OperationState::Dispatching);
        let result = match self
            .manager
            .execute(op.domain, &op.action, payload, op.timeout)
            .await
        {
            Ok(response) => response_data(op.domain, response),
            Err(e) => Err(e),
        };

        // the worker may have changed state even when the call failed
        for target in &op.mutates {
            self.invalidate(target.domain, &target.id);
        }

        match result {
            Ok(value) => {
                run.advance(OperationState::Completed);
                Ok(value)
            }
            Err(e) => {
                debug!(operation = %run.id(), error = %e, "Operation failed");
                Err(run.fail(op.domain, self.translator.translate(&e)))
            }
        }
    }

    /// Run independent operations concurrently; results keep submission order
    pub async fn execute_all(self: &Arc<Self>, ops: Vec<Operation>) -> BatchReport {
        let mut tasks = JoinSet::new();
        for (index, op) in ops.into_iter().enumerate() {
            let coordinator = Arc::clone(self);
            tasks.spawn(async move { (index, coordinator.execute(op).await) });
        }

        let mut report = BatchReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(value))) => report.completed.push((index, value)),
                Ok((index, Err(failure))) => report.failed.push((index, failure)),
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => warn!(error = %e, "Batch operation task was cancelled"),
            }
        }
        report.completed.sort_by_key(|(index, _)| *index);
        report.failed.sort_by_key(|(index, _)| *index);

        if !report.is_complete() {
            warn!(
                completed = report.completed.len(),
                failed = report.failed.len(),
                "Batch finished with failures"
            );
        }
        report
    }
}

/// Success data of a response, or the worker's business error
fn response_data(domain: WorkerType, response: Response) -> Result<Value> {
    match response.outcome {
        Outcome::Success(data) => Ok(data),
        Outcome::Failure { code, message } => Err(BridgeError::Worker {
            worker: domain,
            code,
            message,
        }),
    }
}

fn unresolved(dep: &EntityRef, cause: BridgeError) -> BridgeError {
    match cause {
        e @ BridgeError::UnresolvedDependency { .. } => e,
        e => BridgeError::UnresolvedDependency {
            domain: dep.domain,
            id: dep.id.clone(),
            reason: e.to_string(),
        },
    }
}

/// Pull the entity array out of a listing response
fn extract_items(domain: WorkerType, config: &DomainConfig, data: Value) -> Result<Vec<Value>> {
    let invalid = |reason: String| BridgeError::InvalidListing { domain, reason };

    if let Some(field) = &config.items_field {
        return match data {
            Value::Object(mut map) => match map.remove(field) {
                Some(Value::Array(items)) => Ok(items),
                Some(_) => Err(invalid(format!("'{field}' is not an array"))),
                None => Err(invalid(format!("missing '{field}'"))),
            },
            _ => Err(invalid(format!("expected an object holding '{field}'"))),
        };
    }

    match data {
        Value::Array(items) => Ok(items),
        Value::Object(map) => {
            let mut arrays = map.into_iter().filter_map(|(_, v)| match v {
                Value::Array(items) => Some(items),
                _ => None,
            });
            match (arrays.next(), arrays.next()) {
                (Some(items), None) => Ok(items),
                (None, _) => Err(invalid("no entity array in response".into())),
                (Some(_), Some(_)) => Err(invalid(
                    "several arrays in response, set items_field".into(),
                )),
            }
        }
        other => Err(invalid(format!("expected an array or object, got {other}"))),
    }
}

fn entity_id(item: &Value, id_field: &str) -> Option<String> {
    match item.get(id_field)? {
        Value::String(id) => Some(id.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Attach resolved upstream entities under `dependencies.<domain>.<id>`
fn with_dependencies(payload: Value, resolved: &[(EntityRef, Value)]) -> Value {
    let mut map = match payload {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            warn!("Payload is not an object, dependencies not propagated");
            return other;
        }
    };

    let deps = map
        .entry("dependencies")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(deps) = deps {
        for (dep, value) in resolved {
            let by_id = deps
                .entry(dep.domain.as_str())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(by_id) = by_id {
                by_id.insert(dep.id.clone(), value.clone());
            }
        }
    }
    Value::Object(map)
}
