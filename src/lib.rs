pub mod bridge;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod env;
pub mod error;
pub mod logging;
pub mod translator;
pub mod worker;

pub use bridge::Bridge;
pub use cache::{CacheKey, ResponseCache, Scope};
pub use config::{BridgeConfig, ConfigError, DomainConfig, WorkerCommand};
pub use coordinator::{BatchReport, DomainCoordinator, EntityRef, Operation, OperationFailure};
pub use error::{BridgeError, Result};
pub use translator::{DomainError, ErrorTranslator, Recovery, Severity};
pub use worker::{WorkerManager, WorkerType};
