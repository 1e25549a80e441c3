//! Worker subprocess management
//!
//! Each capability domain is served by one external worker executable that
//! speaks newline-delimited JSON over its stdin/stdout. This module handles:
//! - Process lifecycle (lazy spawn, restart, shutdown)
//! - Request/response correlation and timeouts
//! - Health probing and auto-restart
//! - Capture of non-protocol output for operators
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 WorkerManager                │
//! ├──────────────────────────────────────────────┤
//! │  slots (permits) │  Codec  │  HealthManager  │
//! ├──────────────────────────────────────────────┤
//! │ device │ memory │ model │ processing │ ...   │
//! └──────────────────────────────────────────────┘
//! ```

pub mod health;
pub mod log_buffer;
pub mod manager;
pub mod process;
pub mod protocol;
pub mod types;

pub use health::{HealthManager, HealthStatus, ProbeResult};
pub use log_buffer::{DiagnosticLine, LogBuffer, Stream};
pub use manager::{ManagerSettings, WorkerLease, WorkerManager};
pub use process::WorkerProcess;
pub use protocol::{Codec, Outcome, ProtocolError, Request, RequestId, Response};
pub use types::{UnknownWorkerType, WorkerState, WorkerStatus, WorkerType};
