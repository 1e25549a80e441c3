pub(crate) mod call;
pub(crate) mod config;
pub(crate) mod domain;
pub(crate) mod status;

use serde::Serialize;
use serde_json::json;
use worker_bridge::{BridgeError, ErrorTranslator};

/// How a command ended, decides the process exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    Success,
    Failed,
}

impl Status {
    pub(crate) fn is_success(self) -> bool {
        self == Status::Success
    }
}

pub(crate) fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print the outcome of a bridge call: the value on success, the translated
/// error otherwise.
pub(crate) fn report<T: Serialize>(result: Result<T, BridgeError>) -> anyhow::Result<Status> {
    match result {
        Ok(value) => {
            print_json(&value)?;
            Ok(Status::Success)
        }
        Err(e) => {
            tracing::debug!(error = %e, "Command failed");
            let error = ErrorTranslator::new().translate(&e);
            print_json(&json!({ "error": error }))?;
            Ok(Status::Failed)
        }
    }
}
