use super::{print_json, Status};
use serde_json::json;
use std::path::Path;
use worker_bridge::{env, BridgeConfig};

pub(crate) fn cmd_config(config: &BridgeConfig, explicit: Option<&Path>) -> anyhow::Result<Status> {
    let path = explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(env::config_path);

    print_json(&json!({
        "path": path.display().to_string(),
        "exists": path.exists(),
        "config": config,
    }))?;
    Ok(Status::Success)
}
