use serde_json::Value;
use std::io::Write;
use std::process::{Command, Output};

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("create temp config");
    file.write_all(contents.as_bytes()).expect("write temp config");
    file
}

fn mock_config() -> tempfile::NamedTempFile {
    write_config(&format!(
        concat!(
            "[workers.device]\n",
            "command = \"{mock}\"\n",
            "\n",
            "[workers.model]\n",
            "command = \"{mock}\"\n",
            "\n",
            "[health]\n",
            "enabled = false\n",
            "\n",
            "[timeouts]\n",
            "shutdown_grace_ms = 500\n",
        ),
        mock = env!("CARGO_BIN_EXE_mock-worker")
    ))
}

fn run(config: &tempfile::NamedTempFile, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_worker-bridge"))
        .arg("--config")
        .arg(config.path())
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("run worker-bridge")
}

fn stdout_json(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(&stdout).unwrap_or_else(|e| panic!("stdout is not JSON ({e}): {stdout}"))
}

#[test]
fn list_prints_device_entities() {
    let config = mock_config();
    let output = run(&config, &["list", "device"]);
    assert!(output.status.success(), "{output:?}");

    let devices = stdout_json(&output);
    assert_eq!(devices.as_array().map(Vec::len), Some(2));
    assert_eq!(devices[0]["id"], "gpu-0");
}

#[test]
fn call_prints_response_data() {
    let config = mock_config();
    let output = run(
        &config,
        &["call", "model", "model.echo", "--data", r#"{"name":"llama"}"#],
    );
    assert!(output.status.success(), "{output:?}");
    assert_eq!(stdout_json(&output)["name"], "llama");
}

#[test]
fn failures_print_the_domain_error_and_exit_nonzero() {
    let config = mock_config();
    let output = run(&config, &["ensure", "device", "gpu-9"]);
    assert!(!output.status.success());

    let error = &stdout_json(&output)["error"];
    assert_eq!(error["code"], "UNRESOLVED_DEPENDENCY");
    assert_eq!(error["domain"], "device");
    assert_eq!(error["retryable"], true);
}

#[test]
fn unconfigured_worker_is_reported() {
    let config = mock_config();
    let output = run(&config, &["call", "inference", "run"]);
    assert!(!output.status.success());
    assert_eq!(
        stdout_json(&output)["error"]["code"],
        "WORKER_NOT_CONFIGURED"
    );
}

#[test]
fn invalid_config_is_rejected() {
    let config = write_config("[workers.device]\ncommand = \"\"\n");
    let output = run(&config, &["status"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("command is empty"), "stderr: {stderr}");
}

#[test]
fn config_command_shows_resolved_settings() {
    let config = mock_config();
    let output = run(&config, &["config"]);
    assert!(output.status.success(), "{output:?}");

    let shown = stdout_json(&output);
    assert_eq!(shown["exists"], true);
    assert_eq!(shown["config"]["health"]["enabled"], false);
    assert_eq!(shown["config"]["cache"]["ttl_secs"]["device"], 120);
}

#[test]
fn config_loading_is_traced_when_requested() {
    let config = mock_config();
    let output = Command::new(env!("CARGO_BIN_EXE_worker-bridge"))
        .arg("--config")
        .arg(config.path())
        .arg("config")
        .env("RUST_LOG", "worker_bridge=trace")
        .output()
        .expect("run worker-bridge");
    assert!(output.status.success(), "{output:?}");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Loading bridge config"), "stderr: {stderr}");
    assert_eq!(stdout_json(&output)["exists"], true);
}
