//! Scriptable worker used by the integration tests and for local smoke runs.
//!
//! Speaks the bridge's line protocol on stdin/stdout. The part of the action
//! after the domain prefix selects the behavior:
//!
//! | action      | behavior                                                    |
//! |-------------|-------------------------------------------------------------|
//! | `ping`      | `{"status": "ok"}`, or silence after `hang_pings`           |
//! | `list`      | entity listing (`MOCK_DEVICES` sets the device ids)         |
//! | `echo`      | returns the request data                                    |
//! | `sleep`     | sleeps `data.ms` milliseconds, then answers                 |
//! | `fail`      | business error `data.code` (default `<DOMAIN>_VALIDATION_ERROR`) |
//! | `garbage`   | answers with a frame that has no `request_id`               |
//! | `wrong_id`  | answers under a correlation id nobody asked for             |
//! | `diag`      | prints a diagnostic line to stdout and stderr, then answers |
//! | `crash`     | exits with status 3 without answering                       |
//! | `pid`       | `{"pid": <process id>}`                                     |
//! | `hang_pings`| stops answering pings                                       |
//! | `allocate`  | fake allocation echoing any propagated dependencies         |

use serde_json::{json, Map, Value};
use std::io::{self, BufRead, Write};
use std::thread;
use std::time::Duration;

const DEFAULT_DEVICES: &str = "gpu-0,gpu-1";
const WRONG_ID: &str = "00000000-0000-0000-0000-000000000000";

#[derive(Default)]
struct State {
    answer_pings: bool,
    list_calls: u64,
    allocations: u64,
}

fn main() {
    eprintln!("mock worker {} ready", std::process::id());

    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    let mut state = State {
        answer_pings: true,
        ..State::default()
    };

    for line in stdin.lock().lines() {
        let Ok(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        let request: Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(e) => {
                eprintln!("unparseable request: {e}");
                continue;
            }
        };
        if let Some(frame) = handle(&mut state, &request, &mut stdout) {
            if writeln!(stdout, "{frame}").and_then(|_| stdout.flush()).is_err() {
                break;
            }
        }
    }
}

fn handle(state: &mut State, request: &Value, out: &mut impl Write) -> Option<Value> {
    let id = request.get("request_id").cloned().unwrap_or(Value::Null);
    let action = request.get("action").and_then(Value::as_str).unwrap_or("");
    let data = request.get("data").cloned().unwrap_or(Value::Null);
    let (domain, op) = action.split_once('.').unwrap_or(("unknown", action));

    let ok = |data: Value| json!({"request_id": id, "success": true, "data": data});
    let err = |code: &str, message: &str| {
        json!({
            "request_id": id,
            "success": false,
            "data": null,
            "error_code": code,
            "error_message": message,
        })
    };

    match op {
        "ping" if state.answer_pings => Some(ok(json!({"status": "ok"}))),
        "ping" => None,
        "hang_pings" => {
            state.answer_pings = false;
            Some(ok(json!({"answer_pings": false})))
        }
        "list" => {
            state.list_calls += 1;
            Some(ok(listing(domain, state.list_calls)))
        }
        "echo" => Some(ok(data)),
        "sleep" => {
            let ms = data.get("ms").and_then(Value::as_u64).unwrap_or(0);
            thread::sleep(Duration::from_millis(ms));
            Some(ok(json!({"slept_ms": ms})))
        }
        "fail" => {
            let default_code = format!("{}_VALIDATION_ERROR", domain.to_ascii_uppercase());
            let code = data.get("code").and_then(Value::as_str).unwrap_or(&default_code);
            let message = data
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("requested failure");
            Some(err(code, message))
        }
        "garbage" => Some(json!({"success": true, "data": {"note": "no id"}})),
        "wrong_id" => Some(json!({"request_id": WRONG_ID, "success": true, "data": null})),
        "diag" => {
            let _ = writeln!(out, "diagnostic: handling {action}");
            let _ = out.flush();
            eprintln!("warning: {action} is noisy");
            Some(ok(json!({"diag": true})))
        }
        "crash" => {
            eprintln!("crashing on request");
            std::process::exit(3);
        }
        "pid" => Some(ok(json!({"pid": std::process::id()}))),
        "allocate" => {
            state.allocations += 1;
            let mut result = Map::new();
            result.insert(
                "allocation_id".into(),
                json!(format!("alloc-{}", state.allocations)),
            );
            for key in ["device_id", "bytes", "dependencies"] {
                if let Some(value) = data.get(key) {
                    result.insert(key.into(), value.clone());
                }
            }
            Some(ok(Value::Object(result)))
        }
        _ => Some(err(
            &format!("{}_VALIDATION_ERROR", domain.to_ascii_uppercase()),
            &format!("unknown action '{action}'"),
        )),
    }
}

fn listing(domain: &str, generation: u64) -> Value {
    if domain == "device" {
        let ids = std::env::var("MOCK_DEVICES").unwrap_or_else(|_| DEFAULT_DEVICES.to_string());
        let devices: Vec<Value> = ids
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| {
                json!({
                    "id": id,
                    "memory_total": 24_000_000_000u64,
                    "memory_free": 20_000_000_000u64,
                    "generation": generation,
                })
            })
            .collect();
        let count = devices.len();
        return json!({"devices": devices, "count": count});
    }
    json!([{"id": format!("{domain}-0"), "generation": generation}])
}
