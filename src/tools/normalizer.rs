//! Result normalizer
//!
//! Maps heterogeneous provider payloads onto one success/failure contract.
//! Decision precedence, first match wins:
//!
//! 1. integer `exit_code` on a process-like tool: success iff 0, verified
//! 2. `status` string: matched case-insensitively against the success and
//!    failure sets; unknown statuses are kept, success defaults to true,
//!    unverified
//! 3. non-empty `error`: failure, verified
//! 4. an output-like field with a non-null value: success, verified
//! 5. otherwise optimistic success, unverified
//!
//! `verified`, `success` and `tool` are always written. `status`,
//! `exit_code`, `error` and `duration_ms` keep any non-null provider value
//! and are filled in otherwise. Other keys pass through untouched.

use crate::errors::ErrorKind;
use crate::tools::retry::is_transient_error;
use crate::tools::types::{fields, ToolCategory, ToolResult};
use serde_json::{Map, Value};
use std::time::Duration;

/// Statuses that mean the call succeeded
pub const SUCCESS_STATUSES: &[&str] = &[
    "success",
    "succeeded",
    "ok",
    "completed",
    "complete",
    "done",
    "passed",
    "created",
    "updated",
    "found",
];

/// Statuses that mean the call failed
pub const FAILURE_STATUSES: &[&str] = &[
    "error",
    "failed",
    "failure",
    "fail",
    "timeout",
    "timed_out",
    "killed",
    "denied",
    "cancelled",
    "canceled",
    "aborted",
    "not_found",
    "no_results",
    "confirmation_required",
];

/// Where a non-string provider status is kept
pub const PROVIDER_STATUS: &str = "provider_status";

/// Keys that carry a payload worth treating as evidence of success
const OUTPUT_KEYS: &[&str] = &[
    "output", "content", "result", "results", "data", "text", "stdout", "value", "items",
    "matches", "files",
];

/// Outcome of the precedence rules before it is written into the map
#[derive(Debug, Clone, PartialEq, Eq)]
struct Decision {
    success: bool,
    verified: bool,
    status: Option<String>,
}

/// Normalize a raw provider payload
pub fn normalize(raw: Value, tool: &str, category: ToolCategory, elapsed: Duration) -> ToolResult {
    let mut map = into_object(raw);
    preserve_raw_status(&mut map);
    let decision = decide(&map, category);

    let mut result = ToolResult::from_map(map);

    result.insert(fields::VERIFIED, Value::Bool(decision.verified));
    result.insert(fields::SUCCESS, Value::Bool(decision.success));
    result.insert(fields::TOOL, Value::String(tool.to_string()));

    match decision.status {
        Some(status) => result.insert(fields::STATUS, Value::String(status)),
        None => {
            let fallback = if decision.success { "completed" } else { "failed" };
            fill_null(&mut result, fields::STATUS, Value::from(fallback));
        }
    }

    fill_null(&mut result, fields::EXIT_CODE, Value::Null);
    fill_null(
        &mut result,
        fields::DURATION_MS,
        Value::from(elapsed.as_millis() as u64),
    );

    if decision.success {
        fill_null(&mut result, fields::ERROR, Value::Null);
    } else {
        let message = derive_error(&result, tool);
        fill_null(&mut result, fields::ERROR, Value::String(message));
        let kind = classify_failure(&result);
        result.insert_missing(fields::ERROR_KIND, Value::from(kind.as_str()));
    }

    result
}

/// Coerce any payload into an object, keeping non-object payloads under
/// `output`
fn into_object(raw: Value) -> Map<String, Value> {
    match raw {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("output".to_string(), other);
            map
        }
    }
}

fn decide(map: &Map<String, Value>, category: ToolCategory) -> Decision {
    // Rule 1
    if category.is_process_like() {
        if let Some(code) = map.get(fields::EXIT_CODE).and_then(Value::as_i64) {
            let success = code == 0;
            let status = if success {
                "completed".to_string()
            } else {
                map.get(fields::STATUS)
                    .and_then(Value::as_str)
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or("failed")
                    .to_string()
            };
            return Decision {
                success,
                verified: true,
                status: Some(status),
            };
        }
    }

    // Rule 2
    if let Some(status) = map.get(fields::STATUS).and_then(Value::as_str) {
        let lowered = status.trim().to_ascii_lowercase();
        if SUCCESS_STATUSES.contains(&lowered.as_str()) {
            return Decision {
                success: true,
                verified: true,
                status: Some(status.to_string()),
            };
        }
        if FAILURE_STATUSES.contains(&lowered.as_str()) {
            return Decision {
                success: false,
                verified: true,
                status: Some(status.to_string()),
            };
        }
        return Decision {
            success: true,
            verified: false,
            status: Some(status.to_string()),
        };
    }

    // Rule 3, including an explicit provider `success: false`
    if has_error(map) || map.get(fields::SUCCESS) == Some(&Value::Bool(false)) {
        return Decision {
            success: false,
            verified: true,
            status: None,
        };
    }

    // Rule 4
    let has_output = OUTPUT_KEYS
        .iter()
        .any(|key| map.get(*key).map(|v| !v.is_null()).unwrap_or(false));
    if has_output {
        return Decision {
            success: true,
            verified: true,
            status: None,
        };
    }

    // Rule 5
    Decision {
        success: true,
        verified: false,
        status: None,
    }
}

/// `status` must be a string; a provider's non-string status (an HTTP code,
/// say) moves to `provider_status` so it is not lost
fn preserve_raw_status(map: &mut Map<String, Value>) {
    let non_string = matches!(map.get(fields::STATUS), Some(v) if !v.is_null() && !v.is_string());
    if non_string {
        if let Some(raw) = map.remove(fields::STATUS) {
            map.entry(PROVIDER_STATUS).or_insert(raw);
        }
    }
}

fn has_error(map: &Map<String, Value>) -> bool {
    match map.get(fields::ERROR) {
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Null) | None => false,
        Some(Value::Bool(flag)) => *flag,
        Some(_) => true,
    }
}

fn fill_null(result: &mut ToolResult, key: &str, value: Value) {
    let missing = result.get(key).map(Value::is_null).unwrap_or(true);
    if missing {
        result.insert(key, value);
    }
}

fn derive_error(result: &ToolResult, tool: &str) -> String {
    if let Some(code) = result.exit_code() {
        if code != 0 {
            return format!("Command exited with code {}", code);
        }
    }
    match result.get(fields::ERROR) {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(Value::Null) | None | Some(Value::String(_)) => {
            format!("{} reported status '{}'", tool, result.status())
        }
        Some(other) => other.to_string(),
    }
}

/// Bucket a failed, normalized result into the error taxonomy
pub fn classify_failure(result: &ToolResult) -> ErrorKind {
    let status = result.status().to_ascii_lowercase();
    if status == "timeout" || status == "timed_out" {
        return ErrorKind::ProcessTimeout;
    }
    match result.error() {
        Some(error) if is_transient_error(error) => ErrorKind::TransientError,
        _ => ErrorKind::Failure,
    }
}
