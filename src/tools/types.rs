//! Tool execution types and structures
//!
//! Core types shared by the registry, the dispatcher and the providers.

use crate::errors::ErrorKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Access policy for a tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    Allow,
    Deny,
    /// Execution requires out-of-band consent
    Ask,
}

impl Default for Policy {
    fn default() -> Self {
        Policy::Allow
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Policy::Allow => "allow",
            Policy::Deny => "deny",
            Policy::Ask => "ask",
        };
        f.write_str(s)
    }
}

impl FromStr for Policy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(Policy::Allow),
            "deny" => Ok(Policy::Deny),
            "ask" => Ok(Policy::Ask),
            other => Err(format!("Unknown policy: {}", other)),
        }
    }
}

/// Provider category, used for schema filtering, normalization and
/// verification checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    /// Runs OS processes and reports exit codes
    Process,
    FileRead,
    /// Modifies file content
    FileEdit,
    Search,
    Web,
    Desktop,
    Media,
    General,
}

impl ToolCategory {
    /// Whether results carry process exit codes
    pub fn is_process_like(&self) -> bool {
        matches!(self, ToolCategory::Process)
    }

    /// Categories whose side effects make a re-run unsafe, regardless of
    /// what the provider claims
    pub fn forbids_retry(&self) -> bool {
        matches!(
            self,
            ToolCategory::Process | ToolCategory::FileEdit | ToolCategory::Desktop
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCategory::Process => "process",
            ToolCategory::FileRead => "file_read",
            ToolCategory::FileEdit => "file_edit",
            ToolCategory::Search => "search",
            ToolCategory::Web => "web",
            ToolCategory::Desktop => "desktop",
            ToolCategory::Media => "media",
            ToolCategory::General => "general",
        }
    }
}

impl fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tool schema definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Tool name
    pub name: String,

    /// Tool description
    pub description: String,

    /// Parameter schema (JSON Schema)
    pub parameters: serde_json::Value,

    /// Whether tool is read-only (idempotent, eligible for auto-retry)
    pub read_only: bool,

    pub category: ToolCategory,

    /// Provider-level default; `None` falls through to the global default
    pub default_policy: Option<Policy>,
}

impl ToolSchema {
    /// Create new tool schema
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
        read_only: bool,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            read_only,
            category: ToolCategory::General,
            default_policy: None,
        }
    }

    /// Set category
    pub fn with_category(mut self, category: ToolCategory) -> Self {
        self.category = category;
        self
    }

    /// Set provider default policy
    pub fn with_default_policy(mut self, policy: Policy) -> Self {
        self.default_policy = Some(policy);
        self
    }

    /// Whether the retry layer may re-invoke this tool
    pub fn is_retry_candidate(&self) -> bool {
        self.read_only && !self.category.forbids_retry()
    }
}

/// Schema entry exposed to an external tool-calling surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl From<&ToolSchema> for LlmToolSchema {
    fn from(schema: &ToolSchema) -> Self {
        Self {
            name: schema.name.clone(),
            description: schema.description.clone(),
            parameters: schema.parameters.clone(),
        }
    }
}

/// Field names of the normalization contract
pub mod fields {
    pub const VERIFIED: &str = "verified";
    pub const SUCCESS: &str = "success";
    pub const STATUS: &str = "status";
    pub const EXIT_CODE: &str = "exit_code";
    pub const DURATION_MS: &str = "duration_ms";
    pub const ERROR: &str = "error";
    pub const TOOL: &str = "tool";
    pub const ERROR_KIND: &str = "error_kind";
    pub const ENRICHMENT: &str = "enrichment";
    pub const HINTS: &str = "hints";
}

/// Normalized result of a tool execution
///
/// The provider's payload plus the normalization fields. Serializes as a
/// flat JSON object.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolResult(Map<String, Value>);

impl ToolResult {
    /// Wrap an already-normalized map
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Result for a call that was rejected before any provider ran
    pub fn rejected(
        tool: &str,
        status: &str,
        error: impl Into<String>,
        kind: ErrorKind,
        duration_ms: u64,
    ) -> Self {
        let mut map = Map::new();
        map.insert(fields::VERIFIED.into(), Value::Bool(true));
        map.insert(fields::SUCCESS.into(), Value::Bool(false));
        map.insert(fields::STATUS.into(), Value::String(status.to_string()));
        map.insert(fields::EXIT_CODE.into(), Value::Null);
        map.insert(fields::DURATION_MS.into(), Value::from(duration_ms));
        map.insert(fields::ERROR.into(), Value::String(error.into()));
        map.insert(fields::TOOL.into(), Value::String(tool.to_string()));
        map.insert(fields::ERROR_KIND.into(), Value::String(kind.as_str().into()));
        Self(map)
    }

    pub fn tool(&self) -> &str {
        self.0.get(fields::TOOL).and_then(Value::as_str).unwrap_or("")
    }

    pub fn success(&self) -> bool {
        self.0
            .get(fields::SUCCESS)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn verified(&self) -> bool {
        self.0
            .get(fields::VERIFIED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn status(&self) -> &str {
        self.0.get(fields::STATUS).and_then(Value::as_str).unwrap_or("")
    }

    pub fn exit_code(&self) -> Option<i64> {
        self.0.get(fields::EXIT_CODE).and_then(Value::as_i64)
    }

    pub fn duration_ms(&self) -> u64 {
        self.0
            .get(fields::DURATION_MS)
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    pub fn error(&self) -> Option<&str> {
        self.0.get(fields::ERROR).and_then(Value::as_str)
    }

    pub fn error_kind(&self) -> Option<&str> {
        self.0.get(fields::ERROR_KIND).and_then(Value::as_str)
    }

    pub fn enrichment(&self) -> Option<&str> {
        self.0.get(fields::ENRICHMENT).and_then(Value::as_str)
    }

    /// Hints in the order they were attached
    pub fn hints(&self) -> Vec<String> {
        self.0
            .get(fields::HINTS)
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Look up any field, including provider-specific ones
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub(crate) fn insert(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }

    /// Insert only when the key is absent
    pub(crate) fn insert_missing(&mut self, key: &str, value: Value) {
        if !self.0.contains_key(key) {
            self.0.insert(key.to_string(), value);
        }
    }
}

/// Tool execution statistics
#[derive(Debug, Clone, Default)]
pub struct ToolStats {
    /// Total executions
    pub total_executions: u64,

    /// Successful executions
    pub successful_executions: u64,

    /// Failed executions
    pub failed_executions: u64,

    /// Total execution time (ms)
    pub total_duration_ms: u64,

    /// Retry attempts
    pub retry_attempts: u64,
}

impl ToolStats {
    /// Record successful execution
    pub fn record_success(&mut self, duration_ms: u64) {
        self.total_executions += 1;
        self.successful_executions += 1;
        self.total_duration_ms += duration_ms;
    }

    /// Record failed execution
    pub fn record_failure(&mut self, duration_ms: u64) {
        self.total_executions += 1;
        self.failed_executions += 1;
        self.total_duration_ms += duration_ms;
    }

    /// Record retry attempts
    pub fn record_retries(&mut self, attempts: u32) {
        self.retry_attempts += u64::from(attempts);
    }

    /// Calculate average duration
    pub fn average_duration_ms(&self) -> f64 {
        if self.total_executions == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.total_executions as f64
        }
    }

    /// Calculate success rate
    pub fn success_rate(&self) -> f64 {
        if self.total_executions == 0 {
            0.0
        } else {
            self.successful_executions as f64 / self.total_executions as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_parse() {
        assert_eq!("DENY".parse::<Policy>().unwrap(), Policy::Deny);
        assert_eq!(" ask ".parse::<Policy>().unwrap(), Policy::Ask);
        assert!("maybe".parse::<Policy>().is_err());
        assert_eq!(Policy::default(), Policy::Allow);
    }

    #[test]
    fn test_rejected_result_shape() {
        let result = ToolResult::rejected("echo", "denied", "nope", ErrorKind::PolicyDenied, 0);

        assert!(!result.success());
        assert!(result.verified());
        assert_eq!(result.status(), "denied");
        assert_eq!(result.tool(), "echo");
        assert_eq!(result.error(), Some("nope"));
        assert_eq!(result.error_kind(), Some("policy_denied"));
        assert!(result.contains_key("exit_code"));
        assert!(result.exit_code().is_none());
    }

    #[test]
    fn test_insert_missing_keeps_existing() {
        let mut result = ToolResult::default();
        result.insert("status", Value::from("running"));
        result.insert_missing("status", Value::from("completed"));
        assert_eq!(result.status(), "running");
    }

    #[test]
    fn test_tool_result_serializes_flat() {
        let result = ToolResult::rejected("x", "not_found", "Unknown tool: x", ErrorKind::NotFound, 3);
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["duration_ms"], 3);
        assert_eq!(value["tool"], "x");
    }

    #[test]
    fn test_retry_candidate() {
        let schema = ToolSchema::new("s", "search", serde_json::json!({}), true)
            .with_category(ToolCategory::Search);
        assert!(schema.is_retry_candidate());

        let schema = ToolSchema::new("b", "bash", serde_json::json!({}), true)
            .with_category(ToolCategory::Process);
        assert!(!schema.is_retry_candidate());
    }

    #[test]
    fn test_tool_stats_tracking() {
        let mut stats = ToolStats::default();

        stats.record_success(100);
        stats.record_success(200);
        stats.record_failure(150);
        stats.record_retries(2);

        assert_eq!(stats.total_executions, 3);
        assert_eq!(stats.successful_executions, 2);
        assert_eq!(stats.failed_executions, 1);
        assert_eq!(stats.retry_attempts, 2);
        assert_eq!(stats.average_duration_ms(), 150.0);
        assert!((stats.success_rate() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_llm_schema_from_tool_schema() {
        let schema = ToolSchema::new(
            "test_tool",
            "A test tool",
            serde_json::json!({"type": "object"}),
            true,
        );
        let exposed = LlmToolSchema::from(&schema);

        assert_eq!(exposed.name, "test_tool");
        assert_eq!(exposed.description, "A test tool");
        assert_eq!(exposed.parameters["type"], "object");
    }
}
