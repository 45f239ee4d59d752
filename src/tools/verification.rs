//! Verification and recovery
//!
//! Runs after normalization. Two jobs:
//! - bounded auto-retry of transient failures on idempotent tools
//! - read-only, category-specific enrichment so the caller can correct a
//!   request without an extra round trip
//!
//! Enrichment never mutates external state and never overwrites provider
//! keys; it only adds `enrichment`, `hints` and the retry markers.

use crate::config::VerificationConfig;
use crate::tools::retry::RetryManager;
use crate::tools::security::PathJail;
use crate::tools::types::{fields, ToolCategory, ToolResult, ToolSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;

/// What the layer did to a result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub retried: bool,
    pub retry_succeeded: bool,
    pub retry_attempts: u32,
    pub enrichment: Option<String>,
    pub hints: Vec<String>,
    /// The original failure was replaced by a successful retry
    pub suppressed_error: bool,
}

/// Post-execution checks
#[derive(Debug, Clone)]
pub struct Verifier {
    retry: RetryManager,
    config: VerificationConfig,
    /// Workspace jail for read-only file lookups; `None` disables them
    jail: Option<PathJail>,
}

impl Verifier {
    pub fn new(retry: RetryManager, config: VerificationConfig, jail: Option<PathJail>) -> Self {
        Self {
            retry,
            config,
            jail,
        }
    }

    pub fn retry_manager(&self) -> &RetryManager {
        &self.retry
    }

    /// Verify `result`, re-invoking through `rerun` when it is eligible
    /// for retry, and merge the outcome into the returned result
    pub async fn verify<F, Fut>(
        &self,
        schema: &ToolSchema,
        args: &Value,
        result: ToolResult,
        rerun: F,
    ) -> (ToolResult, VerificationOutcome)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ToolResult>,
    {
        let mut outcome = VerificationOutcome::default();
        let mut result = result;

        if self.retry.is_eligible(schema, &result) {
            let retried = self.retry.retry(result, rerun).await;
            outcome.retried = true;
            outcome.retry_attempts = retried.attempts;
            outcome.retry_succeeded = retried.succeeded;
            outcome.suppressed_error = retried.succeeded;
            result = retried.result;

            tracing::info!(
                tool = %schema.name,
                attempts = retried.attempts,
                succeeded = retried.succeeded,
                "Transient failure retried"
            );
        }

        self.enrich(schema, args, &mut result, &mut outcome).await;
        merge(&mut result, &outcome);
        (result, outcome)
    }

    async fn enrich(
        &self,
        schema: &ToolSchema,
        args: &Value,
        result: &mut ToolResult,
        outcome: &mut VerificationOutcome,
    ) {
        match schema.category {
            ToolCategory::FileEdit if !result.success() => {
                if is_not_found_failure(result) {
                    outcome.enrichment = self.current_state_excerpt(args).await;
                    if outcome.enrichment.is_some() {
                        outcome.hints.push(
                            "Copy the target text exactly from the excerpt above, including whitespace"
                                .to_string(),
                        );
                    }
                }
            }
            ToolCategory::FileEdit => {
                if let Some(mismatch) = self.read_back(args).await {
                    outcome.enrichment = Some(mismatch.enrichment);
                    if !mismatch.ok {
                        outcome.hints.push(
                            "Re-read the file before further edits; the written content differs from the request"
                                .to_string(),
                        );
                        result.insert(fields::VERIFIED, Value::Bool(false));
                    }
                }
            }
            ToolCategory::Search if is_zero_results(result) => {
                let (enrichment, hints) = relaxation_hints(args);
                outcome.enrichment = Some(enrichment);
                outcome.hints.extend(hints);
            }
            ToolCategory::Process if !result.success() => {
                outcome.hints.extend(process_hints(result));
            }
            _ => {}
        }
    }

    async fn read_jailed_file(&self, args: &Value) -> Option<String> {
        let jail = self.jail.as_ref()?;
        let path = args.get("path").and_then(Value::as_str)?;
        let resolved = jail.verify_and_canonicalize(path).ok()?;
        let metadata = tokio::fs::metadata(&resolved).await.ok()?;
        if !metadata.is_file() {
            return None;
        }
        tokio::fs::read_to_string(&resolved).await.ok()
    }

    /// Lines of the target file around the closest match for the text the
    /// caller tried to replace
    async fn current_state_excerpt(&self, args: &Value) -> Option<String> {
        let content = self.read_jailed_file(args).await?;
        let lines: Vec<&str> = content.lines().collect();
        let wanted = args
            .get("old_text")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let window = self.config.excerpt_lines.max(1);
        let center = closest_line(&lines, wanted).unwrap_or(0);
        let start = center.saturating_sub(window / 2);
        let end = (start + window).min(lines.len());

        let mut excerpt = format!(
            "Current content of {} (lines {}-{} of {}):\n",
            args.get("path").and_then(Value::as_str).unwrap_or_default(),
            start + 1,
            end,
            lines.len()
        );
        for (i, line) in lines[start..end].iter().enumerate() {
            excerpt.push_str(&format!("{:>5} | {}\n", start + i + 1, line));
        }
        Some(excerpt)
    }

    async fn read_back(&self, args: &Value) -> Option<ReadBack> {
        if !self.config.readback_enabled {
            return None;
        }
        let written = args
            .get("new_text")
            .or_else(|| args.get("content"))
            .and_then(Value::as_str)?;
        let line_count = written.lines().count();
        if line_count < self.config.readback_min_lines {
            return None;
        }

        let content = self.read_jailed_file(args).await?;
        Some(match content.find(written) {
            Some(offset) => ReadBack {
                ok: true,
                enrichment: format!(
                    "Read-back verified: {} lines present starting at line {}",
                    line_count,
                    content[..offset].lines().count() + 1
                ),
            },
            None => ReadBack {
                ok: false,
                enrichment: "Read-back check failed: written text not found in file".to_string(),
            },
        })
    }
}

struct ReadBack {
    ok: bool,
    enrichment: String,
}

fn is_not_found_failure(result: &ToolResult) -> bool {
    result
        .error()
        .map(|e| {
            let e = e.to_ascii_lowercase();
            e.contains("not found") || e.contains("no match")
        })
        .unwrap_or(false)
}

fn is_zero_results(result: &ToolResult) -> bool {
    if result.status().eq_ignore_ascii_case("no_results") {
        return true;
    }
    if result.get("count").and_then(Value::as_u64) == Some(0) {
        return true;
    }
    matches!(result.get("results"), Some(Value::Array(items)) if items.is_empty())
}

/// Index of the line sharing the most words with the first non-blank line
/// of `wanted`
fn closest_line(lines: &[&str], wanted: &str) -> Option<usize> {
    let probe = wanted.lines().find(|l| !l.trim().is_empty())?.trim();
    if let Some(idx) = lines.iter().position(|l| l.contains(probe)) {
        return Some(idx);
    }

    let words: Vec<&str> = probe.split_whitespace().collect();
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| (i, words.iter().filter(|w| line.contains(**w)).count()))
        .filter(|(_, score)| *score > 0)
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        .map(|(i, _)| i)
}

fn relaxation_hints(args: &Value) -> (String, Vec<String>) {
    let query = args
        .get("query")
        .or_else(|| args.get("pattern"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let mut hints = vec!["Broaden the query or use a shorter, more general term".to_string()];

    let words: Vec<&str> = query.split_whitespace().collect();
    if words.len() > 1 {
        let longest = words.iter().max_by_key(|w| w.len()).copied().unwrap_or(query);
        hints.push(format!("Try a single keyword, e.g. '{}'", longest));
    }
    if let Some(path) = args.get("path").and_then(Value::as_str) {
        if !path.is_empty() && path != "." {
            hints.push(format!("Drop the path constraint '{}' and search the whole workspace", path));
        }
    }
    if let Some(glob) = args.get("glob").and_then(Value::as_str) {
        hints.push(format!("Drop the file filter '{}'", glob));
    }
    if args.get("case_sensitive").and_then(Value::as_bool) == Some(true) {
        hints.push("Search case-insensitively".to_string());
    }

    (format!("No results for '{}'", query), hints)
}

fn process_hints(result: &ToolResult) -> Vec<String> {
    let mut hints = Vec::new();
    match result.exit_code() {
        Some(127) => hints.push(
            "Exit code 127: command not found. Check the spelling or install the program"
                .to_string(),
        ),
        Some(126) => hints.push(
            "Exit code 126: command is not executable. Check its permissions (chmod +x)"
                .to_string(),
        ),
        _ => {}
    }
    if result.status().eq_ignore_ascii_case("timeout") {
        hints.push(
            "The command hit its deadline. Raise timeout_sec, or run with background=true and poll with the process tool"
                .to_string(),
        );
    }
    hints
}

fn merge(result: &mut ToolResult, outcome: &VerificationOutcome) {
    if let Some(enrichment) = &outcome.enrichment {
        result.insert_missing(fields::ENRICHMENT, Value::String(enrichment.clone()));
    }

    if !outcome.hints.is_empty() {
        let mut hints = result.hints();
        hints.extend(outcome.hints.iter().cloned());
        result.insert(
            fields::HINTS,
            Value::Array(hints.into_iter().map(Value::String).collect()),
        );
    }

    if outcome.retried {
        result.insert("retried", Value::Bool(true));
        result.insert("retry_succeeded", Value::Bool(outcome.retry_succeeded));
        result.insert("retry_attempts", Value::from(outcome.retry_attempts));
        result.insert("suppressed_error", Value::Bool(outcome.suppressed_error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::tools::normalizer::normalize;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn verifier(dir: &TempDir) -> Verifier {
        Verifier::new(
            RetryManager::with_config(3, 1),
            VerificationConfig {
                readback_min_lines: 3,
                ..VerificationConfig::default()
            },
            Some(PathJail::new(dir.path()).unwrap()),
        )
    }

    fn schema(name: &str, category: ToolCategory, read_only: bool) -> ToolSchema {
        ToolSchema::new(name, name, json!({}), read_only).with_category(category)
    }

    fn result(raw: Value, schema: &ToolSchema) -> ToolResult {
        normalize(raw, &schema.name, schema.category, Duration::from_millis(1))
    }

    async fn never(_attempt: u32) -> ToolResult {
        panic!("retry must not run");
    }

    #[tokio::test]
    async fn test_transient_failure_retried_until_success() {
        let dir = TempDir::new().unwrap();
        let v = verifier(&dir);
        let s = schema("search", ToolCategory::Search, true);
        let calls = AtomicU32::new(0);

        let initial = result(json!({"error": "Service Unavailable"}), &s);
        let (final_result, outcome) = v
            .verify(&s, &json!({}), initial, |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                let raw = if n == 0 {
                    json!({"error": "connection reset by peer"})
                } else {
                    json!({"results": ["hit"]})
                };
                let s = s.clone();
                async move { result(raw, &s) }
            })
            .await;

        assert!(final_result.success());
        assert!(outcome.retried && outcome.retry_succeeded && outcome.suppressed_error);
        assert_eq!(outcome.retry_attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(final_result.get("retried"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_non_transient_failure_untouched() {
        let dir = TempDir::new().unwrap();
        let v = verifier(&dir);
        let s = schema("read_file", ToolCategory::FileRead, true);

        let initial = result(json!({"error": "permission denied"}), &s);
        let (final_result, outcome) = v.verify(&s, &json!({}), initial.clone(), never).await;

        assert!(!outcome.retried);
        assert_eq!(final_result, initial);
    }

    #[tokio::test]
    async fn test_side_effecting_tool_never_retried() {
        let dir = TempDir::new().unwrap();
        let v = verifier(&dir);
        let s = schema("write_file", ToolCategory::FileEdit, false);

        let initial = result(json!({"error": "database is locked"}), &s);
        let (final_result, outcome) = v.verify(&s, &json!({}), initial, never).await;

        assert!(!outcome.retried);
        assert!(!final_result.success());
    }

    #[tokio::test]
    async fn test_edit_not_found_gets_excerpt() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("main.rs"),
            "fn main() {\n    let total = 1;\n    println!(\"{}\", total);\n}\n",
        )
        .unwrap();
        let v = verifier(&dir);
        let s = schema("edit_file", ToolCategory::FileEdit, false);
        let args = json!({"path": "main.rs", "old_text": "let totl = 1;", "new_text": "x"});

        let initial = result(json!({"error": "Text not found in main.rs", "status": "error"}), &s);
        let (final_result, outcome) = v.verify(&s, &args, initial, never).await;

        let enrichment = final_result.enrichment().unwrap();
        assert!(enrichment.contains("let total = 1;"));
        assert!(enrichment.contains("    2 | "));
        assert_eq!(outcome.hints.len(), 1);
        assert!(!final_result.success());
    }

    #[tokio::test]
    async fn test_large_edit_read_back() {
        let dir = TempDir::new().unwrap();
        let text = "a\nb\nc\nd\n";
        std::fs::write(dir.path().join("f.txt"), format!("head\n{}", text)).unwrap();
        let v = verifier(&dir);
        let s = schema("write_file", ToolCategory::FileEdit, false);

        let initial = result(json!({"status": "success"}), &s);
        let args = json!({"path": "f.txt", "content": text});
        let (final_result, _) = v.verify(&s, &args, initial, never).await;

        assert!(final_result.verified());
        assert!(final_result.enrichment().unwrap().contains("starting at line 2"));
    }

    #[tokio::test]
    async fn test_read_back_mismatch_unverifies() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f.txt"), "something else").unwrap();
        let v = verifier(&dir);
        let s = schema("write_file", ToolCategory::FileEdit, false);

        let initial = result(json!({"status": "success"}), &s);
        let args = json!({"path": "f.txt", "content": "1\n2\n3\n4\n"});
        let (final_result, outcome) = v.verify(&s, &args, initial, never).await;

        assert!(!final_result.verified());
        assert!(final_result.success());
        assert_eq!(outcome.hints.len(), 1);
    }

    #[tokio::test]
    async fn test_zero_results_gets_hints() {
        let dir = TempDir::new().unwrap();
        let v = verifier(&dir);
        let s = schema("search_files", ToolCategory::Search, true);
        let args = json!({"query": "fn parse_header", "path": "src", "glob": "*.rs"});

        let initial = result(json!({"status": "no_results", "results": []}), &s);
        let (final_result, _) = v.verify(&s, &args, initial, never).await;

        let hints = final_result.hints();
        assert!(hints.iter().any(|h| h.contains("'parse_header'")));
        assert!(hints.iter().any(|h| h.contains("'src'")));
        assert!(hints.iter().any(|h| h.contains("'*.rs'")));
        assert_eq!(final_result.enrichment(), Some("No results for 'fn parse_header'"));
    }

    #[tokio::test]
    async fn test_process_hints() {
        let dir = TempDir::new().unwrap();
        let v = verifier(&dir);
        let s = schema("bash", ToolCategory::Process, false);

        let initial = result(json!({"exit_code": 127, "status": "failed"}), &s);
        let (final_result, _) = v.verify(&s, &json!({}), initial, never).await;
        assert!(final_result.hints()[0].contains("127"));

        let initial = result(json!({"exit_code": -1, "status": "timeout"}), &s);
        let (final_result, _) = v.verify(&s, &json!({}), initial, never).await;
        assert!(final_result.hints()[0].contains("timeout_sec"));
        assert_eq!(final_result.error_kind(), Some(ErrorKind::ProcessTimeout.as_str()));
    }

    #[tokio::test]
    async fn test_provider_hints_are_kept_first() {
        let dir = TempDir::new().unwrap();
        let v = verifier(&dir);
        let s = schema("bash", ToolCategory::Process, false);

        let initial = result(json!({"exit_code": 126, "hints": ["own hint"]}), &s);
        let (final_result, _) = v.verify(&s, &json!({}), initial, never).await;
        let hints = final_result.hints();
        assert_eq!(hints[0], "own hint");
        assert!(hints[1].contains("126"));
    }

    #[test]
    fn test_closest_line() {
        let lines = vec!["alpha beta", "gamma delta", "delta epsilon"];
        assert_eq!(closest_line(&lines, "gamma delta"), Some(1));
        assert_eq!(closest_line(&lines, "delta zeta"), Some(1));
        assert_eq!(closest_line(&lines, "zzz"), None);
        assert_eq!(closest_line(&lines, ""), None);
    }
}
