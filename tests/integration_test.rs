//! Integration tests for toolengine
//!
//! Exercises the public engine API end to end: dispatch, policy,
//! supervised processes, normalization and recovery.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use toolengine::tools::process::ChannelSink;
use toolengine::tools::{FnProvider, OnDemandLoader, ProviderRef, ToolSchema};
use toolengine::{EngineConfig, EngineError, ExecuteOptions, Policy, ToolCategory, ToolRuntime};

const CONTRACT_FIELDS: &[&str] = &[
    "verified",
    "success",
    "status",
    "exit_code",
    "duration_ms",
    "error",
    "tool",
];

fn setup() -> (ToolRuntime, TempDir) {
    let dir = TempDir::new().unwrap();
    let mut config = EngineConfig::with_workspace(dir.path());
    config.retry.base_delay_ms = 5;
    config.process.kill_grace_ms = 300;
    let runtime = ToolRuntime::from_config(config, Arc::new(toolengine::tools::process::NullSink)).unwrap();
    (runtime, dir)
}

fn counting_stub(name: &str, calls: Arc<AtomicUsize>) -> Arc<FnProvider> {
    Arc::new(FnProvider::new(
        ToolSchema::new(name, "stub", json!({"type": "object"}), true),
        move |_| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"output": "echoed"}))
            }
        },
    ))
}

fn assert_contract(value: &Value) {
    for field in CONTRACT_FIELDS {
        assert!(value.get(*field).is_some(), "missing field {}", field);
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_bash_exit_zero() {
    let (runtime, _dir) = setup();
    let result = runtime.execute("bash", json!({"command": "exit 0"})).await;

    assert!(result.success());
    assert!(result.verified());
    assert_eq!(result.status(), "completed");
    assert_eq!(result.exit_code(), Some(0));
    assert_contract(&result.into_value());
}

#[cfg(unix)]
#[tokio::test]
async fn test_bash_exit_seven() {
    let (runtime, _dir) = setup();
    let result = runtime.execute("bash", json!({"command": "exit 7"})).await;

    assert!(!result.success());
    assert_eq!(result.exit_code(), Some(7));
    assert_eq!(result.status(), "failed");
    assert!(result.error().is_some());
}

#[cfg(unix)]
#[tokio::test]
async fn test_bash_timeout() {
    let (runtime, _dir) = setup();
    let result = runtime
        .execute("bash", json!({"command": "sleep 20", "timeout_sec": 1}))
        .await;

    assert!(!result.success());
    assert_eq!(result.status(), "timeout");
    assert_eq!(result.exit_code(), Some(-1));
    assert_eq!(result.error_kind(), Some("process_timeout"));
    assert!(result.hints().iter().any(|h| h.contains("timeout_sec")));
    assert!(result.get("retried").is_none());
}

#[cfg(unix)]
#[tokio::test]
async fn test_command_not_found_hint() {
    let (runtime, _dir) = setup();
    let result = runtime
        .execute("bash", json!({"command": "definitely-not-a-command-xyz"}))
        .await;

    assert_eq!(result.exit_code(), Some(127));
    assert!(result.hints()[0].contains("127"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_background_session_lifecycle() {
    let dir = TempDir::new().unwrap();
    let (sink, mut events) = ChannelSink::new();
    let runtime = ToolRuntime::from_config(EngineConfig::with_workspace(dir.path()), Arc::new(sink)).unwrap();

    let started = runtime
        .execute("bash", json!({"command": "echo working; sleep 0.3", "background": true}))
        .await;
    assert_eq!(started.status(), "running");
    let id = started.get("session_id").and_then(Value::as_u64).unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.session_id, id);
    assert_eq!(event.exit_code, Some(0));
    assert!(event.tail.contains("working"));

    let status = runtime
        .execute("process", json!({"action": "status", "session_id": id}))
        .await;
    assert!(status.success());
    assert_eq!(status.get("session").unwrap()["status"], "completed");

    let kill = runtime
        .execute("process", json!({"action": "kill", "session_id": id}))
        .await;
    assert!(!kill.success());
    assert!(kill.error().unwrap().contains("not running"));

    let again = runtime.supervisor().status(id).unwrap();
    assert_eq!(again.exit_code, Some(0));
}

#[tokio::test]
async fn test_deny_never_invokes_provider() {
    let (runtime, _dir) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    runtime.register(counting_stub("echo", calls.clone())).unwrap();
    runtime.set_policy(Some("echo"), Policy::Deny);

    let result = runtime.execute("echo", json!({})).await;

    assert_eq!(result.status(), "denied");
    assert!(!result.success());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_contract(&result.into_value());
}

#[tokio::test]
async fn test_deny_list_and_skip_policy() {
    let (runtime, _dir) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    runtime.register(counting_stub("echo", calls.clone())).unwrap();
    runtime.deny_tool("echo");

    let result = runtime
        .execute_with("echo", json!({}), ExecuteOptions::skip_policy())
        .await;
    assert!(result.success());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    runtime.allow_tool("echo");
    assert!(runtime.execute("echo", json!({})).await.success());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_provider_default_ask() {
    let (runtime, _dir) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    runtime
        .register(Arc::new(FnProvider::new(
            ToolSchema::new("click", "desktop click", json!({}), false)
                .with_category(ToolCategory::Desktop)
                .with_default_policy(Policy::Ask),
            move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"status": "done"}))
                }
            },
        )))
        .unwrap();

    let result = runtime.execute("click", json!({})).await;
    assert_eq!(result.status(), "confirmation_required");
    assert_eq!(result.error_kind(), Some("confirmation_required"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_panicking_provider_is_contained() {
    let (runtime, _dir) = setup();
    runtime
        .register(Arc::new(FnProvider::new(
            ToolSchema::new("explode", "panics", json!({}), false),
            |_| async move {
                let empty: Vec<u8> = Vec::new();
                Ok(json!({ "byte": empty[3] }))
            },
        )))
        .unwrap();

    let result = runtime.execute("explode", json!({})).await;
    assert!(!result.success());
    assert_eq!(result.error_kind(), Some("provider_error"));
    assert_contract(&result.clone().into_value());

    // engine still usable afterwards
    let after = runtime.execute("read_file", json!({"path": "missing"})).await;
    assert_eq!(after.tool(), "read_file");
    assert_eq!(runtime.stats().total_executions, 2);
}

#[tokio::test]
async fn test_transient_retry_on_idempotent_provider() {
    let (runtime, _dir) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    runtime
        .register(Arc::new(FnProvider::new(
            ToolSchema::new("lookup", "flaky lookup", json!({}), true)
                .with_category(ToolCategory::Web),
            move |_| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(EngineError::Transient("503 Service Unavailable".into()))
                    } else {
                        Ok(json!({"data": [1, 2, 3]}))
                    }
                }
            },
        )))
        .unwrap();

    let result = runtime.execute("lookup", json!({})).await;
    assert!(result.success());
    assert_eq!(result.get("retried"), Some(&json!(true)));
    assert_eq!(result.get("retry_attempts"), Some(&json!(2)));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(runtime.stats().retry_attempts, 2);
}

#[tokio::test]
async fn test_non_transient_error_returned_on_first_attempt() {
    let (runtime, _dir) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    runtime
        .register(Arc::new(FnProvider::new(
            ToolSchema::new("lookup", "broken lookup", json!({}), true)
                .with_category(ToolCategory::Web),
            move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"error": "invalid API key"}))
                }
            },
        )))
        .unwrap();

    let result = runtime.execute("lookup", json!({})).await;
    assert!(!result.success());
    assert_eq!(result.error(), Some("invalid API key"));
    assert!(result.get("retried").is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_on_demand_loader_by_keyword() {
    let (runtime, _dir) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let loader_calls = calls.clone();
    runtime.register_on_demand(OnDemandLoader::new("web_tools", ["web page", "website"], move || {
        vec![counting_stub("browser_open", loader_calls.clone()) as ProviderRef]
    }));

    let missing = runtime.execute("browser_open", json!({"url": "x"})).await;
    assert_eq!(missing.status(), "not_found");

    let result = runtime
        .execute_with(
            "browser_open",
            json!({"url": "x"}),
            ExecuteOptions::default().with_context("open that web page"),
        )
        .await;
    assert!(result.success());
    assert!(runtime.has_tool("browser_open"));
}

#[tokio::test]
async fn test_preload_for_context() {
    let (runtime, _dir) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let loader_calls = calls.clone();
    runtime.register_on_demand(OnDemandLoader::new("gif", ["gif", "animation"], move || {
        vec![counting_stub("make_gif", loader_calls.clone()) as ProviderRef]
    }));

    assert!(runtime.preload_for_context("nothing here").is_empty());
    assert_eq!(runtime.preload_for_context("Make an ANIMATION"), vec!["make_gif"]);
}

#[tokio::test]
async fn test_edit_not_found_enrichment_through_engine() {
    let (runtime, dir) = setup();
    std::fs::write(dir.path().join("app.py"), "def main():\n    return 42\n").unwrap();

    let result = runtime
        .execute(
            "edit_file",
            json!({"path": "app.py", "old_text": "return 41", "new_text": "return 0"}),
        )
        .await;

    assert!(!result.success());
    assert!(result.enrichment().unwrap().contains("return 42"));
    assert_eq!(
        std::fs::read_to_string(dir.path().join("app.py")).unwrap(),
        "def main():\n    return 42\n"
    );
}

#[tokio::test]
async fn test_search_no_results_hints() {
    let (runtime, dir) = setup();
    std::fs::write(dir.path().join("a.txt"), "alpha\n").unwrap();

    let result = runtime
        .execute("search_files", json!({"query": "omega sigma"}))
        .await;
    assert!(!result.success());
    assert_eq!(result.status(), "no_results");
    assert!(result.hints().len() >= 2);
}

#[tokio::test]
async fn test_every_result_has_contract_fields() {
    let (runtime, _dir) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    runtime.register(counting_stub("echo", calls)).unwrap();
    runtime.register(Arc::new(FnProvider::new(
        ToolSchema::new("shapeless", "returns a bare number", json!({}), false),
        |_| async { Ok(json!(5)) },
    )))
    .unwrap();

    let calls: Vec<(&str, Value)> = vec![
        ("echo", json!({})),
        ("shapeless", json!(null)),
        ("unknown", json!({})),
        ("read_file", json!({})),
        ("search_files", json!({"query": ""})),
        ("process", json!({"action": "list"})),
    ];
    for (tool, args) in calls {
        let result = runtime.execute(tool, args).await;
        assert_eq!(result.tool(), tool);
        assert_contract(&result.into_value());
    }
    assert_eq!(runtime.history(100).len(), 6);
}

#[tokio::test]
async fn test_concurrent_execute() {
    let (runtime, dir) = setup();
    let runtime = Arc::new(runtime);
    for i in 0..8 {
        std::fs::write(dir.path().join(format!("f{}.txt", i)), format!("content{}", i)).unwrap();
    }

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let rt = runtime.clone();
            tokio::spawn(async move {
                rt.execute("read_file", json!({"path": format!("f{}.txt", i)}))
                    .await
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let result = handle.await.unwrap();
        assert!(result.success());
        assert_eq!(result.get("content").unwrap(), &json!(format!("content{}", i)));
    }
    assert_eq!(runtime.stats().total_executions, 8);
}

#[test]
fn test_config_roundtrip_drives_runtime() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    let mut config = EngineConfig::with_workspace(dir.path().join("ws"));
    config.policy.deny_list = vec!["bash".into()];
    config.save(&path).unwrap();

    let loaded = EngineConfig::load(Some(path)).unwrap();
    let runtime = ToolRuntime::from_config(loaded, Arc::new(toolengine::tools::process::NullSink)).unwrap();
    assert_eq!(runtime.effective_policy("bash"), Some(Policy::Deny));
    assert!(dir.path().join("ws").is_dir());
}

#[tokio::test]
async fn test_provider_reported_failure_kept() {
    let (runtime, _dir) = setup();
    runtime
        .register(Arc::new(FnProvider::new(
            ToolSchema::new("fetch", "fetch a page", json!({}), true)
                .with_category(ToolCategory::Web),
            |_| async { Ok(json!({"success": false, "output": "partial body"})) },
        )))
        .unwrap();

    let result = runtime.execute("fetch", json!({})).await;
    assert!(!result.success());
    assert_eq!(result.get("success"), Some(&json!(false)));
    assert_eq!(result.get("output"), Some(&json!("partial body")));
    assert!(result.error().is_some());
    assert_eq!(runtime.stats_for("fetch").unwrap().failed_executions, 1);
}

#[tokio::test]
async fn test_unknown_tool_names_not_tracked_per_tool() {
    let (runtime, _dir) = setup();
    for i in 0..3 {
        runtime.execute(&format!("invented_{}", i), json!({})).await;
    }

    assert_eq!(runtime.stats().total_executions, 3);
    assert!(runtime.stats_for("invented_0").is_none());
}

#[cfg(unix)]
#[tokio::test]
async fn test_kill_reaches_background_descendant() {
    let (runtime, _dir) = setup();
    let started = runtime
        .execute("bash", json!({"command": "sleep 30 & echo x", "background": true}))
        .await;
    let id = started.get("session_id").and_then(Value::as_u64).unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let killed = runtime
        .execute("process", json!({"action": "kill", "session_id": id}))
        .await;

    assert!(killed.success());
    assert_eq!(killed.get("session").unwrap()["status"], "killed");
    assert!(runtime.supervisor().list(true).is_empty());
}

#[test]
fn test_zero_default_timeout_rejected() {
    let dir = TempDir::new().unwrap();
    let mut config = EngineConfig::with_workspace(dir.path());
    config.process.default_timeout_secs = 0;

    let err = ToolRuntime::from_config(config, Arc::new(toolengine::tools::process::NullSink))
        .unwrap_err();
    assert!(matches!(err, EngineError::ConfigError(_)));
}

#[cfg(unix)]
#[tokio::test]
async fn test_oversized_default_timeout() {
    let dir = TempDir::new().unwrap();
    let mut config = EngineConfig::with_workspace(dir.path());
    config.process.default_timeout_secs = u64::MAX;
    let runtime = ToolRuntime::from_config(config, Arc::new(toolengine::tools::process::NullSink)).unwrap();

    let result = runtime.execute("bash", json!({"command": "echo fine"})).await;
    assert!(result.success());
    assert_eq!(result.get("output"), Some(&json!("fine\n")));
}
