//! Process providers
//!
//! - bash: run a shell command as a supervised session
//! - process: inspect, kill, list and feed input to sessions

use crate::errors::{EngineError, Result};
use crate::tools::process::{ProcessSupervisor, ShellKind, StartRequest, TerminalSize};
use crate::tools::provider::Provider;
use crate::tools::types::{ToolCategory, ToolSchema};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

fn parse_args<T: for<'de> Deserialize<'de>>(tool: &str, args: Value) -> Result<T> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args)
        .map_err(|e| EngineError::InvalidArguments(format!("{}: {}", tool, e)))
}

#[derive(Debug, Deserialize)]
struct BashArgs {
    command: String,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default, alias = "timeout")]
    timeout_sec: Option<u64>,
    #[serde(default)]
    background: bool,
    #[serde(default)]
    shell: Option<String>,
    #[serde(default)]
    pty: bool,
    #[serde(default)]
    cols: Option<u16>,
    #[serde(default)]
    rows: Option<u16>,
}

/// Runs shell commands through the supervisor
pub struct BashProvider {
    schema: ToolSchema,
    supervisor: Arc<ProcessSupervisor>,
}

impl BashProvider {
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Self {
        let schema = ToolSchema::new(
            "bash",
            "Run a shell command in the workspace. Long commands continue in the \
             background and can be polled with the process tool.",
            json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "Shell command to run"
                    },
                    "cwd": {
                        "type": "string",
                        "description": "Working directory (default: workspace root)"
                    },
                    "env": {
                        "type": "object",
                        "additionalProperties": { "type": "string" },
                        "description": "Extra environment variables"
                    },
                    "timeout_sec": {
                        "type": "integer",
                        "description": "Deadline in seconds; 0 disables it (background only)",
                        "minimum": 0
                    },
                    "background": {
                        "type": "boolean",
                        "description": "Return immediately with a session id",
                        "default": false
                    },
                    "shell": {
                        "type": "string",
                        "enum": ["sh", "bash", "zsh", "cmd", "powershell"]
                    },
                    "pty": {
                        "type": "boolean",
                        "description": "Attach a pseudo-terminal for interactive programs",
                        "default": false
                    },
                    "cols": { "type": "integer", "minimum": 1 },
                    "rows": { "type": "integer", "minimum": 1 }
                },
                "required": ["command"]
            }),
            false,
        )
        .with_category(ToolCategory::Process);

        Self { schema, supervisor }
    }
}

#[async_trait]
impl Provider for BashProvider {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, args: Value) -> Result<Value> {
        let args: BashArgs = parse_args("bash", args)?;

        let mut request = StartRequest {
            command: args.command,
            cwd: args.cwd,
            env: args.env,
            timeout_secs: args.timeout_sec,
            background: args.background,
            shell: None,
        };
        if let Some(shell) = args.shell.as_deref() {
            request.shell = Some(shell.parse::<ShellKind>()?);
        }

        let requested_background = request.background;
        let snapshot = if args.pty {
            let defaults = TerminalSize::default();
            let size = TerminalSize::new(
                args.cols.unwrap_or(defaults.cols),
                args.rows.unwrap_or(defaults.rows),
            );
            self.supervisor.interactive(request, size).await?
        } else {
            self.supervisor.start(request).await?
        };

        let yielded = snapshot.background && !requested_background;
        let session_id = snapshot.session_id;
        let mut value = serde_json::to_value(snapshot)?;
        if yielded {
            if let Value::Object(map) = &mut value {
                map.insert(
                    "note".to_string(),
                    Value::String(format!(
                        "Still running; continued in the background. Poll with process action=status session_id={}",
                        session_id
                    )),
                );
            }
        }
        Ok(value)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ProcessAction {
    Status,
    Kill,
    List,
    Input,
}

#[derive(Debug, Deserialize)]
struct ProcessArgs {
    action: ProcessAction,
    #[serde(default)]
    session_id: Option<u64>,
    #[serde(default)]
    active_only: bool,
    #[serde(default)]
    text: Option<String>,
}

impl ProcessArgs {
    fn session_id(&self) -> Result<u64> {
        self.session_id.ok_or_else(|| {
            EngineError::InvalidArguments("process: session_id is required".to_string())
        })
    }
}

/// Session management for commands started by `bash`
pub struct ProcessProvider {
    schema: ToolSchema,
    supervisor: Arc<ProcessSupervisor>,
}

impl ProcessProvider {
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Self {
        let schema = ToolSchema::new(
            "process",
            "Inspect or control command sessions started by bash",
            json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": ["status", "kill", "list", "input"]
                    },
                    "session_id": { "type": "integer" },
                    "active_only": {
                        "type": "boolean",
                        "description": "list: only running sessions",
                        "default": false
                    },
                    "text": {
                        "type": "string",
                        "description": "input: text to send to a pty session"
                    }
                },
                "required": ["action"]
            }),
            false,
        )
        .with_category(ToolCategory::Process);

        Self { schema, supervisor }
    }
}

#[async_trait]
impl Provider for ProcessProvider {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, args: Value) -> Result<Value> {
        let args: ProcessArgs = parse_args("process", args)?;

        match args.action {
            ProcessAction::Status => {
                let snapshot = self.supervisor.status(args.session_id()?)?;
                Ok(json!({ "status": "ok", "session": snapshot }))
            }
            ProcessAction::Kill => {
                let snapshot = self.supervisor.kill(args.session_id()?).await?;
                Ok(json!({ "status": "ok", "session": snapshot }))
            }
            ProcessAction::List => {
                let sessions = self.supervisor.list(args.active_only);
                Ok(json!({
                    "status": "ok",
                    "count": sessions.len(),
                    "sessions": sessions,
                }))
            }
            ProcessAction::Input => {
                let id = args.session_id()?;
                let text = args.text.as_deref().unwrap_or_default();
                self.supervisor.send_input(id, text).await?;
                Ok(json!({ "status": "ok", "session_id": id, "bytes": text.len() }))
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::ProcessConfig;
    use crate::tools::process::NullSink;
    use tempfile::TempDir;

    fn setup() -> (BashProvider, ProcessProvider, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = ProcessConfig {
            workspace_root: dir.path().to_string_lossy().to_string(),
            yield_window_ms: 300,
            kill_grace_ms: 200,
            ..ProcessConfig::default()
        };
        let supervisor = Arc::new(ProcessSupervisor::new(config, Arc::new(NullSink)).unwrap());
        (
            BashProvider::new(supervisor.clone()),
            ProcessProvider::new(supervisor),
            dir,
        )
    }

    #[tokio::test]
    async fn test_bash_returns_snapshot() {
        let (bash, _, _dir) = setup();
        let value = bash.execute(json!({"command": "echo hi"})).await.unwrap();

        assert_eq!(value["status"], "completed");
        assert_eq!(value["exit_code"], 0);
        assert_eq!(value["output"], "hi\n");
        assert!(value.get("note").is_none());
    }

    #[tokio::test]
    async fn test_bash_rejects_bad_args() {
        let (bash, _, _dir) = setup();
        let err = bash.execute(json!({"cmd": "echo"})).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidArguments(_)));

        let err = bash
            .execute(json!({"command": "true", "shell": "fish"}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn test_yielded_command_gets_note_and_can_be_killed() {
        let (bash, process, _dir) = setup();
        let value = bash.execute(json!({"command": "sleep 10"})).await.unwrap();

        assert_eq!(value["status"], "running");
        assert!(value["note"].as_str().unwrap().contains("process"));

        let id = value["session_id"].as_u64().unwrap();
        let listed = process
            .execute(json!({"action": "list", "active_only": true}))
            .await
            .unwrap();
        assert_eq!(listed["count"], 1);

        let killed = process
            .execute(json!({"action": "kill", "session_id": id}))
            .await
            .unwrap();
        assert_eq!(killed["session"]["status"], "killed");

        let again = process
            .execute(json!({"action": "kill", "session_id": id}))
            .await;
        assert!(matches!(again, Err(EngineError::SessionNotRunning { .. })));
    }

    #[tokio::test]
    async fn test_process_requires_session_id() {
        let (_, process, _dir) = setup();
        let err = process.execute(json!({"action": "status"})).await.unwrap_err();
        assert!(err.to_string().contains("session_id"));

        let err = process.execute(json!({"action": "explode"})).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidArguments(_)));
    }
}
