//! Tool runtime coordinator
//!
//! `ToolRuntime` is the engine object: constructed once at startup, passed
//! to call sites, and torn down with `shutdown`. It owns the registry, the
//! policy manager, the verifier, the execution history and the process
//! supervisor.
//!
//! # Flow of `execute`
//!
//! 1. Resolve the tool (consulting on-demand loaders once)
//! 2. Policy check unless skipped
//! 3. Invoke the provider (errors and panics captured)
//! 4. Normalize, then verify / retry / enrich
//! 5. Append to history and return

use crate::config::EngineConfig;
use crate::errors::{ErrorKind, Result};
use crate::tools::executor;
use crate::tools::history::{ExecutionHistory, ExecutionRecord};
use crate::tools::implementations::{
    BashProvider, EditFileProvider, ProcessProvider, ReadFileProvider, SearchFilesProvider,
    WriteFileProvider,
};
use crate::tools::policy::PolicyManager;
use crate::tools::process::{EventSink, NullSink, ProcessSupervisor};
use crate::tools::registry::{OnDemandLoader, ProviderRef, ToolRegistry};
use crate::tools::retry::RetryManager;
use crate::tools::security::PathJail;
use crate::tools::types::{LlmToolSchema, Policy, ToolCategory, ToolResult, ToolStats};
use crate::tools::verification::Verifier;
use chrono::Utc;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinHandle;

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Bypass the policy check (consent was obtained out of band)
    pub skip_policy: bool,

    /// Text matched against on-demand loader keywords; defaults to the tool
    /// name plus the string arguments
    pub context: Option<String>,
}

impl ExecuteOptions {
    pub fn skip_policy() -> Self {
        Self {
            skip_policy: true,
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Tool runtime coordinator
pub struct ToolRuntime {
    registry: ToolRegistry,
    policy: PolicyManager,
    verifier: Verifier,
    history: ExecutionHistory,
    supervisor: Arc<ProcessSupervisor>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    config: EngineConfig,
}

impl ToolRuntime {
    /// Create a runtime with default settings rooted at `working_dir`
    pub fn new(working_dir: impl AsRef<std::path::Path>) -> Result<Self> {
        Self::from_config(EngineConfig::with_workspace(working_dir), Arc::new(NullSink))
    }

    /// Create a runtime from configuration, registering the built-in tools
    ///
    /// The session sweeper starts when called inside a tokio runtime.
    pub fn from_config(config: EngineConfig, sink: Arc<dyn EventSink>) -> Result<Self> {
        config.validate()?;

        let supervisor = Arc::new(ProcessSupervisor::new(config.process.clone(), sink)?);
        let jail = PathJail::new(supervisor.workspace().path())?;

        let runtime = Self {
            registry: ToolRegistry::new(),
            policy: PolicyManager::from_config(&config.policy),
            verifier: Verifier::new(
                RetryManager::from_config(&config.retry),
                config.verification.clone(),
                Some(jail.clone()),
            ),
            history: ExecutionHistory::new(config.history.capacity),
            supervisor: supervisor.clone(),
            sweeper: Mutex::new(None),
            config,
        };

        let builtins: Vec<ProviderRef> = vec![
            Arc::new(BashProvider::new(supervisor.clone())),
            Arc::new(ProcessProvider::new(supervisor.clone())),
            Arc::new(ReadFileProvider::new(jail.clone())),
            Arc::new(WriteFileProvider::new(jail.clone())),
            Arc::new(EditFileProvider::new(jail.clone())),
            Arc::new(SearchFilesProvider::new(jail)),
        ];
        for provider in builtins {
            runtime.registry.register(provider)?;
        }

        if tokio::runtime::Handle::try_current().is_ok() {
            *runtime.sweeper_slot() = Some(supervisor.spawn_sweeper());
        }

        tracing::info!(
            workspace = %supervisor.workspace().path().display(),
            tools = runtime.registry.len(),
            "Tool runtime ready"
        );
        Ok(runtime)
    }

    fn sweeper_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.sweeper.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Execute a tool with default options
    pub async fn execute(&self, tool: &str, args: Value) -> ToolResult {
        self.execute_with(tool, args, ExecuteOptions::default()).await
    }

    /// Execute a tool. Never fails: every outcome, including unknown tools,
    /// policy rejections and provider panics, is a normalized result.
    pub async fn execute_with(&self, tool: &str, args: Value, options: ExecuteOptions) -> ToolResult {
        let started_at = Utc::now();
        let clock = Instant::now();

        let context = options
            .context
            .clone()
            .unwrap_or_else(|| default_context(tool, &args));

        let Some(provider) = self.registry.resolve(tool, &context) else {
            tracing::warn!(tool = %tool, "Unknown tool");
            let result = ToolResult::rejected(
                tool,
                "not_found",
                format!("Unknown tool: {}", tool),
                ErrorKind::NotFound,
                clock.elapsed().as_millis() as u64,
            );
            return self.finish(tool, args, result, started_at, 0);
        };

        if !options.skip_policy {
            let policy = self
                .policy
                .resolve(tool, provider.schema().default_policy);
            let rejection = match policy {
                Policy::Allow => None,
                Policy::Deny => Some((
                    "denied",
                    format!("Tool '{}' is denied by policy", tool),
                    ErrorKind::PolicyDenied,
                )),
                Policy::Ask => Some((
                    "confirmation_required",
                    format!(
                        "Tool '{}' requires confirmation; resubmit with skip_policy after obtaining consent",
                        tool
                    ),
                    ErrorKind::ConfirmationRequired,
                )),
            };
            if let Some((status, message, kind)) = rejection {
                tracing::info!(tool = %tool, policy = %policy, "Execution rejected by policy");
                let result = ToolResult::rejected(
                    tool,
                    status,
                    message,
                    kind,
                    clock.elapsed().as_millis() as u64,
                );
                return self.finish(tool, args, result, started_at, 0);
            }
        }

        tracing::debug!(tool = %tool, "Executing tool");
        let result = executor::run(&provider, args.clone()).await;

        let schema = provider.schema().clone();
        let (result, outcome) = self
            .verifier
            .verify(&schema, &args, result, |_attempt| {
                let provider = provider.clone();
                let args = args.clone();
                async move { executor::run(&provider, args).await }
            })
            .await;

        tracing::info!(
            tool = %tool,
            success = result.success(),
            status = %result.status(),
            duration_ms = result.duration_ms(),
            retried = outcome.retried,
            "Tool executed"
        );
        self.finish(tool, args, result, started_at, outcome.retry_attempts)
    }

    fn finish(
        &self,
        tool: &str,
        args: Value,
        result: ToolResult,
        started_at: chrono::DateTime<Utc>,
        retry_attempts: u32,
    ) -> ToolResult {
        let record = ExecutionRecord::new(tool, args, result.clone(), started_at, Utc::now());
        self.history.record(record, retry_attempts);
        result
    }

    /// Catalog for an external tool-calling surface
    ///
    /// Tools whose effective policy is `Deny` are left out; `categories`
    /// restricts the catalog when given.
    pub fn get_schemas_for_llm(&self, categories: Option<&[ToolCategory]>) -> Vec<LlmToolSchema> {
        self.registry
            .schemas()
            .iter()
            .filter(|schema| categories.map_or(true, |c| c.contains(&schema.category)))
            .filter(|schema| self.policy.resolve(&schema.name, schema.default_policy) != Policy::Deny)
            .map(LlmToolSchema::from)
            .collect()
    }

    /// Set a per-tool policy, or the global default when `tool` is `None`
    pub fn set_policy(&self, tool: Option<&str>, policy: Policy) {
        tracing::info!(tool = ?tool, policy = %policy, "Policy updated");
        self.policy.set_policy(tool, policy);
    }

    pub fn deny_tool(&self, tool: &str) {
        tracing::info!(tool = %tool, "Tool denied");
        self.policy.deny(tool);
    }

    pub fn allow_tool(&self, tool: &str) {
        tracing::info!(tool = %tool, "Tool allowed");
        self.policy.allow(tool);
    }

    /// Restrict execution to `tools`; an empty list lifts the restriction
    pub fn set_allow_list<I, S>(&self, tools: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.policy.set_allow_list(tools);
    }

    /// Effective policy, or `None` for unregistered tools
    pub fn effective_policy(&self, tool: &str) -> Option<Policy> {
        let provider = self.registry.get(tool)?;
        Some(self.policy.resolve(tool, provider.schema().default_policy))
    }

    pub fn register(&self, provider: ProviderRef) -> Result<()> {
        self.registry.register(provider)
    }

    pub fn unregister(&self, tool: &str) -> bool {
        self.registry.unregister(tool).is_some()
    }

    pub fn register_on_demand(&self, loader: OnDemandLoader) {
        self.registry.register_on_demand(loader);
    }

    /// Load every on-demand group whose keywords occur in `text`
    pub fn preload_for_context(&self, text: &str) -> Vec<String> {
        self.registry.load_matching(text)
    }

    /// Get tool registry
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Get all tool names
    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    /// Check if tool exists
    pub fn has_tool(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    /// Get read-only tools (idempotent, retry candidates)
    pub fn read_only_tools(&self) -> Vec<String> {
        self.registry.read_only_tools()
    }

    /// Get write tools
    pub fn write_tools(&self) -> Vec<String> {
        self.registry.write_tools()
    }

    /// Most recent `limit` executions, oldest first
    pub fn history(&self, limit: usize) -> Vec<ExecutionRecord> {
        self.history.recent(limit)
    }

    pub fn history_for(&self, tool: &str) -> Vec<ExecutionRecord> {
        self.history.for_tool(tool)
    }

    pub fn clear_history(&self) {
        self.history.clear();
    }

    /// Lifetime statistics across all tools
    pub fn stats(&self) -> ToolStats {
        self.history.stats()
    }

    pub fn stats_for(&self, tool: &str) -> Option<ToolStats> {
        self.history.stats_for(tool)
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Stop the sweeper and kill every running session
    pub async fn shutdown(&self) {
        if let Some(handle) = self.sweeper_slot().take() {
            handle.abort();
        }
        self.supervisor.shutdown().await;
        tracing::info!("Tool runtime shut down");
    }
}

impl Drop for ToolRuntime {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper_slot().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for ToolRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRuntime")
            .field("registry", &self.registry)
            .field("supervisor", &self.supervisor)
            .finish()
    }
}

/// Tool name plus every string argument value
fn default_context(tool: &str, args: &Value) -> String {
    let mut context = tool.to_string();
    if let Value::Object(map) = args {
        for value in map.values() {
            if let Value::String(s) = value {
                context.push(' ');
                context.push_str(s);
            }
        }
    }
    context
}
