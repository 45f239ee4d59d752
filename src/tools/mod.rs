//! Tool execution system
//!
//! Dispatches named tool calls with:
//! - Provider registry with on-demand loading
//! - Policy gate (allow / deny / ask)
//! - Supervised process sessions
//! - Result normalization onto one success/failure contract
//! - Bounded retry and read-only enrichment
//! - Execution history ring buffer

pub mod types;
pub mod provider;
pub mod registry;
pub mod policy;
pub mod security;
pub mod normalizer;
pub mod retry;
pub mod verification;
pub mod history;
pub mod executor;
pub mod process;
pub mod runtime;
pub mod implementations;

// Re-export commonly used types
pub use types::{LlmToolSchema, Policy, ToolCategory, ToolResult, ToolSchema, ToolStats};
pub use provider::{FnProvider, Provider};
pub use registry::{OnDemandLoader, ProviderRef, ToolRegistry};
pub use policy::PolicyManager;
pub use security::{PathJail, WorkspaceRoot};
pub use retry::RetryManager;
pub use verification::{VerificationOutcome, Verifier};
pub use history::{ExecutionHistory, ExecutionRecord};
pub use runtime::{ExecuteOptions, ToolRuntime};
