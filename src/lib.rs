//! toolengine - Tool Execution Engine
//!
//! Accepts a named action with arguments, enforces access policy,
//! supervises its execution (including external processes), normalizes the
//! result into one success/failure contract and applies bounded recovery
//! for transient failures.
//!
//! # Architecture
//!
//! - **Registry & Dispatcher**: `tools::runtime`, `tools::registry`, `tools::policy`
//! - **Process Supervisor**: `tools::process`
//! - **Result Normalizer**: `tools::normalizer`
//! - **Verification & Recovery**: `tools::verification`, `tools::retry`

pub mod errors;
pub mod config;
pub mod logging;
pub mod tools;

// Re-export commonly used types
pub use config::EngineConfig;
pub use errors::{EngineError, ErrorKind, Result};
pub use logging::{init_logging, LoggingConfig};
pub use tools::{ExecuteOptions, Policy, ToolCategory, ToolResult, ToolRuntime};
