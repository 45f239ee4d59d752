//! Error types for the tool execution engine
//!
//! `EngineError` is what internal layers propagate with `?`. At the
//! dispatch boundary every error is folded into a failed result map, so
//! callers of `ToolRuntime::execute` never see it directly.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Unknown tool (never retried)
    #[error("Unknown tool: {tool}")]
    NotFound { tool: String },

    /// Policy forbids the tool; nothing was executed
    #[error("Tool '{tool}' is denied by policy")]
    PolicyDenied { tool: String },

    /// Policy requires consent before the tool may run
    #[error("Tool '{tool}' requires confirmation before execution")]
    ConfirmationRequired { tool: String },

    /// Failure raised inside a provider
    #[error("Provider error: {0}")]
    Provider(String),

    /// Supervised process exceeded its deadline
    #[error("Command timed out after {timeout_secs}s")]
    ProcessTimeout { timeout_secs: u64 },

    /// Temporary external condition
    #[error("Transient error: {0}")]
    Transient(String),

    /// Session id was never allocated or has been swept
    #[error("Session {0} not found")]
    SessionNotFound(u64),

    /// Session already reached a terminal state
    #[error("Session {id} is not running (status: {status})")]
    SessionNotRunning { id: u64, status: String },

    /// Caller supplied unusable arguments
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// Process could not be started
    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Generic errors with context
    #[error("Engine error: {0}")]
    Generic(String),
}

impl EngineError {
    /// Taxonomy bucket reported in result maps
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound { .. } => ErrorKind::NotFound,
            EngineError::PolicyDenied { .. } => ErrorKind::PolicyDenied,
            EngineError::ConfirmationRequired { .. } => ErrorKind::ConfirmationRequired,
            EngineError::ProcessTimeout { .. } => ErrorKind::ProcessTimeout,
            EngineError::Transient(_) => ErrorKind::TransientError,
            EngineError::InvalidArguments(_) => ErrorKind::InvalidArguments,
            _ => ErrorKind::ProviderError,
        }
    }
}

/// Wire form of the error taxonomy (`error_kind` field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    PolicyDenied,
    ConfirmationRequired,
    ProviderError,
    ProcessTimeout,
    TransientError,
    InvalidArguments,
    /// Any other surfaced failure
    Failure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::PolicyDenied => "policy_denied",
            ErrorKind::ConfirmationRequired => "confirmation_required",
            ErrorKind::ProviderError => "provider_error",
            ErrorKind::ProcessTimeout => "process_timeout",
            ErrorKind::TransientError => "transient_error",
            ErrorKind::InvalidArguments => "invalid_arguments",
            ErrorKind::Failure => "failure",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Convert anyhow errors to EngineError
impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Generic(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::SessionNotRunning {
            id: 7,
            status: "completed".to_string(),
        };
        assert!(err.to_string().contains('7'));
        assert!(err.to_string().contains("completed"));
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(
            EngineError::NotFound { tool: "x".into() }.kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            EngineError::ProcessTimeout { timeout_secs: 1 }.kind(),
            ErrorKind::ProcessTimeout
        );
        assert_eq!(
            EngineError::Generic("boom".into()).kind(),
            ErrorKind::ProviderError
        );
    }

    #[test]
    fn test_error_kind_wire_form() {
        let json = serde_json::to_string(&ErrorKind::ConfirmationRequired).unwrap();
        assert_eq!(json, "\"confirmation_required\"");
        assert_eq!(ErrorKind::TransientError.to_string(), "transient_error");
    }

    #[test]
    fn test_anyhow_conversion() {
        let err: EngineError = anyhow::anyhow!("pty unavailable").into();
        assert!(err.to_string().contains("pty unavailable"));
    }
}
