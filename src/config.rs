//! Configuration management for the tool engine
//!
//! Provides TOML-based configuration with defaults and validation.
//! Location: ~/.toolengine/config.toml

use crate::errors::{EngineError, Result};
use crate::logging::LoggingConfig;
use crate::tools::types::Policy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub process: ProcessConfig,
    pub retry: RetryConfig,
    pub history: HistoryConfig,
    pub policy: PolicyConfig,
    pub verification: VerificationConfig,
    pub logging: LoggingConfig,
}

/// Process supervisor limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Sandboxed default working directory
    pub workspace_root: String,
    pub stdout_cap_chars: usize,
    pub stderr_cap_chars: usize,
    pub tail_chars: usize,
    /// 0 disables the deadline (background sessions only)
    pub default_timeout_secs: u64,
    /// How long a foreground start blocks before switching to background
    pub yield_window_ms: u64,
    /// Grace between terminate and forced kill
    pub kill_grace_ms: u64,
    /// How long finished sessions stay addressable
    pub session_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub default_shell: String,
}

/// Auto-retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

/// Execution history settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub capacity: usize,
}

/// Access policy settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub default_policy: Policy,
    pub deny_list: Vec<String>,
    /// When non-empty, only these tools may run
    pub allow_list: Vec<String>,
    pub overrides: HashMap<String, Policy>,
}

/// Post-execution verification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Read back large successful edits
    pub readback_enabled: bool,
    pub readback_min_lines: usize,
    /// Context lines shown around a located region
    pub excerpt_lines: usize,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            workspace_root: "~/.toolengine/workspace".to_string(),
            stdout_cap_chars: 100_000,
            stderr_cap_chars: 20_000,
            tail_chars: 2_000,
            default_timeout_secs: 300,
            yield_window_ms: 10_000,
            kill_grace_ms: 2_000,
            session_ttl_secs: 1_800,
            sweep_interval_secs: 60,
            default_shell: if cfg!(windows) { "cmd" } else { "bash" }.to_string(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 5_000,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { capacity: 100 }
    }
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            readback_enabled: true,
            readback_min_lines: 20,
            excerpt_lines: 6,
        }
    }
}

impl ProcessConfig {
    /// Workspace root with `~` expanded
    pub fn workspace_path(&self) -> PathBuf {
        EngineConfig::expand_path(&self.workspace_root)
    }
}

impl EngineConfig {
    /// Config rooted at a specific workspace directory
    pub fn with_workspace(workspace_root: impl AsRef<Path>) -> Self {
        let mut config = Self::default();
        config.process.workspace_root = workspace_root.as_ref().to_string_lossy().to_string();
        config
    }

    /// Load configuration from file or use defaults
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        if let Some(config_path) = path {
            Self::load_from_file(&config_path)
        } else {
            Self::load_default()
        }
    }

    /// Load configuration from specific file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| EngineError::ConfigError(format!("Failed to read config: {}", e)))?;

        let config: EngineConfig = toml::from_str(&contents)
            .map_err(|e| EngineError::ConfigError(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load default configuration from standard location or use built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Some(path) = Self::default_path() {
            if path.exists() {
                return Self::load_from_file(&path);
            }
        }

        Ok(EngineConfig::default())
    }

    /// ~/.toolengine/config.toml
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".toolengine").join("config.toml"))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let process = &self.process;

        if process.stdout_cap_chars == 0 || process.stderr_cap_chars == 0 {
            return Err(EngineError::ConfigError(
                "output caps must be greater than 0".to_string(),
            ));
        }

        if process.tail_chars == 0 || process.tail_chars > process.stdout_cap_chars {
            return Err(EngineError::ConfigError(
                "tail_chars must be between 1 and stdout_cap_chars".to_string(),
            ));
        }

        // a zero default would reject every foreground command without an
        // explicit timeout
        if process.default_timeout_secs == 0 {
            return Err(EngineError::ConfigError(
                "default_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if process.yield_window_ms > process.default_timeout_secs.saturating_mul(1000) {
            return Err(EngineError::ConfigError(
                "yield_window_ms must not exceed the default timeout".to_string(),
            ));
        }

        if process.sweep_interval_secs == 0 {
            return Err(EngineError::ConfigError(
                "sweep_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.history.capacity == 0 {
            return Err(EngineError::ConfigError(
                "history capacity must be greater than 0".to_string(),
            ));
        }

        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(EngineError::ConfigError(
                "retry max_delay_ms must be at least base_delay_ms".to_string(),
            ));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| EngineError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::ConfigError(format!("Failed to create config dir: {}", e))
            })?;
        }

        std::fs::write(path, contents)
            .map_err(|e| EngineError::ConfigError(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Expand tilde in paths
    pub fn expand_path(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }
        PathBuf::from(path)
    }
}
