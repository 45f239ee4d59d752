//! Sandbox helpers
//!
//! - `PathJail`: keeps file providers inside the workspace root
//! - `WorkspaceRoot`: resolves process working directories
//! - `sanitize_env`: strips loader/interpreter hijacking variables

use crate::errors::{EngineError, Result};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

/// Environment keys a caller may never set on a spawned process
pub const ENV_DENY_LIST: &[&str] = &[
    "PATH",
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "LD_AUDIT",
    "DYLD_INSERT_LIBRARIES",
    "DYLD_LIBRARY_PATH",
    "DYLD_FALLBACK_LIBRARY_PATH",
    "DYLD_FRAMEWORK_PATH",
    "PYTHONPATH",
    "PYTHONHOME",
    "PYTHONSTARTUP",
    "NODE_OPTIONS",
    "NODE_PATH",
    "PERL5LIB",
    "PERL5OPT",
    "RUBYLIB",
    "RUBYOPT",
    "JAVA_TOOL_OPTIONS",
    "CLASSPATH",
    "BASH_ENV",
    "ENV",
    "IFS",
];

/// Prefixes owned by the dynamic linker
const ENV_DENY_PREFIXES: &[&str] = &["LD_", "DYLD_"];

/// Whether a key is on the environment deny-list (case-insensitive)
pub fn is_denied_env_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    ENV_DENY_LIST.contains(&upper.as_str())
        || ENV_DENY_PREFIXES.iter().any(|p| upper.starts_with(p))
}

/// Drop deny-listed keys from a caller-supplied environment
///
/// Returns the filtered map and the dropped keys. Dropping is never fatal.
pub fn sanitize_env(env: HashMap<String, String>) -> (HashMap<String, String>, Vec<String>) {
    let mut dropped = Vec::new();
    let kept = env
        .into_iter()
        .filter(|(key, _)| {
            if is_denied_env_key(key) {
                dropped.push(key.clone());
                false
            } else {
                true
            }
        })
        .collect();

    if !dropped.is_empty() {
        dropped.sort();
        tracing::warn!(keys = ?dropped, "Dropped deny-listed environment variables");
    }

    (kept, dropped)
}

/// Sandboxed default working directory for processes
#[derive(Debug, Clone)]
pub struct WorkspaceRoot {
    root: PathBuf,
}

impl WorkspaceRoot {
    /// Create the root directory if needed and canonicalize it
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        if !root.exists() {
            std::fs::create_dir_all(root).map_err(|e| {
                EngineError::ConfigError(format!(
                    "Failed to create workspace root {}: {}",
                    root.display(),
                    e
                ))
            })?;
        }
        let root = root.canonicalize().map_err(|e| {
            EngineError::ConfigError(format!("Failed to canonicalize workspace root: {}", e))
        })?;
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Resolve a requested working directory
    ///
    /// - `None` or blank: the workspace root
    /// - relative: joined onto the root
    /// - accidental duplication of the root (`<root>/<root>/x`,
    ///   `<root>/<root-name>/x`) is collapsed
    /// - the result must be an existing directory
    pub fn resolve_cwd(&self, requested: Option<&str>) -> Result<PathBuf> {
        let requested = match requested.map(str::trim) {
            None | Some("") => return Ok(self.root.clone()),
            Some(p) => p,
        };

        let expanded = expand_home(requested);
        let joined = if expanded.is_absolute() {
            expanded
        } else {
            self.root.join(expanded)
        };
        let candidate = self.collapse_duplicate_root(&lexical_normalize(&joined));

        if !candidate.is_dir() {
            return Err(EngineError::InvalidArguments(format!(
                "Working directory does not exist: {}",
                requested
            )));
        }
        Ok(candidate)
    }

    fn collapse_duplicate_root(&self, path: &Path) -> PathBuf {
        let mut current = path.to_path_buf();
        let root_relative: PathBuf = self
            .root
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();
        let root_name = self.root.file_name().map(PathBuf::from);

        loop {
            let rest = match current.strip_prefix(&self.root) {
                Ok(rest) => rest.to_path_buf(),
                Err(_) => return current,
            };
            if current.is_dir() && !rest.as_os_str().is_empty() {
                // A real directory that happens to repeat the name wins
                return current;
            }

            let stripped = if !root_relative.as_os_str().is_empty() {
                rest.strip_prefix(&root_relative).ok()
            } else {
                None
            }
            .or_else(|| {
                root_name
                    .as_ref()
                    .and_then(|name| rest.strip_prefix(name).ok())
            });

            match stripped {
                Some(remainder) => current = self.root.join(remainder),
                None => return current,
            }
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(path));
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Resolve `.` and `..` without touching the filesystem
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Path jail security manager
#[derive(Debug, Clone)]
pub struct PathJail {
    /// Canonicalized jail root directory
    jail_root: PathBuf,
}

impl PathJail {
    /// Create new path jail with given root directory
    pub fn new(jail_root: impl AsRef<Path>) -> Result<Self> {
        let jail_root = jail_root.as_ref();

        if !jail_root.exists() {
            return Err(EngineError::ConfigError(format!(
                "Jail root does not exist: {}",
                jail_root.display()
            )));
        }

        // Canonicalize jail root (resolve symlinks, .., .)
        let jail_root = jail_root.canonicalize().map_err(|e| {
            EngineError::ConfigError(format!("Failed to canonicalize jail root: {}", e))
        })?;

        Ok(Self { jail_root })
    }

    /// Verify path is within jail and return canonical path
    ///
    /// Paths that do not exist yet are accepted when their parent resolves
    /// inside the jail, so writes can target new files.
    pub fn verify_and_canonicalize(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();

        let full_path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.jail_root.join(path)
        };

        let canonical = match full_path.canonicalize() {
            Ok(p) => p,
            Err(e) => {
                if let Some(parent) = full_path.parent() {
                    if parent.exists() {
                        let parent_canonical = parent.canonicalize().map_err(|_| {
                            EngineError::InvalidArguments(format!(
                                "Cannot verify path: {}",
                                path.display()
                            ))
                        })?;

                        if !parent_canonical.starts_with(&self.jail_root) {
                            return Err(EngineError::InvalidArguments(format!(
                                "Path escapes workspace: {}",
                                path.display()
                            )));
                        }

                        if let Some(file_name) = full_path.file_name() {
                            return Ok(parent_canonical.join(file_name));
                        }
                    }
                }

                return Err(EngineError::InvalidArguments(format!(
                    "Path verification failed: {} ({})",
                    path.display(),
                    e
                )));
            }
        };

        if !canonical.starts_with(&self.jail_root) {
            return Err(EngineError::InvalidArguments(format!(
                "Path escapes workspace: {}",
                path.display()
            )));
        }

        Ok(canonical)
    }

    /// Get jail root directory
    pub fn jail_root(&self) -> &Path {
        &self.jail_root
    }
}
