//! Filesystem providers
//!
//! All paths go through the workspace `PathJail`:
//! - read_file: read a file (optionally a line range)
//! - write_file: write or append content
//! - edit_file: replace an exact text fragment
//! - search_files: substring search over workspace files

use crate::errors::{EngineError, Result};
use crate::tools::provider::Provider;
use crate::tools::security::PathJail;
use crate::tools::types::{ToolCategory, ToolSchema};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

/// Largest file read_file and search_files will load
pub const MAX_FILE_BYTES: u64 = 2 * 1024 * 1024;

const DEFAULT_MAX_RESULTS: usize = 50;

fn parse_args<T: serde::de::DeserializeOwned>(tool: &str, args: Value) -> Result<T> {
    serde_json::from_value(args)
        .map_err(|e| EngineError::InvalidArguments(format!("{}: {}", tool, e)))
}

/// Expand `~` the way a shell would before jailing the path
fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(path));
    }
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

fn display_path(jail: &PathJail, path: &Path) -> String {
    path.strip_prefix(jail.jail_root())
        .unwrap_or(path)
        .display()
        .to_string()
}

async fn read_text(path: &Path) -> Result<String> {
    let metadata = tokio::fs::metadata(path).await?;
    if metadata.len() > MAX_FILE_BYTES {
        return Err(EngineError::InvalidArguments(format!(
            "File too large: {} bytes (max: {} bytes)",
            metadata.len(),
            MAX_FILE_BYTES
        )));
    }
    Ok(tokio::fs::read_to_string(path).await?)
}

#[derive(Debug, Deserialize)]
struct ReadArgs {
    path: String,
    #[serde(default)]
    start_line: Option<usize>,
    #[serde(default)]
    end_line: Option<usize>,
}

/// read_file provider
pub struct ReadFileProvider {
    schema: ToolSchema,
    jail: PathJail,
}

impl ReadFileProvider {
    pub fn new(jail: PathJail) -> Self {
        let schema = ToolSchema::new(
            "read_file",
            "Read contents of a file",
            json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "File path (relative to the workspace)"
                    },
                    "start_line": { "type": "integer", "minimum": 1 },
                    "end_line": { "type": "integer", "minimum": 1 }
                },
                "required": ["path"]
            }),
            true,
        )
        .with_category(ToolCategory::FileRead);
        Self { schema, jail }
    }
}

#[async_trait]
impl Provider for ReadFileProvider {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, args: Value) -> Result<Value> {
        let args: ReadArgs = parse_args("read_file", args)?;
        let path = self.jail.verify_and_canonicalize(expand_home(&args.path))?;

        if !path.is_file() {
            return Ok(json!({
                "status": "not_found",
                "error": format!("File does not exist: {}", args.path),
                "path": args.path,
            }));
        }

        let text = read_text(&path).await?;
        let total_lines = text.lines().count();
        let content = match (args.start_line, args.end_line) {
            (None, None) => text,
            (start, end) => {
                let start = start.unwrap_or(1).max(1);
                let end = end.unwrap_or(total_lines).min(total_lines);
                text.lines()
                    .skip(start - 1)
                    .take(end.saturating_sub(start - 1))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        };

        Ok(json!({
            "path": display_path(&self.jail, &path),
            "content": content,
            "total_lines": total_lines,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct WriteArgs {
    path: String,
    content: String,
    #[serde(default)]
    append: bool,
}

/// write_file provider
pub struct WriteFileProvider {
    schema: ToolSchema,
    jail: PathJail,
}

impl WriteFileProvider {
    pub fn new(jail: PathJail) -> Self {
        let schema = ToolSchema::new(
            "write_file",
            "Write content to a file, creating parent directories",
            json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "File path (relative to the workspace)"
                    },
                    "content": {
                        "type": "string",
                        "description": "Content to write"
                    },
                    "append": {
                        "type": "boolean",
                        "description": "Append instead of overwrite",
                        "default": false
                    }
                },
                "required": ["path", "content"]
            }),
            false,
        )
        .with_category(ToolCategory::FileEdit);
        Self { schema, jail }
    }
}

#[async_trait]
impl Provider for WriteFileProvider {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, args: Value) -> Result<Value> {
        let args: WriteArgs = parse_args("write_file", args)?;
        let expanded = expand_home(&args.path);

        // Parent directories must exist before the jail can canonicalize
        let full = if expanded.is_absolute() {
            expanded.clone()
        } else {
            self.jail.jail_root().join(&expanded)
        };
        if let Some(parent) = full.parent() {
            let jailed_parent = parent.starts_with(self.jail.jail_root())
                && !parent.components().any(|c| c.as_os_str() == "..");
            if jailed_parent && !parent.exists() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let path = self.jail.verify_and_canonicalize(&expanded)?;
        if args.append {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(args.content.as_bytes()).await?;
            file.flush().await?;
        } else {
            tokio::fs::write(&path, &args.content).await?;
        }

        Ok(json!({
            "status": "success",
            "path": display_path(&self.jail, &path),
            "bytes_written": args.content.len(),
            "appended": args.append,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct EditArgs {
    path: String,
    old_text: String,
    new_text: String,
    #[serde(default)]
    replace_all: bool,
}

/// edit_file provider
pub struct EditFileProvider {
    schema: ToolSchema,
    jail: PathJail,
}

impl EditFileProvider {
    pub fn new(jail: PathJail) -> Self {
        let schema = ToolSchema::new(
            "edit_file",
            "Replace an exact text fragment in a file",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "old_text": {
                        "type": "string",
                        "description": "Text to replace; must match exactly"
                    },
                    "new_text": { "type": "string" },
                    "replace_all": {
                        "type": "boolean",
                        "description": "Replace every occurrence instead of requiring a unique match",
                        "default": false
                    }
                },
                "required": ["path", "old_text", "new_text"]
            }),
            false,
        )
        .with_category(ToolCategory::FileEdit);
        Self { schema, jail }
    }
}

#[async_trait]
impl Provider for EditFileProvider {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, args: Value) -> Result<Value> {
        let args: EditArgs = parse_args("edit_file", args)?;
        if args.old_text.is_empty() {
            return Err(EngineError::InvalidArguments(
                "edit_file: old_text cannot be empty".to_string(),
            ));
        }

        let path = self.jail.verify_and_canonicalize(expand_home(&args.path))?;
        if !path.is_file() {
            return Ok(json!({
                "status": "not_found",
                "error": format!("File does not exist: {}", args.path),
                "path": args.path,
            }));
        }

        let text = read_text(&path).await?;
        let occurrences = text.matches(args.old_text.as_str()).count();
        if occurrences == 0 {
            return Ok(json!({
                "status": "error",
                "error": format!("Text not found in {}", args.path),
                "path": args.path,
            }));
        }
        if occurrences > 1 && !args.replace_all {
            return Ok(json!({
                "status": "error",
                "error": format!(
                    "Text occurs {} times in {}; add surrounding context or set replace_all",
                    occurrences, args.path
                ),
                "path": args.path,
            }));
        }

        let updated = if args.replace_all {
            text.replace(&args.old_text, &args.new_text)
        } else {
            text.replacen(&args.old_text, &args.new_text, 1)
        };
        tokio::fs::write(&path, updated).await?;

        Ok(json!({
            "status": "updated",
            "path": display_path(&self.jail, &path),
            "replacements": if args.replace_all { occurrences } else { 1 },
        }))
    }
}

#[derive(Debug, Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    glob: Option<String>,
    #[serde(default)]
    case_sensitive: bool,
    #[serde(default)]
    max_results: Option<usize>,
}

/// search_files provider
pub struct SearchFilesProvider {
    schema: ToolSchema,
    jail: PathJail,
}

impl SearchFilesProvider {
    pub fn new(jail: PathJail) -> Self {
        let schema = ToolSchema::new(
            "search_files",
            "Search workspace files for a text fragment",
            json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "path": {
                        "type": "string",
                        "description": "Directory to search (default: workspace root)"
                    },
                    "glob": {
                        "type": "string",
                        "description": "File name filter, e.g. *.rs"
                    },
                    "case_sensitive": { "type": "boolean", "default": false },
                    "max_results": { "type": "integer", "minimum": 1, "default": 50 }
                },
                "required": ["query"]
            }),
            true,
        )
        .with_category(ToolCategory::Search);
        Self { schema, jail }
    }
}

#[async_trait]
impl Provider for SearchFilesProvider {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, args: Value) -> Result<Value> {
        let args: SearchArgs = parse_args("search_files", args)?;
        if args.query.trim().is_empty() {
            return Err(EngineError::InvalidArguments(
                "search_files: query cannot be empty".to_string(),
            ));
        }

        let root = self
            .jail
            .verify_and_canonicalize(expand_home(args.path.as_deref().unwrap_or(".")))?;
        let filter = args.glob.as_deref().map(glob_to_regex).transpose()?;
        let limit = args.max_results.unwrap_or(DEFAULT_MAX_RESULTS).max(1);
        let needle = if args.case_sensitive {
            args.query.clone()
        } else {
            args.query.to_lowercase()
        };

        let mut files = collect_files(&root).await;
        files.sort();

        let mut results = Vec::new();
        let mut truncated = false;
        'files: for file in files {
            let name = file.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
            if let Some(re) = &filter {
                if !re.is_match(&name) {
                    continue;
                }
            }
            let Ok(text) = read_text(&file).await else { continue };
            for (idx, line) in text.lines().enumerate() {
                let hit = if args.case_sensitive {
                    line.contains(&needle)
                } else {
                    line.to_lowercase().contains(&needle)
                };
                if hit {
                    if results.len() == limit {
                        truncated = true;
                        break 'files;
                    }
                    results.push(json!({
                        "file": display_path(&self.jail, &file),
                        "line": idx + 1,
                        "text": line.trim_end(),
                    }));
                }
            }
        }

        let status = if results.is_empty() { "no_results" } else { "found" };
        Ok(json!({
            "status": status,
            "query": args.query,
            "count": results.len(),
            "truncated": truncated,
            "results": results,
        }))
    }
}

/// Collect regular files under `root`, skipping hidden entries
async fn collect_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else { continue };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let Ok(file_type) = entry.file_type().await else { continue };
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files
}

fn glob_to_regex(glob: &str) -> Result<Regex> {
    let mut pattern = String::from("^");
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern)
        .map_err(|e| EngineError::InvalidArguments(format!("Invalid glob '{}': {}", glob, e)))
}
