//! Execution sessions
//!
//! A session is one supervised process run. Its mutable state sits behind
//! the session's own lock, and `finish` is the only way out of RUNNING.

use crate::tools::process::buffer::OutputBuffer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

/// Session lifecycle. RUNNING moves to exactly one terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    /// Exit code 0
    Completed,
    /// Non-zero exit code
    Failed,
    /// Deadline exceeded; process force-terminated
    Timeout,
    /// Explicit cancellation
    Killed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Timeout => "timeout",
            SessionStatus::Killed => "killed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requests the supervising task acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlSignal {
    Kill,
}

pub(crate) struct SessionState {
    pub status: SessionStatus,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub ended_at: Option<DateTime<Utc>>,
    pub ended_instant: Option<Instant>,
    pub error: Option<String>,
    pub stdout: OutputBuffer,
    pub stderr: OutputBuffer,
}

/// Shared handle to one session
pub struct Session {
    pub id: u64,
    pub command: String,
    pub cwd: PathBuf,
    pub started_at: DateTime<Utc>,
    pub pty: bool,
    started_instant: Instant,
    background: AtomicBool,
    state: Mutex<SessionState>,
    status_tx: watch::Sender<SessionStatus>,
    control_tx: mpsc::UnboundedSender<ControlSignal>,
    input: Mutex<Option<Box<dyn Write + Send>>>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        command: String,
        cwd: PathBuf,
        background: bool,
        pty: bool,
        stdout: OutputBuffer,
        stderr: OutputBuffer,
        control_tx: mpsc::UnboundedSender<ControlSignal>,
    ) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::Running);
        Self {
            id,
            command,
            cwd,
            started_at: Utc::now(),
            pty,
            started_instant: Instant::now(),
            background: AtomicBool::new(background),
            state: Mutex::new(SessionState {
                status: SessionStatus::Running,
                pid: None,
                exit_code: None,
                ended_at: None,
                ended_instant: None,
                error: None,
                stdout,
                stderr,
            }),
            status_tx,
            control_tx,
            input: Mutex::new(None),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> SessionStatus {
        self.lock().status
    }

    pub fn is_background(&self) -> bool {
        self.background.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_background(&self) {
        self.background.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_pid(&self, pid: Option<u32>) {
        self.lock().pid = pid;
    }

    pub(crate) fn set_input(&self, writer: Box<dyn Write + Send>) {
        *self.input.lock().unwrap_or_else(|p| p.into_inner()) = Some(writer);
    }

    /// Write to the session's terminal; false when there is no input stream
    pub(crate) fn write_input(&self, text: &str) -> std::io::Result<bool> {
        let mut guard = self.input.lock().unwrap_or_else(|p| p.into_inner());
        match guard.as_mut() {
            Some(writer) => {
                writer.write_all(text.as_bytes())?;
                writer.flush()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub(crate) fn push_stdout(&self, bytes: &[u8]) {
        self.lock().stdout.push_bytes(bytes);
    }

    pub(crate) fn push_stderr(&self, bytes: &[u8]) {
        self.lock().stderr.push_bytes(bytes);
    }

    pub(crate) fn send_control(&self, signal: ControlSignal) -> bool {
        self.control_tx.send(signal).is_ok()
    }

    /// The single transition out of RUNNING. Returns false (and changes
    /// nothing) when the session is already terminal.
    pub(crate) fn finish(
        &self,
        status: SessionStatus,
        exit_code: Option<i32>,
        error: Option<String>,
    ) -> bool {
        debug_assert!(status.is_terminal());
        {
            let mut state = self.lock();
            if state.status.is_terminal() {
                return false;
            }
            state.stdout.finish();
            state.stderr.finish();
            state.status = status;
            state.exit_code = exit_code;
            state.error = error;
            state.ended_at = Some(Utc::now());
            state.ended_instant = Some(Instant::now());
        }
        self.input.lock().unwrap_or_else(|p| p.into_inner()).take();
        self.status_tx.send_replace(status);
        true
    }

    /// Wait until the session is terminal or `limit` elapses
    pub async fn wait_terminal(&self, limit: Duration) -> SessionStatus {
        let mut rx = self.status_tx.subscribe();
        let waited = tokio::time::timeout(limit, rx.wait_for(|s| s.is_terminal())).await;
        match waited {
            Ok(Ok(status)) => *status,
            _ => self.status(),
        }
    }

    /// Whether the session ended more than `ttl` ago
    pub(crate) fn expired(&self, ttl: Duration, now: Instant) -> bool {
        let state = self.lock();
        match (state.status.is_terminal(), state.ended_instant) {
            (true, Some(ended)) => now.saturating_duration_since(ended) >= ttl,
            _ => false,
        }
    }

    /// Point-in-time copy of every exposed field
    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.lock();
        let duration = match state.ended_instant {
            Some(ended) => ended.saturating_duration_since(self.started_instant),
            None => self.started_instant.elapsed(),
        };
        SessionSnapshot {
            session_id: self.id,
            command: self.command.clone(),
            cwd: self.cwd.display().to_string(),
            status: state.status,
            pid: state.pid,
            started_at: self.started_at,
            ended_at: state.ended_at,
            exit_code: state.exit_code,
            output: state.stdout.content().to_string(),
            tail: state.stdout.tail().to_string(),
            stderr: state.stderr.content().to_string(),
            error: state.error.clone(),
            duration_ms: duration.as_millis() as u64,
            background: self.is_background(),
            truncated: state.stdout.truncated(),
            total_output_chars: state.stdout.total_chars(),
            pty: self.pty,
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("status", &self.status())
            .finish()
    }
}

/// Caller-visible view of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: u64,
    pub command: String,
    pub cwd: String,
    pub status: SessionStatus,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub output: String,
    pub tail: String,
    pub stderr: String,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub background: bool,
    pub truncated: bool,
    pub total_output_chars: u64,
    pub pty: bool,
}
