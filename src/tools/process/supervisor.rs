//! Process supervisor
//!
//! Spawns shell commands as addressable sessions. Per session: two drain
//! tasks (stdout, stderr) and one supervising task that owns the child,
//! enforces the deadline and handles kill requests. Terminal transitions go
//! through `Session::finish` only.

use crate::config::ProcessConfig;
use crate::errors::{EngineError, Result};
use crate::tools::process::buffer::OutputBuffer;
use crate::tools::process::events::{CompletionEvent, EventSink};
use crate::tools::process::pty::{self, TerminalSize};
use crate::tools::process::session::{ControlSignal, Session, SessionSnapshot, SessionStatus};
use crate::tools::security::{sanitize_env, WorkspaceRoot};
use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long drains may keep reading after the process is gone
pub(crate) const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Characters of output carried by a completion event
const EVENT_TAIL_CHARS: usize = 500;

const READ_CHUNK: usize = 8192;

/// Shell used to interpret the command string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    Sh,
    Bash,
    Zsh,
    Cmd,
    PowerShell,
}

impl ShellKind {
    pub fn program(&self) -> &'static str {
        match self {
            ShellKind::Sh => "sh",
            ShellKind::Bash => "bash",
            ShellKind::Zsh => "zsh",
            ShellKind::Cmd => "cmd",
            ShellKind::PowerShell => "powershell",
        }
    }

    /// Arguments that make the shell run `command` and exit
    pub fn args(&self, command: &str) -> Vec<String> {
        match self {
            ShellKind::Sh | ShellKind::Bash | ShellKind::Zsh => {
                vec!["-c".to_string(), command.to_string()]
            }
            ShellKind::Cmd => vec!["/C".to_string(), command.to_string()],
            ShellKind::PowerShell => vec![
                "-NoProfile".to_string(),
                "-NonInteractive".to_string(),
                "-Command".to_string(),
                command.to_string(),
            ],
        }
    }

    pub fn platform_default() -> Self {
        if cfg!(windows) {
            ShellKind::Cmd
        } else {
            ShellKind::Bash
        }
    }
}

impl FromStr for ShellKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sh" => Ok(ShellKind::Sh),
            "bash" => Ok(ShellKind::Bash),
            "zsh" => Ok(ShellKind::Zsh),
            "cmd" => Ok(ShellKind::Cmd),
            "powershell" | "pwsh" => Ok(ShellKind::PowerShell),
            other => Err(EngineError::InvalidArguments(format!(
                "Unsupported shell: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for ShellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

/// Parameters for starting a session
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub command: String,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    /// `None` uses the configured default; `Some(0)` disables the deadline
    pub timeout_secs: Option<u64>,
    pub background: bool,
    pub shell: Option<ShellKind>,
}

impl StartRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    pub fn shell(mut self, shell: ShellKind) -> Self {
        self.shell = Some(shell);
        self
    }
}

/// How the supervised process ended, before mapping to a session status
#[derive(Debug)]
pub(crate) enum ExitOutcome {
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
    SpawnFailed(String),
    WaitFailed(String),
    TimedOut(u64),
    Killed,
}

/// Validated spawn parameters shared by the pipe and pty paths
pub(crate) struct PreparedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: std::path::PathBuf,
    pub env: HashMap<String, String>,
    pub timeout: Option<Duration>,
    pub timeout_secs: u64,
}

/// Tracks every session of the process
pub struct ProcessSupervisor {
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
    next_id: AtomicU64,
    config: ProcessConfig,
    workspace: WorkspaceRoot,
    default_shell: ShellKind,
    sink: Arc<dyn EventSink>,
}

impl ProcessSupervisor {
    /// Create a supervisor; the workspace root is created if missing
    pub fn new(config: ProcessConfig, sink: Arc<dyn EventSink>) -> Result<Self> {
        let workspace = WorkspaceRoot::new(config.workspace_path())?;
        let default_shell = config.default_shell.parse().unwrap_or_else(|_| {
            tracing::warn!(
                shell = %config.default_shell,
                "Unsupported default shell, using platform default"
            );
            ShellKind::platform_default()
        });

        Ok(Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            config,
            workspace,
            default_shell,
            sink,
        })
    }

    pub fn workspace(&self) -> &WorkspaceRoot {
        &self.workspace
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<u64, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn get(&self, id: u64) -> Result<Arc<Session>> {
        self.sessions()
            .get(&id)
            .cloned()
            .ok_or(EngineError::SessionNotFound(id))
    }

    fn prepare(&self, request: &StartRequest) -> Result<PreparedCommand> {
        let command = request.command.trim();
        if command.is_empty() {
            return Err(EngineError::InvalidArguments(
                "Command cannot be empty".to_string(),
            ));
        }

        let timeout_secs = request
            .timeout_secs
            .unwrap_or(self.config.default_timeout_secs);
        if timeout_secs == 0 && !request.background {
            return Err(EngineError::InvalidArguments(
                "timeout 0 (no deadline) is only allowed with background=true".to_string(),
            ));
        }

        let cwd = self.workspace.resolve_cwd(request.cwd.as_deref())?;
        let (env, _dropped) = sanitize_env(request.env.clone());
        let shell = request.shell.unwrap_or(self.default_shell);

        Ok(PreparedCommand {
            program: shell.program().to_string(),
            args: shell.args(command),
            cwd,
            env,
            timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            timeout_secs,
        })
    }

    fn new_session(&self, request: &StartRequest, prepared: &PreparedCommand, pty: bool) -> (Arc<Session>, mpsc::UnboundedReceiver<ControlSignal>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Session::new(
            id,
            request.command.trim().to_string(),
            prepared.cwd.clone(),
            request.background,
            pty,
            OutputBuffer::new(self.config.stdout_cap_chars, self.config.tail_chars),
            OutputBuffer::new(self.config.stderr_cap_chars, self.config.tail_chars),
            control_tx,
        ));
        (session, control_rx)
    }

    /// Start a command with piped stdout/stderr
    ///
    /// Background requests return immediately. Foreground requests block up
    /// to the yield window and then return whatever state the session is in;
    /// a still-running session continues in the background.
    pub async fn start(&self, request: StartRequest) -> Result<SessionSnapshot> {
        let prepared = self.prepare(&request)?;

        let mut cmd = Command::new(&prepared.program);
        cmd.args(&prepared.args)
            .current_dir(&prepared.cwd)
            .envs(&prepared.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let (session, control_rx) = self.new_session(&request, &prepared, false);
        self.sessions().insert(session.id, session.clone());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("{}: {}", prepared.program, e);
                return Err(self.spawn_failed(&session, message));
            }
        };
        session.set_pid(child.id());

        let mut drains = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            drains.push(spawn_drain(stdout, session.clone(), Stream::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(spawn_drain(stderr, session.clone(), Stream::Stderr));
        }

        tracing::info!(
            session_id = session.id,
            pid = ?child.id(),
            command = %session.command,
            cwd = %prepared.cwd.display(),
            background = request.background,
            "Session started"
        );

        tokio::spawn(supervise_child(
            session.clone(),
            child,
            drains,
            prepared.timeout,
            prepared.timeout_secs,
            control_rx,
            Duration::from_millis(self.config.kill_grace_ms),
            self.sink.clone(),
        ));

        Ok(self.yield_or_background(&session, request.background).await)
    }

    /// Start a command attached to a pseudo-terminal
    ///
    /// Same session contract as [`start`](Self::start); stdout carries the
    /// merged terminal output and stderr stays empty.
    pub async fn interactive(
        &self,
        request: StartRequest,
        size: TerminalSize,
    ) -> Result<SessionSnapshot> {
        let prepared = self.prepare(&request)?;

        let (session, control_rx) = self.new_session(&request, &prepared, true);
        self.sessions().insert(session.id, session.clone());

        let mut process = match pty::spawn(&prepared, size) {
            Ok(process) => process,
            Err(EngineError::Spawn(message)) => return Err(self.spawn_failed(&session, message)),
            Err(e) => return Err(self.spawn_failed(&session, e.to_string())),
        };
        session.set_pid(process.pid);
        if let Some(writer) = process.take_writer() {
            session.set_input(writer);
        }

        tracing::info!(
            session_id = session.id,
            pid = ?process.pid,
            command = %session.command,
            cols = size.cols,
            rows = size.rows,
            "Interactive session started"
        );

        tokio::spawn(pty::supervise(
            session.clone(),
            process,
            prepared.timeout,
            prepared.timeout_secs,
            control_rx,
            Duration::from_millis(self.config.kill_grace_ms),
            self.sink.clone(),
        ));

        Ok(self.yield_or_background(&session, request.background).await)
    }

    /// Record a spawn failure on the already registered session
    fn spawn_failed(&self, session: &Session, message: String) -> EngineError {
        tracing::warn!(session_id = session.id, error = %message, "Failed to spawn session");
        finalize(session, ExitOutcome::SpawnFailed(message.clone()), self.sink.as_ref());
        EngineError::Spawn(message)
    }

    async fn yield_or_background(&self, session: &Session, background: bool) -> SessionSnapshot {
        if background {
            return session.snapshot();
        }

        let window = Duration::from_millis(self.config.yield_window_ms);
        let status = session.wait_terminal(window).await;
        if !status.is_terminal() {
            session.mark_background();
            tracing::info!(
                session_id = session.id,
                yield_ms = self.config.yield_window_ms,
                "Session still running after yield window, continuing in background"
            );
        }
        session.snapshot()
    }

    pub fn status(&self, id: u64) -> Result<SessionSnapshot> {
        Ok(self.get(id)?.snapshot())
    }

    /// Terminate a running session (graceful first, forced after the grace
    /// window). Errors without side effects when the session is terminal.
    pub async fn kill(&self, id: u64) -> Result<SessionSnapshot> {
        let session = self.get(id)?;

        let status = session.status();
        if status.is_terminal() {
            return Err(EngineError::SessionNotRunning {
                id,
                status: status.to_string(),
            });
        }

        if !session.send_control(ControlSignal::Kill) {
            return Err(EngineError::SessionNotRunning {
                id,
                status: session.status().to_string(),
            });
        }

        let grace = Duration::from_millis(self.config.kill_grace_ms);
        session.wait_terminal(grace + DRAIN_GRACE * 2).await;

        // the process may have ended on its own before the request landed
        let snapshot = session.snapshot();
        if snapshot.status.is_terminal() && snapshot.status != SessionStatus::Killed {
            return Err(EngineError::SessionNotRunning {
                id,
                status: snapshot.status.to_string(),
            });
        }
        Ok(snapshot)
    }

    /// Snapshots ordered by session id
    pub fn list(&self, active_only: bool) -> Vec<SessionSnapshot> {
        let sessions: Vec<Arc<Session>> = self.sessions().values().cloned().collect();
        let mut snapshots: Vec<SessionSnapshot> = sessions
            .iter()
            .map(|s| s.snapshot())
            .filter(|s| !active_only || s.status == SessionStatus::Running)
            .collect();
        snapshots.sort_by_key(|s| s.session_id);
        snapshots
    }

    /// Write to an interactive session's terminal
    pub async fn send_input(&self, id: u64, text: &str) -> Result<()> {
        let session = self.get(id)?;
        let status = session.status();
        if status.is_terminal() {
            return Err(EngineError::SessionNotRunning {
                id,
                status: status.to_string(),
            });
        }

        // terminal writes block when the pty buffer is full
        let text = text.to_string();
        let written = tokio::task::spawn_blocking(move || session.write_input(&text))
            .await
            .map_err(|e| EngineError::Generic(format!("Input writer task failed: {}", e)))??;
        if !written {
            return Err(EngineError::InvalidArguments(format!(
                "Session {} has no terminal input (start it with pty=true)",
                id
            )));
        }
        Ok(())
    }

    /// Evict terminal sessions older than the TTL
    pub fn sweep_expired(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub(crate) fn sweep_at(&self, now: Instant) -> usize {
        let ttl = Duration::from_secs(self.config.session_ttl_secs);
        let mut sessions = self.sessions();
        let before = sessions.len();
        sessions.retain(|_, session| !session.expired(ttl, now));
        let evicted = before - sessions.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = sessions.len(), "Swept finished sessions");
        }
        evicted
    }

    /// Periodic sweeper; stops once the supervisor is dropped
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let interval = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(supervisor) => {
                        supervisor.sweep_expired();
                    }
                    None => break,
                }
            }
        })
    }

    /// Kill every running session
    pub async fn shutdown(&self) {
        let running: Vec<Arc<Session>> = self
            .sessions()
            .values()
            .filter(|s| !s.status().is_terminal())
            .cloned()
            .collect();

        let grace = Duration::from_millis(self.config.kill_grace_ms);
        for session in running {
            if session.send_control(ControlSignal::Kill) {
                session.wait_terminal(grace + DRAIN_GRACE).await;
            }
        }
    }
}

impl fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("workspace", &self.workspace.path())
            .field("sessions", &self.sessions().len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

fn spawn_drain<R>(mut reader: R, session: Arc<Session>, stream: Stream) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => match stream {
                    Stream::Stdout => session.push_stdout(&buf[..n]),
                    Stream::Stderr => session.push_stderr(&buf[..n]),
                },
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(session_id = session.id, error = %e, ?stream, "Drain stopped");
                    break;
                }
            }
        }
    })
}

#[allow(clippy::too_many_arguments)]
async fn supervise_child(
    session: Arc<Session>,
    mut child: Child,
    drains: Vec<JoinHandle<()>>,
    timeout: Option<Duration>,
    timeout_secs: u64,
    mut control_rx: mpsc::UnboundedReceiver<ControlSignal>,
    grace: Duration,
    sink: Arc<dyn EventSink>,
) {
    let pid = child.id();
    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let outcome = tokio::select! {
        status = child.wait() => exit_outcome(status),
        _ = &mut deadline => {
            force_kill(&mut child, pid).await;
            ExitOutcome::TimedOut(timeout_secs)
        }
        Some(ControlSignal::Kill) = control_rx.recv() => {
            terminate_gracefully(&mut child, pid, grace).await;
            ExitOutcome::Killed
        }
    };

    let drained = async {
        for mut drain in drains {
            if tokio::time::timeout(DRAIN_GRACE, &mut drain).await.is_err() {
                drain.abort();
            }
        }
    };
    let killed = drain_or_kill(drained, session.id, pid, &mut control_rx).await;

    finalize(&session, kill_overrides_exit(outcome, killed), sink.as_ref());
}

/// Wait for output drains while still accepting kill requests
///
/// The shell may have exited while descendants keep its pipes open; until
/// the drains finish the session is still running. A kill in that window
/// force-kills the process group and returns true.
pub(crate) async fn drain_or_kill<F>(
    drained: F,
    session_id: u64,
    pid: Option<u32>,
    control_rx: &mut mpsc::UnboundedReceiver<ControlSignal>,
) -> bool
where
    F: std::future::Future<Output = ()>,
{
    tokio::pin!(drained);
    tokio::select! {
        _ = &mut drained => false,
        Some(ControlSignal::Kill) = control_rx.recv() => {
            tracing::debug!(session_id, ?pid, "Kill requested while draining output");
            signal_group(pid, true);
            drained.await;
            true
        }
    }
}

pub(crate) fn kill_overrides_exit(outcome: ExitOutcome, killed: bool) -> ExitOutcome {
    match outcome {
        ExitOutcome::Exited { .. } | ExitOutcome::WaitFailed(_) if killed => ExitOutcome::Killed,
        other => other,
    }
}

fn exit_outcome(status: std::io::Result<std::process::ExitStatus>) -> ExitOutcome {
    match status {
        Ok(status) => {
            #[cfg(unix)]
            let signal = std::os::unix::process::ExitStatusExt::signal(&status);
            #[cfg(not(unix))]
            let signal = None;
            ExitOutcome::Exited {
                code: status.code(),
                signal,
            }
        }
        Err(e) => ExitOutcome::WaitFailed(e.to_string()),
    }
}

async fn terminate_gracefully(child: &mut Child, pid: Option<u32>, grace: Duration) {
    signal_group(pid, false);
    #[cfg(not(unix))]
    let _ = child.start_kill();

    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        tracing::debug!(?pid, "Grace window elapsed, forcing kill");
        force_kill(child, pid).await;
    }
}

async fn force_kill(child: &mut Child, pid: Option<u32>) {
    signal_group(pid, true);
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Signal the whole process group led by `pid`
#[cfg(unix)]
pub(crate) fn signal_group(pid: Option<u32>, force: bool) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else { return };
    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    #[allow(clippy::cast_possible_wrap)]
    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        tracing::debug!(pid, ?signal, error = %e, "Process group signal failed");
    }
}

#[cfg(not(unix))]
pub(crate) fn signal_group(_pid: Option<u32>, _force: bool) {}

/// Map the exit outcome to a terminal state and publish it
pub(crate) fn finalize(session: &Session, outcome: ExitOutcome, sink: &dyn EventSink) {
    let stderr_tail = {
        let state = session.lock();
        last_chars(state.stderr.content(), EVENT_TAIL_CHARS).trim().to_string()
    };

    let (status, exit_code, error) = match outcome {
        ExitOutcome::Exited {
            code: Some(0), ..
        } => (SessionStatus::Completed, Some(0), None),
        ExitOutcome::Exited {
            code: Some(code), ..
        } => {
            let message = if stderr_tail.is_empty() {
                format!("Command exited with code {}", code)
            } else {
                format!("Command exited with code {}: {}", code, stderr_tail)
            };
            (SessionStatus::Failed, Some(code), Some(message))
        }
        ExitOutcome::Exited { code: None, signal } => {
            let message = match signal {
                Some(sig) => format!("Command terminated by signal {}", sig),
                None => "Command terminated without an exit code".to_string(),
            };
            (SessionStatus::Failed, Some(-1), Some(message))
        }
        ExitOutcome::SpawnFailed(e) => (
            SessionStatus::Failed,
            None,
            Some(EngineError::Spawn(e).to_string()),
        ),
        ExitOutcome::WaitFailed(e) => (
            SessionStatus::Failed,
            None,
            Some(format!("Failed to wait for process: {}", e)),
        ),
        ExitOutcome::TimedOut(secs) => (
            SessionStatus::Timeout,
            Some(-1),
            Some(EngineError::ProcessTimeout { timeout_secs: secs }.to_string()),
        ),
        ExitOutcome::Killed => (
            SessionStatus::Killed,
            Some(-1),
            Some("Command was killed".to_string()),
        ),
    };

    if !session.finish(status, exit_code, error) {
        return;
    }

    let snapshot = session.snapshot();
    tracing::info!(
        session_id = session.id,
        status = %status,
        exit_code = ?exit_code,
        duration_ms = snapshot.duration_ms,
        total_output_chars = snapshot.total_output_chars,
        "Session finished"
    );

    let tail_source = if snapshot.tail.trim().is_empty() {
        &snapshot.stderr
    } else {
        &snapshot.tail
    };
    sink.publish(CompletionEvent {
        session_id: session.id,
        status: status.to_string(),
        exit_code,
        summary: summarize(&session.command, status, exit_code),
        tail: last_chars(tail_source, EVENT_TAIL_CHARS).to_string(),
        background: snapshot.background,
    });
}

fn summarize(command: &str, status: SessionStatus, exit_code: Option<i32>) -> String {
    let shown: String = if command.chars().count() > 80 {
        let head: String = command.chars().take(77).collect();
        format!("{}...", head)
    } else {
        command.to_string()
    };
    match status {
        SessionStatus::Completed => format!("`{}` completed", shown),
        SessionStatus::Failed => match exit_code {
            Some(code) => format!("`{}` failed (exit {})", shown, code),
            None => format!("`{}` failed", shown),
        },
        SessionStatus::Timeout => format!("`{}` timed out", shown),
        SessionStatus::Killed => format!("`{}` was killed", shown),
        SessionStatus::Running => format!("`{}` is running", shown),
    }
}

fn last_chars(text: &str, n: usize) -> &str {
    let count = text.chars().count();
    if count <= n {
        return text;
    }
    let skip = count - n;
    let idx = text
        .char_indices()
        .nth(skip)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    &text[idx..]
}
