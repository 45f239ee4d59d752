//! Pseudo-terminal sessions
//!
//! Commands that need a terminal (prompts, curses UIs, REPLs) run under a
//! pty from `portable-pty`. The pty API is blocking, so reading and waiting
//! live on the blocking pool while the supervising task stays async.

use crate::errors::{EngineError, Result};
use crate::tools::process::events::EventSink;
use crate::tools::process::session::{ControlSignal, Session};
use crate::tools::process::supervisor::{
    drain_or_kill, finalize, kill_overrides_exit, signal_group, ExitOutcome, PreparedCommand,
    DRAIN_GRACE,
};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Terminal dimensions in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 120, rows: 40 }
    }
}

impl TerminalSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            cols: cols.max(1),
            rows: rows.max(1),
        }
    }
}

pub(crate) struct PtyProcess {
    pub pid: Option<u32>,
    master: Box<dyn MasterPty + Send>,
    reader: Box<dyn Read + Send>,
    writer: Option<Box<dyn Write + Send>>,
    child: Box<dyn Child + Send + Sync>,
}

impl PtyProcess {
    pub fn take_writer(&mut self) -> Option<Box<dyn Write + Send>> {
        self.writer.take()
    }
}

fn pty_error(context: &str, err: impl std::fmt::Display) -> EngineError {
    EngineError::Spawn(format!("{}: {}", context, err))
}

pub(crate) fn spawn(prepared: &PreparedCommand, size: TerminalSize) -> Result<PtyProcess> {
    let pair = native_pty_system()
        .openpty(PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| pty_error("Failed to open pty", e))?;

    let mut cmd = CommandBuilder::new(&prepared.program);
    cmd.args(&prepared.args);
    cmd.cwd(&prepared.cwd);
    for (key, value) in &prepared.env {
        cmd.env(key, value);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| pty_error(&prepared.program, e))?;
    // the child holds its own copy; keeping ours would block EOF on the reader
    drop(pair.slave);

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| pty_error("Failed to read pty", e))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| pty_error("Failed to open pty input", e))?;

    Ok(PtyProcess {
        pid: child.process_id(),
        master: pair.master,
        reader,
        writer: Some(writer),
        child,
    })
}

fn read_terminal(mut reader: Box<dyn Read + Send>, session: &Session) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => session.push_stdout(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // EIO once the child side closes on Linux
            Err(_) => break,
        }
    }
}

type WaitResult = std::result::Result<std::io::Result<portable_pty::ExitStatus>, oneshot::error::RecvError>;

fn exit_outcome(waited: WaitResult) -> ExitOutcome {
    match waited {
        Ok(Ok(status)) => ExitOutcome::Exited {
            code: i32::try_from(status.exit_code()).ok(),
            signal: None,
        },
        Ok(Err(e)) => ExitOutcome::WaitFailed(e.to_string()),
        Err(_) => ExitOutcome::WaitFailed("wait task ended unexpectedly".to_string()),
    }
}

pub(crate) async fn supervise(
    session: Arc<Session>,
    process: PtyProcess,
    timeout: Option<Duration>,
    timeout_secs: u64,
    mut control_rx: mpsc::UnboundedReceiver<ControlSignal>,
    grace: Duration,
    sink: Arc<dyn EventSink>,
) {
    let PtyProcess {
        pid,
        master,
        reader,
        writer: _,
        mut child,
    } = process;
    let mut killer = child.clone_killer();

    let reader_session = session.clone();
    let mut reader_task =
        tokio::task::spawn_blocking(move || read_terminal(reader, &reader_session));

    let (exit_tx, mut exit_rx) = oneshot::channel();
    tokio::task::spawn_blocking(move || {
        let _ = exit_tx.send(child.wait());
    });

    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let outcome = tokio::select! {
        waited = &mut exit_rx => exit_outcome(waited),
        _ = &mut deadline => {
            force_kill(pid, killer.as_mut(), &mut exit_rx).await;
            ExitOutcome::TimedOut(timeout_secs)
        }
        Some(ControlSignal::Kill) = control_rx.recv() => {
            signal_group(pid, false);
            if tokio::time::timeout(grace, &mut exit_rx).await.is_err() {
                force_kill(pid, killer.as_mut(), &mut exit_rx).await;
            }
            ExitOutcome::Killed
        }
    };

    drop(master);
    let session_id = session.id;
    let drained = async {
        if tokio::time::timeout(DRAIN_GRACE, &mut reader_task).await.is_err() {
            tracing::debug!(session_id, "Terminal reader still blocked after exit");
            reader_task.abort();
        }
    };
    let killed = drain_or_kill(drained, session_id, pid, &mut control_rx).await;

    finalize(&session, kill_overrides_exit(outcome, killed), sink.as_ref());
}

async fn force_kill(
    pid: Option<u32>,
    killer: &mut (dyn ChildKiller + Send + Sync),
    exit_rx: &mut oneshot::Receiver<std::io::Result<portable_pty::ExitStatus>>,
) {
    signal_group(pid, true);
    if let Err(e) = killer.kill() {
        tracing::debug!(?pid, error = %e, "pty kill failed");
    }
    let _ = tokio::time::timeout(DRAIN_GRACE, exit_rx).await;
}

#[cfg(all(test, unix))]
mod tests {
    use crate::config::ProcessConfig;
    use crate::tools::process::events::NullSink;
    use crate::tools::process::session::SessionStatus;
    use crate::tools::process::supervisor::{ProcessSupervisor, StartRequest};
    use crate::tools::process::TerminalSize;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup() -> (ProcessSupervisor, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = ProcessConfig {
            workspace_root: dir.path().to_string_lossy().to_string(),
            yield_window_ms: 5_000,
            kill_grace_ms: 300,
            ..ProcessConfig::default()
        };
        (ProcessSupervisor::new(config, Arc::new(NullSink)).unwrap(), dir)
    }

    async fn wait_done(supervisor: &ProcessSupervisor, id: u64) -> SessionStatus {
        for _ in 0..100 {
            let status = supervisor.status(id).unwrap().status;
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        supervisor.status(id).unwrap().status
    }

    #[tokio::test]
    async fn test_pty_reports_terminal() {
        let (supervisor, _dir) = setup();
        let snap = supervisor
            .interactive(
                StartRequest::new("test -t 1 && echo tty || echo notty"),
                TerminalSize::default(),
            )
            .await
            .unwrap();

        assert!(snap.pty);
        assert_eq!(snap.status, SessionStatus::Completed);
        assert!(snap.output.contains("tty"));
        assert!(!snap.output.contains("notty"));
    }

    #[tokio::test]
    async fn test_pty_send_input() {
        let (supervisor, _dir) = setup();
        let snap = supervisor
            .interactive(
                StartRequest::new("read line; echo got:$line").background(true),
                TerminalSize::new(80, 24),
            )
            .await
            .unwrap();
        assert_eq!(snap.status, SessionStatus::Running);

        supervisor.send_input(snap.session_id, "hello\n").await.unwrap();
        assert_eq!(wait_done(&supervisor, snap.session_id).await, SessionStatus::Completed);
        assert!(supervisor
            .status(snap.session_id)
            .unwrap()
            .output
            .contains("got:hello"));
    }

    #[tokio::test]
    async fn test_pty_kill() {
        let (supervisor, _dir) = setup();
        let snap = supervisor
            .interactive(StartRequest::new("sleep 30").background(true), TerminalSize::default())
            .await
            .unwrap();

        let killed = supervisor.kill(snap.session_id).await.unwrap();
        assert_eq!(killed.status, SessionStatus::Killed);
        assert!(supervisor.send_input(snap.session_id, "x").await.is_err());
    }

    #[tokio::test]
    async fn test_send_input_requires_pty() {
        let (supervisor, _dir) = setup();
        let snap = supervisor
            .start(StartRequest::new("sleep 5").background(true))
            .await
            .unwrap();
        assert!(supervisor.send_input(snap.session_id, "x").await.is_err());
        supervisor.shutdown().await;
    }
}
