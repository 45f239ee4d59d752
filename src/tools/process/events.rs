//! Completion notifications
//!
//! Every terminal transition is published to an [`EventSink`] so that
//! schedulers and UIs outside the engine can wake up promptly.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Published when a session leaves RUNNING
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub session_id: u64,
    pub status: String,
    pub exit_code: Option<i32>,
    /// One-line description, e.g. "`make test` failed (exit 2)"
    pub summary: String,
    /// Short tail of stdout
    pub tail: String,
    /// Whether the caller had already been answered when this fired
    pub background: bool,
}

/// Receiver of completion notifications
pub trait EventSink: Send + Sync {
    fn publish(&self, event: CompletionEvent);
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: CompletionEvent) {}
}

/// Forwards events into a tokio channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<CompletionEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CompletionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn publish(&self, event: CompletionEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Completion event dropped: receiver closed");
        }
    }
}
