//! Process supervision: sessions, capped output, completion events

pub mod buffer;
pub mod events;
pub mod pty;
pub mod session;
pub mod supervisor;

pub use buffer::OutputBuffer;
pub use events::{ChannelSink, CompletionEvent, EventSink, NullSink};
pub use pty::TerminalSize;
pub use session::{SessionSnapshot, SessionStatus};
pub use supervisor::{ProcessSupervisor, ShellKind, StartRequest};
