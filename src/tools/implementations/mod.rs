//! Built-in providers

pub mod filesystem;
pub mod process;

pub use filesystem::{EditFileProvider, ReadFileProvider, SearchFilesProvider, WriteFileProvider};
pub use process::{BashProvider, ProcessProvider};
