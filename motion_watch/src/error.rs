// THEORY:
// One error taxonomy is shared by every stage of the engine. Source and sink
// errors are recoverable: they are logged and confined to the camera (or
// recording session) that produced them. Configuration, event-log and I/O
// errors surface at startup and are fatal to the caller.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WatchError {
    /// The device could not be opened or failed its liveness probe.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    /// A previously live device stopped delivering frames.
    #[error("source disconnected: {0}")]
    SourceDisconnected(String),
    /// A read did not complete within the configured budget.
    #[error("source read timed out after {0:?}")]
    SourceTimeout(Duration),
    #[error("failed to open video sink {path}: {reason}")]
    SinkOpen { path: PathBuf, reason: String },
    #[error("failed to write video sink {path}: {reason}")]
    SinkWrite { path: PathBuf, reason: String },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("event log {path} unusable: {source}")]
    EventLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WatchError {
    /// True for failures that should take a camera out of the pool.
    pub fn is_source_failure(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable(_) | Self::SourceDisconnected(_) | Self::SourceTimeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, WatchError>;
