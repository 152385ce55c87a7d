// THEORY:
// Lifecycle events (camera connected/disconnected, recording started/stopped)
// are written as `[YYYY-MM-DD HH:MM:SS] message` lines to a persistent text
// file and mirrored to the console through `tracing` under the `event_log`
// target. Appending never fails from the caller's point of view: a broken log
// file is reported through `tracing` and the pipeline carries on.

use crate::error::{Result, WatchError};
use chrono::{DateTime, Local};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

pub const EVENT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub trait EventSink: Send + Sync {
    fn append(&self, message: &str);
}

pub fn format_event(now: DateTime<Local>, message: &str) -> String {
    format!("[{}] {}", now.format(EVENT_TIMESTAMP_FORMAT), message)
}

/// Event log backed by a text file opened in append mode.
#[derive(Debug)]
pub struct FileEventLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileEventLog {
    /// Opens (or creates) the log file, creating parent directories as needed.
    /// Existing content is preserved.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| WatchError::EventLog {
                path: path.clone(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| WatchError::EventLog {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for FileEventLog {
    fn append(&self, message: &str) {
        let line = format_event(Local::now(), message);
        tracing::info!(target: "event_log", "{line}");

        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = writeln!(file, "{line}").and_then(|()| file.flush()) {
            tracing::error!(path = %self.path.display(), error = %err, "failed to append event");
        }
    }
}

/// In-memory event log, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    lines: Mutex<Vec<String>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full lines, timestamps included.
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Messages with the `[timestamp] ` prefix stripped.
    pub fn messages(&self) -> Vec<String> {
        self.lines()
            .into_iter()
            .map(|line| match line.split_once("] ") {
                Some((_, message)) => message.to_string(),
                None => line,
            })
            .collect()
    }

    pub fn count_containing(&self, needle: &str) -> usize {
        self.messages().iter().filter(|m| m.contains(needle)).count()
    }
}

impl EventSink for MemoryEventLog {
    fn append(&self, message: &str) {
        let line = format_event(Local::now(), message);
        tracing::debug!(target: "event_log", "{line}");
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
    }
}
