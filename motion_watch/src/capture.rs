// THEORY:
// The `capture` module is the seam to camera drivers. A `DeviceProvider`
// enumerates devices and opens them as `FrameSource`s. Real drivers can block
// indefinitely inside a read, so `TimedSource` moves the driver onto its own
// thread and bounds every read by a timeout.

use crate::core_modules::frame::{DeviceInfo, Frame};
use crate::error::{Result, WatchError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

/// One open camera.
pub trait FrameSource: Send {
    /// Blocks for the next frame.
    fn read(&mut self) -> Result<Frame>;
    fn is_open(&self) -> bool;
    /// Releases the device. Must be idempotent.
    fn release(&mut self);
}

pub trait DeviceProvider: Send {
    /// Devices currently discoverable, in a stable order.
    fn discover(&mut self) -> Vec<DeviceInfo>;
    /// Opens `device`. Reads on the returned source fail after `read_timeout`.
    fn open(&mut self, device: &DeviceInfo, read_timeout: Duration) -> Result<Box<dyn FrameSource>>;
}

enum Command {
    Read,
    Release,
}

/// Runs a blocking [`FrameSource`] on a dedicated thread and bounds each read.
///
/// Once a read times out the driver thread is considered stalled: the source
/// reports closed and every later read fails without touching the driver.
pub struct TimedSource {
    label: String,
    timeout: Duration,
    commands: mpsc::Sender<Command>,
    frames: mpsc::Receiver<Result<Frame>>,
    open: Arc<AtomicBool>,
    stalled: bool,
    released: bool,
}

impl TimedSource {
    pub fn spawn(label: impl Into<String>, mut inner: Box<dyn FrameSource>, timeout: Duration) -> Result<Self> {
        let label = label.into();
        let (commands, command_rx) = mpsc::channel::<Command>();
        let (frame_tx, frames) = mpsc::channel::<Result<Frame>>();
        let open = Arc::new(AtomicBool::new(inner.is_open()));
        let worker_open = Arc::clone(&open);

        thread::Builder::new()
            .name(format!("capture-{label}"))
            .spawn(move || {
                while let Ok(command) = command_rx.recv() {
                    match command {
                        Command::Read => {
                            let result = inner.read();
                            worker_open.store(inner.is_open(), Ordering::Release);
                            if frame_tx.send(result).is_err() {
                                break;
                            }
                        }
                        Command::Release => break,
                    }
                }
                inner.release();
                worker_open.store(false, Ordering::Release);
            })?;

        Ok(Self {
            label,
            timeout,
            commands,
            frames,
            open,
            stalled: false,
            released: false,
        })
    }
}

impl FrameSource for TimedSource {
    fn read(&mut self) -> Result<Frame> {
        if self.stalled || self.released {
            return Err(WatchError::SourceDisconnected(format!(
                "{} is no longer readable",
                self.label
            )));
        }
        self.commands
            .send(Command::Read)
            .map_err(|_| WatchError::SourceDisconnected(format!("{} capture thread exited", self.label)))?;

        match self.frames.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(source = %self.label, timeout = ?self.timeout, "read timed out");
                self.stalled = true;
                Err(WatchError::SourceTimeout(self.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(WatchError::SourceDisconnected(format!(
                "{} capture thread exited",
                self.label
            ))),
        }
    }

    fn is_open(&self) -> bool {
        !self.stalled && !self.released && self.open.load(Ordering::Acquire)
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        // A stalled driver thread gets the message once its read returns.
        let _ = self.commands.send(Command::Release);
    }
}

impl Drop for TimedSource {
    fn drop(&mut self) {
        self.release();
    }
}
