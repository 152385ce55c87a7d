// THEORY:
// The `RecordingController` turns a per-tick motion signal into clip sessions.
// It is a two-state machine (`Idle`, `Recording`) with a debounce countdown:
//
// 1.  **Start**: the first motion tick while `Idle` opens a sink under a fresh
//     timestamped filename. If the sink cannot be opened the controller stays
//     `Idle` and the next motion tick simply tries again.
// 2.  **Hold**: every motion tick resets the countdown to `delay`; every quiet
//     tick decrements it. Each frame seen while `Recording` is written, so a clip
//     carries the motion plus up to `delay - 1` trailing quiet frames.
// 3.  **Stop**: the quiet tick that brings the countdown to zero finalises the
//     sink and is not written itself.
//
// Failures never escape `update`. A write error ends the session on the spot and
// a frame of a different size (the combined grid changed shape) rotates into a
// new session, because a container cannot change resolution mid-stream.

use crate::core_modules::event_log::EventSink;
use crate::core_modules::frame::{Frame, FrameSize};
use crate::sink::{SinkFactory, SinkSpec, VideoSink};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const CLIP_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Sink parameters and debounce length shared by every controller of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RecorderSettings {
    pub output_dir: PathBuf,
    pub codec: String,
    pub fps: f64,
    /// Quiet ticks a session survives after the last motion tick.
    pub delay: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Idle,
    Recording,
}

/// One open clip.
pub struct RecordingSession {
    pub path: PathBuf,
    pub created_at: DateTime<Local>,
    pub frame_size: FrameSize,
    pub frames_written: u64,
    sink: Box<dyn VideoSink>,
}

/// What a single `update` did to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingTransition {
    None,
    Started(PathBuf),
    Stopped(PathBuf),
    /// The frame size changed; `closed` was finalised and `opened` replaced it
    /// unless the new sink failed to open.
    Rotated {
        closed: PathBuf,
        opened: Option<PathBuf>,
    },
    StartFailed,
    WriteFailed(PathBuf),
}

pub struct RecordingController {
    /// Event-log subject, e.g. `Camera 'Cam1'` or `Combined grid`.
    subject: String,
    /// Filename suffix such as `cam1`; `None` for the combined recorder.
    file_tag: Option<String>,
    settings: RecorderSettings,
    sinks: Arc<dyn SinkFactory>,
    events: Arc<dyn EventSink>,
    session: Option<RecordingSession>,
    timer: u32,
    // Suffix bookkeeping for several clips started within the same second.
    last_stem: Option<String>,
    next_suffix: u32,
}

impl RecordingController {
    pub fn new(
        subject: impl Into<String>,
        file_tag: Option<String>,
        settings: RecorderSettings,
        sinks: Arc<dyn SinkFactory>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            subject: subject.into(),
            file_tag,
            settings,
            sinks,
            events,
            session: None,
            timer: 0,
            last_stem: None,
            next_suffix: 0,
        }
    }

    /// Controller for one camera, writing `motion_<stamp>_cam<slot+1>` clips.
    pub fn for_source(
        slot: usize,
        name: &str,
        settings: RecorderSettings,
        sinks: Arc<dyn SinkFactory>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self::new(
            format!("Camera '{name}'"),
            Some(format!("cam{}", slot + 1)),
            settings,
            sinks,
            events,
        )
    }

    /// Controller for the composite grid, writing `motion_<stamp>` clips.
    pub fn combined(
        settings: RecorderSettings,
        sinks: Arc<dyn SinkFactory>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self::new("Combined grid", None, settings, sinks, events)
    }

    pub fn state(&self) -> RecordingState {
        if self.session.is_some() {
            RecordingState::Recording
        } else {
            RecordingState::Idle
        }
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    /// Remaining quiet ticks before the session closes.
    pub fn timer(&self) -> u32 {
        self.timer
    }

    pub fn session(&self) -> Option<&RecordingSession> {
        self.session.as_ref()
    }

    pub fn settings(&self) -> &RecorderSettings {
        &self.settings
    }

    /// Advances the state machine by one tick.
    pub fn update(&mut self, motion: bool, frame: &Frame) -> RecordingTransition {
        let mut transition = RecordingTransition::None;

        if motion {
            self.timer = self.settings.delay;
            if self.session.is_none() {
                match self.start(frame) {
                    Some(path) => transition = RecordingTransition::Started(path),
                    None => return RecordingTransition::StartFailed,
                }
            }
        } else {
            if self.session.is_none() {
                return RecordingTransition::None;
            }
            self.timer = self.timer.saturating_sub(1);
            if self.timer == 0 {
                return match self.stop() {
                    Some(path) => RecordingTransition::Stopped(path),
                    None => RecordingTransition::None,
                };
            }
        }

        let size = FrameSize::of(frame);
        let mismatched = self
            .session
            .as_ref()
            .is_some_and(|session| session.frame_size != size);
        if mismatched {
            tracing::info!(subject = %self.subject, %size, "frame size changed, rotating clip");
            let timer = self.timer;
            let closed = self.stop();
            self.timer = timer;
            let opened = self.start(frame);
            let rotated = opened.is_some();
            if let Some(closed) = closed {
                transition = RecordingTransition::Rotated { closed, opened };
            }
            if !rotated {
                return transition;
            }
        }

        if let Some(path) = self.write(frame) {
            return RecordingTransition::WriteFailed(path);
        }
        transition
    }

    /// Finalises any open session. Safe to call repeatedly.
    pub fn shutdown(&mut self) -> Option<PathBuf> {
        self.stop()
    }

    fn start(&mut self, frame: &Frame) -> Option<PathBuf> {
        let path = self.next_path(Local::now());
        let spec = SinkSpec {
            codec: self.settings.codec.clone(),
            fps: self.settings.fps,
            frame_size: FrameSize::of(frame),
        };

        match self.sinks.open(&path, &spec) {
            Ok(sink) => {
                self.events.append(&format!(
                    "[+] {} start recording: {}",
                    self.subject,
                    path.display()
                ));
                self.session = Some(RecordingSession {
                    path: path.clone(),
                    created_at: Local::now(),
                    frame_size: spec.frame_size,
                    frames_written: 0,
                    sink,
                });
                Some(path)
            }
            Err(err) => {
                tracing::warn!(subject = %self.subject, error = %err, "could not open video sink");
                self.events
                    .append(&format!("[!] {} failed to start recording: {err}", self.subject));
                self.timer = 0;
                None
            }
        }
    }

    /// Writes `frame` to the open session. Returns the session path if the
    /// write failed and the session was dropped.
    fn write(&mut self, frame: &Frame) -> Option<PathBuf> {
        let session = self.session.as_mut()?;
        match session.sink.write(frame) {
            Ok(()) => {
                session.frames_written += 1;
                None
            }
            Err(err) => {
                tracing::error!(subject = %self.subject, error = %err, "video sink write failed");
                self.events
                    .append(&format!("[!] {} recording write failed: {err}", self.subject));
                self.stop()
            }
        }
    }

    fn stop(&mut self) -> Option<PathBuf> {
        let session = self.session.take()?;
        self.timer = 0;
        let RecordingSession {
            path,
            frames_written,
            sink,
            ..
        } = session;
        if let Err(err) = sink.close() {
            tracing::warn!(subject = %self.subject, path = %path.display(), error = %err, "failed to finalise clip");
        }
        tracing::debug!(subject = %self.subject, path = %path.display(), frames_written, "clip closed");
        self.events
            .append(&format!("[-] {} stop recording.", self.subject));
        Some(path)
    }

    /// A clip path that does not exist yet and was not handed out earlier in
    /// the same second.
    fn next_path(&mut self, now: DateTime<Local>) -> PathBuf {
        let stamp = now.format(CLIP_TIMESTAMP_FORMAT);
        let stem = match &self.file_tag {
            Some(tag) => format!("motion_{stamp}_{tag}"),
            None => format!("motion_{stamp}"),
        };
        let mut suffix = if self.last_stem.as_deref() == Some(stem.as_str()) {
            self.next_suffix
        } else {
            0
        };

        let mut candidate = clip_path(&self.settings.output_dir, &stem, suffix, self.sinks.extension());
        while candidate.exists() {
            suffix += 1;
            candidate = clip_path(&self.settings.output_dir, &stem, suffix, self.sinks.extension());
        }
        self.last_stem = Some(stem);
        self.next_suffix = suffix + 1;
        candidate
    }
}

fn clip_path(dir: &Path, stem: &str, suffix: u32, extension: &str) -> PathBuf {
    if suffix == 0 {
        dir.join(format!("{stem}.{extension}"))
    } else {
        dir.join(format!("{stem}-{suffix}.{extension}"))
    }
}
