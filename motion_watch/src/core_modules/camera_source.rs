// THEORY:
// A `CameraSource` is one attached camera and everything that belongs to it
// alone: the capture handle, the background model (inside its classifier) and,
// in per-source mode, its recording controller. Nothing is shared between
// sources, so one camera's failure cannot disturb another's state.
//
// `process` is the per-tick pipeline for that camera: read, normalise, classify,
// annotate, record. A failed read does not tear anything down on the spot; it
// only marks the source unavailable and the pool detaches it at the next
// reconcile, which is where the "stop recording" and "disconnected" events are
// emitted in that order.

use crate::capture::FrameSource;
use crate::config::{RecordingMode, WatchConfig};
use crate::core_modules::background_model::{BackgroundSubtractor, RunningGaussian};
use crate::core_modules::event_log::EventSink;
use crate::core_modules::frame::{self, DeviceId, DeviceInfo, Frame, FrameSize};
use crate::core_modules::motion_classifier::{ClassifierConfig, MotionClassifier};
use crate::core_modules::overlay::{self, TextStyle};
use crate::core_modules::recording_controller::{RecorderSettings, RecordingController};
use crate::sink::SinkFactory;
use image::Rgb;
use std::sync::Arc;

/// Builds a fresh background model for each newly attached camera.
pub type SubtractorFactory = Arc<dyn Fn() -> Box<dyn BackgroundSubtractor> + Send + Sync>;

const MOTION_BORDER: Rgb<u8> = Rgb([255, 0, 0]);
const MOTION_BORDER_THICKNESS: u32 = 2;
const LABEL_MARGIN: i64 = 6;

fn default_subtractor() -> Box<dyn BackgroundSubtractor> {
    Box::new(RunningGaussian::default())
}

/// Everything needed to turn an opened device into a `CameraSource`.
#[derive(Clone)]
pub struct SourceSettings {
    pub frame_size: FrameSize,
    pub classifier: ClassifierConfig,
    /// `None` when clips are recorded from the composite instead.
    pub recording: Option<RecorderSettings>,
    pub annotate: bool,
    pub subtractor: SubtractorFactory,
    pub sinks: Arc<dyn SinkFactory>,
    pub events: Arc<dyn EventSink>,
}

impl SourceSettings {
    pub fn from_config(
        config: &WatchConfig,
        sinks: Arc<dyn SinkFactory>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let recording = match config.recording_mode {
            RecordingMode::PerSource => Some(config.recorder_settings()),
            RecordingMode::Combined => None,
        };
        Self {
            frame_size: config.frame_size(),
            classifier: config.classifier_config(),
            recording,
            annotate: config.annotate,
            subtractor: Arc::new(default_subtractor),
            sinks,
            events,
        }
    }

    pub fn with_subtractor(mut self, subtractor: SubtractorFactory) -> Self {
        self.subtractor = subtractor;
        self
    }

    pub fn build(&self, slot: usize, device: DeviceInfo, source: Box<dyn FrameSource>) -> CameraSource {
        let name = device.display_name();
        let recorder = self.recording.clone().map(|settings| {
            RecordingController::for_source(
                slot,
                &name,
                settings,
                Arc::clone(&self.sinks),
                Arc::clone(&self.events),
            )
        });
        CameraSource {
            slot,
            device,
            name,
            source,
            classifier: MotionClassifier::new(self.classifier, (self.subtractor)()),
            recorder,
            frame_size: self.frame_size,
            annotate: self.annotate,
            available: true,
            released: false,
            events: Arc::clone(&self.events),
        }
    }
}

/// The output of one `process` call.
#[derive(Debug, Clone)]
pub struct SourceFrame {
    pub slot: usize,
    pub frame: Frame,
    pub motion: bool,
}

pub struct CameraSource {
    slot: usize,
    device: DeviceInfo,
    name: String,
    source: Box<dyn FrameSource>,
    classifier: MotionClassifier,
    recorder: Option<RecordingController>,
    frame_size: FrameSize,
    annotate: bool,
    available: bool,
    released: bool,
    events: Arc<dyn EventSink>,
}

impl CameraSource {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// False once a read has failed; the pool detaches the source at its next reconcile.
    pub fn is_available(&self) -> bool {
        self.available && !self.released
    }

    pub fn frame_count(&self) -> u64 {
        self.classifier.frame_count()
    }

    pub fn is_recording(&self) -> bool {
        self.recorder
            .as_ref()
            .is_some_and(RecordingController::is_recording)
    }

    pub fn recorder(&self) -> Option<&RecordingController> {
        self.recorder.as_ref()
    }

    /// Reads and handles one frame. `None` means the source is (now) unavailable.
    pub fn process(&mut self) -> Option<SourceFrame> {
        if !self.is_available() {
            return None;
        }
        let raw = match self.source.read() {
            Ok(raw) => raw,
            Err(err) => {
                if err.is_source_failure() {
                    tracing::warn!(slot = self.slot, device = %self.device.id, error = %err, "camera read failed");
                } else {
                    tracing::error!(slot = self.slot, device = %self.device.id, error = %err, "unexpected camera error");
                }
                self.available = false;
                return None;
            }
        };

        let mut frame = frame::fit_to(raw, self.frame_size);
        let motion = self.classifier.classify(&frame);
        if self.annotate {
            annotate(&mut frame, self.slot, motion);
        }
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.update(motion, &frame);
        }

        Some(SourceFrame {
            slot: self.slot,
            frame,
            motion,
        })
    }

    /// Liveness check used by reconcile. The probe frame is discarded and never
    /// reaches the background model.
    pub fn probe(&mut self) -> bool {
        if !self.is_available() || !self.source.is_open() {
            return false;
        }
        match self.source.read() {
            Ok(_) => true,
            Err(err) => {
                tracing::debug!(slot = self.slot, device = %self.device.id, error = %err, "liveness probe failed");
                self.available = false;
                false
            }
        }
    }

    /// Finalises the open clip, if any.
    pub fn close_recording(&mut self) {
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.shutdown();
        }
    }

    pub fn release(&mut self) {
        if !self.released {
            self.source.release();
            self.released = true;
        }
    }

    /// Removes the camera after a failure: clip first, then the device, then
    /// the one "disconnected" event.
    pub fn detach(mut self) {
        self.close_recording();
        self.release();
        self.events
            .append(&format!("Camera '{}' disconnected or no frames.", self.name));
    }

    /// Orderly teardown at the end of a run.
    pub fn shutdown(mut self) {
        self.close_recording();
        self.release();
    }
}

/// Red border on motion frames and a `CAM <slot+1>` label at the bottom-left.
pub fn annotate(frame: &mut Frame, slot: usize, motion: bool) {
    if motion {
        overlay::draw_border(frame, MOTION_BORDER, MOTION_BORDER_THICKNESS);
    }
    let style = TextStyle::default();
    let label = format!("CAM {}", slot + 1);
    let (_, text_height) = overlay::text_extent(&label, style.scale);
    let y = i64::from(frame.height()) - i64::from(text_height) - LABEL_MARGIN;
    overlay::draw_text(frame, LABEL_MARGIN, y, &label, &style);
}
