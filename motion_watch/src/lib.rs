// THEORY:
// This file is the entry point of the `motion_watch` library crate: a
// multi-camera engine that watches every attached camera for motion and records
// debounced clips when it sees some.
//
// The engine is layered leaf-first:
// - `core_modules` holds the per-camera pieces (background model, blob
//   detector, motion classifier, recording controller), the camera pool that
//   manages their lifecycle, the compositor and the event log.
// - `capture` and `sink` are the seams to camera drivers and video encoders;
//   `synthetic` is a scriptable stand-in for real cameras.
// - `pipeline` (one cooperative loop) and `parallel_pipeline` (one worker per
//   camera) are the two drivers. Both run the same per-camera pipeline.
//
// Consumers normally only need a `WatchConfig`, a `DeviceProvider`, a
// `SinkFactory`, an `EventSink`, and one of the two drivers.

pub mod capture;
pub mod config;
pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;
pub mod sink;
pub mod synthetic;

pub use capture::{DeviceProvider, FrameSource, TimedSource};
pub use config::{RecordingMode, SchedulingMode, WatchConfig};
pub use core_modules::camera_pool::{CameraPool, ReconcileReport};
pub use core_modules::camera_source::{CameraSource, SourceSettings, SubtractorFactory};
pub use core_modules::compositor::{CompositeFrame, FrameCompositor};
pub use core_modules::event_log::{EventSink, FileEventLog, MemoryEventLog};
pub use core_modules::frame::{DeviceId, DeviceInfo, Frame, FrameSize};
pub use core_modules::motion_classifier::{ClassifierConfig, MotionClassifier};
pub use core_modules::recording_controller::{RecorderSettings, RecordingController, RecordingState};
pub use error::{Result, WatchError};
pub use parallel_pipeline::{ParallelMonitor, WorkerPool};
pub use pipeline::{DisplayControl, FrameDisplay, MonitorLoop, RunSummary, TickReport};
pub use sink::{MemorySinkFactory, MjpegSinkFactory, SinkFactory, SinkSpec, VideoSink};
