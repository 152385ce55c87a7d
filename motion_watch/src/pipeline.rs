// THEORY:
// The `pipeline` module is the cooperative driver: one loop that owns the camera
// pool outright and walks every camera once per tick. A tick is
//
//     reconcile (gated) -> read/classify/record each camera -> compose
//     -> combined recording (if enabled) -> display
//
// followed by a sleep for whatever is left of `tick_interval`. A camera whose
// read failed keeps its tile as a "NO DATA" placeholder until reconcile
// detaches it, so the grid only changes shape at reconcile time. There is no
// shared state and no locking; a slow camera slows the whole tick, which is
// what the worker driver in `parallel_pipeline` exists to avoid. Read timeouts
// are the capture layer's job, so a hung device costs at most one timeout.

use crate::capture::DeviceProvider;
use crate::config::{RecordingMode, WatchConfig};
use crate::core_modules::camera_pool::{CameraPool, ReconcileReport};
use crate::core_modules::camera_source::SourceSettings;
use crate::core_modules::compositor::{CompositeFrame, FrameCompositor};
use crate::core_modules::event_log::EventSink;
use crate::core_modules::frame::{self, Frame, FrameSize};
use crate::core_modules::recording_controller::RecordingController;
use crate::error::Result;
use crate::sink::SinkFactory;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Whether the display wants the run to continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayControl {
    Continue,
    Stop,
}

/// Consumer of composite frames, e.g. an on-screen window.
pub trait FrameDisplay: Send {
    fn show(&mut self, composite: &CompositeFrame) -> DisplayControl;
}

/// What happened during one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    pub reconcile: ReconcileReport,
    pub active_sources: usize,
    /// Slots whose frame this tick was classified as motion.
    pub motion_slots: Vec<usize>,
    /// Slots with an open per-camera clip after this tick.
    pub recording_slots: Vec<usize>,
    pub combined_recording: bool,
    pub rows: u32,
    pub cols: u32,
    pub padding: u32,
    pub stop_requested: bool,
}

/// Outcome of a full run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub ticks: u64,
    pub stopped_by_display: bool,
}

/// Builds the combined-grid recorder when the configuration asks for one.
pub(crate) fn combined_recorder(
    config: &WatchConfig,
    sinks: &Arc<dyn SinkFactory>,
    events: &Arc<dyn EventSink>,
) -> Option<RecordingController> {
    match config.recording_mode {
        RecordingMode::Combined => Some(RecordingController::combined(
            config.recorder_settings(),
            Arc::clone(sinks),
            Arc::clone(events),
        )),
        RecordingMode::PerSource => None,
    }
}

pub struct MonitorLoop {
    tick_interval: Duration,
    frame_size: FrameSize,
    pool: CameraPool,
    compositor: FrameCompositor,
    combined: Option<RecordingController>,
    display: Option<Box<dyn FrameDisplay>>,
    last_composite: Option<CompositeFrame>,
    ticks: u64,
    started: bool,
}

impl MonitorLoop {
    pub fn new(
        config: &WatchConfig,
        pool: CameraPool,
        sinks: Arc<dyn SinkFactory>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            frame_size: config.frame_size(),
            pool,
            compositor: FrameCompositor::new(config.frame_size()),
            combined: combined_recorder(config, &sinks, &events),
            display: None,
            last_composite: None,
            ticks: 0,
            started: false,
        }
    }

    /// Validates `config` and assembles a loop over `provider` with the
    /// default background model.
    pub fn from_config(
        config: &WatchConfig,
        provider: Box<dyn DeviceProvider>,
        sinks: Arc<dyn SinkFactory>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let settings = SourceSettings::from_config(config, Arc::clone(&sinks), Arc::clone(&events));
        Self::with_settings(config, provider, settings)
    }

    /// Like [`MonitorLoop::from_config`] with caller-supplied source settings.
    pub fn with_settings(
        config: &WatchConfig,
        provider: Box<dyn DeviceProvider>,
        settings: SourceSettings,
    ) -> Result<Self> {
        config.validate()?;
        let sinks = Arc::clone(&settings.sinks);
        let events = Arc::clone(&settings.events);
        let pool = CameraPool::new(
            provider,
            settings,
            config.max_pool_size,
            config.reconcile_interval(),
            config.read_timeout(),
        );
        Ok(Self::new(config, pool, sinks, events))
    }

    pub fn with_display(mut self, display: Box<dyn FrameDisplay>) -> Self {
        self.display = Some(display);
        self
    }

    pub fn pool(&self) -> &CameraPool {
        &self.pool
    }

    pub fn combined_recorder(&self) -> Option<&RecordingController> {
        self.combined.as_ref()
    }

    pub fn last_composite(&self) -> Option<&CompositeFrame> {
        self.last_composite.as_ref()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Initial, ungated reconcile. `tick` calls this itself on first use.
    pub fn start(&mut self, now: Instant) -> ReconcileReport {
        self.started = true;
        let report = self.pool.force_reconcile(now);
        tracing::info!(active = self.pool.len(), max = self.pool.max_size(), "monitoring started");
        report
    }

    pub fn tick(&mut self, now: Instant) -> TickReport {
        let reconcile = if self.started {
            self.pool.reconcile(now)
        } else {
            self.start(now)
        };
        self.ticks += 1;

        let outputs = self.pool.process_all();
        let motion_slots: Vec<usize> = outputs
            .iter()
            .filter(|output| output.motion)
            .map(|output| output.slot)
            .collect();

        let no_data = frame::placeholder_frame(self.frame_size, "NO DATA");
        let frames: Vec<&Frame> = self
            .pool
            .slots()
            .into_iter()
            .map(|slot| {
                outputs
                    .iter()
                    .find(|output| output.slot == slot)
                    .map_or(&no_data, |output| &output.frame)
            })
            .collect();
        let composite = self.compositor.compose(&frames);

        if let Some(recorder) = self.combined.as_mut() {
            recorder.update(!motion_slots.is_empty(), &composite.image);
        }

        let stop_requested = self
            .display
            .as_mut()
            .is_some_and(|display| display.show(&composite) == DisplayControl::Stop);

        let recording_slots = self
            .pool
            .slots()
            .into_iter()
            .filter(|slot| self.pool.source(*slot).is_some_and(|s| s.is_recording()))
            .collect();

        let report = TickReport {
            tick: self.ticks,
            reconcile,
            active_sources: outputs.len(),
            motion_slots,
            recording_slots,
            combined_recording: self.combined.as_ref().is_some_and(RecordingController::is_recording),
            rows: composite.rows,
            cols: composite.cols,
            padding: composite.padding,
            stop_requested,
        };
        self.last_composite = Some(composite);
        report
    }

    /// Ticks until `stop` is raised or the display asks to stop, then shuts down.
    pub fn run(&mut self, stop: &AtomicBool) -> RunSummary {
        let mut summary = RunSummary::default();
        while !stop.load(Ordering::Acquire) {
            let started = Instant::now();
            let report = self.tick(started);
            summary.ticks = report.tick;
            if report.stop_requested {
                summary.stopped_by_display = true;
                break;
            }
            if let Some(rest) = self.tick_interval.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
        }
        self.shutdown();
        summary
    }

    /// Closes every open clip before any device is released.
    pub fn shutdown(&mut self) {
        if let Some(recorder) = self.combined.as_mut() {
            recorder.shutdown();
        }
        self.pool.shutdown();
        tracing::info!(ticks = self.ticks, "monitoring stopped");
    }
}
