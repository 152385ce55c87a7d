// THEORY:
// The parallel driver gives every camera its own blocking worker so that one
// slow or hung device cannot stall the others. The moving parts:
//
// 1.  **Workers**: each attached `CameraSource` is moved into a
//     `spawn_blocking` task that runs the same `process` pipeline as the
//     cooperative loop on its own cadence and publishes the result into a
//     `watch` channel. `watch` is most-recent-wins: a slow reader only ever
//     sees the newest frame and nothing queues up. A worker that fails a read
//     publishes `Disconnected` and exits, handing its source back.
// 2.  **Reconcile task**: the `WorkerPool` lives in a single task that owns it
//     exclusively. On its own, slower interval it joins finished workers,
//     detaches them (closing their clip before the "disconnected" event),
//     attaches new devices and republishes the set of slot subscriptions.
// 3.  **Compose loop**: a single blocking thread that, every `tick_interval`,
//     snapshots every subscription, renders a "NO DATA" tile for slots without
//     a live frame, composes the grid and feeds the combined recorder and the
//     display. Keeping the display on one thread matters for HighGUI.
//
// The worker's own reads serve as its liveness probe, so reconcile never reads
// from a camera it does not own.

use crate::capture::DeviceProvider;
use crate::config::WatchConfig;
use crate::core_modules::camera_pool::{ReconcileGate, ReconcileReport, attach_devices};
use crate::core_modules::camera_source::{CameraSource, SourceSettings};
use crate::core_modules::compositor::FrameCompositor;
use crate::core_modules::event_log::EventSink;
use crate::core_modules::frame::{self, DeviceId, DeviceInfo, Frame, FrameSize};
use crate::core_modules::recording_controller::RecordingController;
use crate::error::Result;
use crate::pipeline::{DisplayControl, FrameDisplay, RunSummary, combined_recorder};
use crate::sink::SinkFactory;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Attached, no frame published yet.
    Starting,
    Live,
    Disconnected,
}

/// Latest output of one worker.
#[derive(Debug, Clone)]
pub struct SlotFrame {
    pub slot: usize,
    pub state: SlotState,
    pub frame: Option<Frame>,
    pub motion: bool,
    pub frames: u64,
    pub recording: bool,
}

impl SlotFrame {
    fn starting(slot: usize) -> Self {
        Self {
            slot,
            state: SlotState::Starting,
            frame: None,
            motion: false,
            frames: 0,
            recording: false,
        }
    }
}

/// A read handle on one worker's slot.
#[derive(Debug, Clone)]
pub struct SlotSubscription {
    pub slot: usize,
    pub device: DeviceId,
    pub receiver: watch::Receiver<SlotFrame>,
}

struct Worker {
    device: DeviceId,
    name: String,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<CameraSource>,
    receiver: watch::Receiver<SlotFrame>,
}

impl Worker {
    fn spawn(camera: CameraSource, cadence: Duration) -> Self {
        let slot = camera.slot();
        let device = camera.device_id().clone();
        let name = camera.name().to_string();
        let stop = Arc::new(AtomicBool::new(false));
        let (sender, receiver) = watch::channel(SlotFrame::starting(slot));

        let worker_stop = Arc::clone(&stop);
        let handle = tokio::task::spawn_blocking(move || run_worker(camera, sender, worker_stop, cadence));

        Self {
            device,
            name,
            stop,
            handle,
            receiver,
        }
    }

    fn is_done(&self) -> bool {
        self.handle.is_finished() || self.receiver.borrow().state == SlotState::Disconnected
    }
}

fn run_worker(
    mut camera: CameraSource,
    sender: watch::Sender<SlotFrame>,
    stop: Arc<AtomicBool>,
    cadence: Duration,
) -> CameraSource {
    let slot = camera.slot();
    tracing::debug!(slot, device = %camera.device_id(), "worker started");
    let mut next = Instant::now();

    while !stop.load(Ordering::Acquire) {
        match camera.process() {
            Some(output) => {
                sender.send_replace(SlotFrame {
                    slot,
                    state: SlotState::Live,
                    frame: Some(output.frame),
                    motion: output.motion,
                    frames: camera.frame_count(),
                    recording: camera.is_recording(),
                });
            }
            None => {
                sender.send_replace(SlotFrame {
                    state: SlotState::Disconnected,
                    frames: camera.frame_count(),
                    ..SlotFrame::starting(slot)
                });
                break;
            }
        }

        next += cadence;
        let now = Instant::now();
        match next.checked_duration_since(now) {
            Some(wait) => std::thread::sleep(wait),
            None => next = now,
        }
    }

    tracing::debug!(slot, frames = camera.frame_count(), "worker stopped");
    camera
}

/// One blocking worker per attached camera, reconciled like `CameraPool`.
pub struct WorkerPool {
    provider: Box<dyn DeviceProvider>,
    settings: SourceSettings,
    max_size: usize,
    read_timeout: Duration,
    cadence: Duration,
    gate: ReconcileGate,
    workers: BTreeMap<usize, Worker>,
}

impl WorkerPool {
    pub fn new(
        provider: Box<dyn DeviceProvider>,
        settings: SourceSettings,
        max_size: usize,
        reconcile_interval: Duration,
        read_timeout: Duration,
        cadence: Duration,
    ) -> Self {
        Self {
            provider,
            settings,
            max_size,
            read_timeout,
            cadence,
            gate: ReconcileGate::new(reconcile_interval),
            workers: BTreeMap::new(),
        }
    }

    pub fn from_config(config: &WatchConfig, provider: Box<dyn DeviceProvider>, settings: SourceSettings) -> Self {
        Self::new(
            provider,
            settings,
            config.max_pool_size,
            config.reconcile_interval(),
            config.read_timeout(),
            config.tick_interval(),
        )
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.workers.values().map(|w| w.device.clone()).collect()
    }

    pub fn subscriptions(&self) -> Vec<SlotSubscription> {
        self.workers
            .iter()
            .map(|(slot, worker)| SlotSubscription {
                slot: *slot,
                device: worker.device.clone(),
                receiver: worker.receiver.clone(),
            })
            .collect()
    }

    pub async fn reconcile(&mut self, now: Instant) -> ReconcileReport {
        if !self.gate.is_due(now) {
            return ReconcileReport::default();
        }
        self.force_reconcile(now).await
    }

    pub async fn force_reconcile(&mut self, now: Instant) -> ReconcileReport {
        self.gate.mark(now);
        let devices = self.provider.discover();
        self.reconcile_devices(&devices).await
    }

    pub async fn reconcile_devices(&mut self, devices: &[DeviceInfo]) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let dead: Vec<usize> = self
            .workers
            .iter()
            .filter(|(_, worker)| worker.is_done() || !devices.iter().any(|d| d.id == worker.device))
            .map(|(slot, _)| *slot)
            .collect();
        for slot in dead {
            if let Some(worker) = self.workers.remove(&slot) {
                report.detached.insert(worker.device.clone());
                worker.stop.store(true, Ordering::Release);
                match worker.handle.await {
                    Ok(camera) => {
                        tracing::info!(slot, device = %worker.device, "camera detached");
                        camera.detach();
                    }
                    Err(err) => {
                        tracing::error!(slot, device = %worker.device, error = %err, "camera worker panicked");
                        self.settings.events.append(&format!(
                            "Camera '{}' disconnected or no frames.",
                            worker.name
                        ));
                    }
                }
            }
        }

        let mut occupied: BTreeMap<usize, DeviceId> = self
            .workers
            .iter()
            .map(|(slot, worker)| (*slot, worker.device.clone()))
            .collect();
        let attached = attach_devices(
            self.provider.as_mut(),
            &self.settings,
            self.read_timeout,
            devices,
            &mut occupied,
            self.max_size,
        );
        for camera in attached {
            report.attached.insert(camera.device_id().clone());
            self.workers.insert(camera.slot(), Worker::spawn(camera, self.cadence));
        }
        report
    }

    /// Stops every worker, finalises every clip, then releases every device.
    pub async fn shutdown(&mut self) {
        let workers = std::mem::take(&mut self.workers);
        for worker in workers.values() {
            worker.stop.store(true, Ordering::Release);
        }
        let joined = join_all(workers.into_values().map(|worker| worker.handle)).await;

        let mut cameras: Vec<CameraSource> = joined
            .into_iter()
            .filter_map(|result| match result {
                Ok(camera) => Some(camera),
                Err(err) => {
                    tracing::error!(error = %err, "camera worker panicked");
                    None
                }
            })
            .collect();
        for camera in &mut cameras {
            camera.close_recording();
        }
        for camera in cameras {
            camera.shutdown();
        }
    }
}

/// Worker-per-camera monitor: a reconcile task plus a compose loop.
pub struct ParallelMonitor {
    tick_interval: Duration,
    reconcile_interval: Duration,
    frame_size: FrameSize,
    pool: WorkerPool,
    compositor: FrameCompositor,
    combined: Option<RecordingController>,
    display: Option<Box<dyn FrameDisplay>>,
}

impl ParallelMonitor {
    pub fn new(
        config: &WatchConfig,
        pool: WorkerPool,
        sinks: Arc<dyn SinkFactory>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            reconcile_interval: config.reconcile_interval(),
            frame_size: config.frame_size(),
            pool,
            compositor: FrameCompositor::new(config.frame_size()),
            combined: combined_recorder(config, &sinks, &events),
            display: None,
        }
    }

    pub fn from_config(
        config: &WatchConfig,
        provider: Box<dyn DeviceProvider>,
        sinks: Arc<dyn SinkFactory>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let settings = SourceSettings::from_config(config, Arc::clone(&sinks), Arc::clone(&events));
        Self::with_settings(config, provider, settings)
    }

    pub fn with_settings(
        config: &WatchConfig,
        provider: Box<dyn DeviceProvider>,
        settings: SourceSettings,
    ) -> Result<Self> {
        config.validate()?;
        let sinks = Arc::clone(&settings.sinks);
        let events = Arc::clone(&settings.events);
        let pool = WorkerPool::from_config(config, provider, settings);
        Ok(Self::new(config, pool, sinks, events))
    }

    pub fn with_display(mut self, display: Box<dyn FrameDisplay>) -> Self {
        self.display = Some(display);
        self
    }

    /// Runs until `shutdown` resolves or the display asks to stop. Every clip
    /// is finalised before this returns.
    pub async fn run<F>(self, shutdown: F) -> RunSummary
    where
        F: Future<Output = ()>,
    {
        let Self {
            tick_interval,
            reconcile_interval,
            frame_size,
            mut pool,
            compositor,
            combined,
            display,
        } = self;

        pool.force_reconcile(Instant::now()).await;
        tracing::info!(active = pool.len(), "worker monitoring started");

        let (subs_tx, subs_rx) = watch::channel(pool.subscriptions());
        let (stop_tx, stop_rx) = watch::channel(false);
        let reconciler = tokio::spawn(reconcile_task(pool, reconcile_interval, subs_tx, stop_rx));

        let presenter = Presenter {
            tick_interval,
            frame_size,
            compositor,
            combined,
            display,
            subscriptions: subs_rx,
        };
        let stop = Arc::new(AtomicBool::new(false));
        let presenter_stop = Arc::clone(&stop);
        let handle = tokio::task::spawn_blocking(move || presenter.run(&presenter_stop));
        tokio::pin!(shutdown);
        tokio::pin!(handle);

        let joined = tokio::select! {
            joined = &mut handle => joined,
            _ = &mut shutdown => {
                stop.store(true, Ordering::Release);
                (&mut handle).await
            }
        };
        let summary = joined.unwrap_or_else(|err| {
            tracing::error!(error = %err, "compose thread failed");
            RunSummary::default()
        });

        let _ = stop_tx.send(true);
        if let Err(err) = reconciler.await {
            tracing::error!(error = %err, "reconcile task failed");
        }
        tracing::info!(ticks = summary.ticks, "worker monitoring stopped");
        summary
    }
}

/// Composes, records and displays on one OS thread. GUI toolkits expect the
/// window to be created, drawn and polled from the same thread.
struct Presenter {
    tick_interval: Duration,
    frame_size: FrameSize,
    compositor: FrameCompositor,
    combined: Option<RecordingController>,
    display: Option<Box<dyn FrameDisplay>>,
    subscriptions: watch::Receiver<Vec<SlotSubscription>>,
}

impl Presenter {
    /// Consumes the presenter so the display is also dropped on this thread.
    fn run(mut self, stop: &AtomicBool) -> RunSummary {
        let mut summary = RunSummary::default();
        let no_data = frame::placeholder_frame(self.frame_size, "NO DATA");

        while !stop.load(Ordering::Acquire) {
            let started = Instant::now();
            summary.ticks += 1;

            let snapshots: Vec<SlotFrame> = self
                .subscriptions
                .borrow()
                .iter()
                .map(|sub| sub.receiver.borrow().clone())
                .collect();
            let tiles: Vec<&Frame> = snapshots
                .iter()
                .map(|snapshot| match (&snapshot.state, &snapshot.frame) {
                    (SlotState::Live, Some(frame)) => frame,
                    _ => &no_data,
                })
                .collect();
            let composite = self.compositor.compose(&tiles);

            if let Some(recorder) = self.combined.as_mut() {
                let motion = snapshots
                    .iter()
                    .any(|s| s.state == SlotState::Live && s.motion);
                recorder.update(motion, &composite.image);
            }
            if let Some(display) = self.display.as_mut() {
                if display.show(&composite) == DisplayControl::Stop {
                    summary.stopped_by_display = true;
                    break;
                }
            }

            if let Some(rest) = self.tick_interval.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
        }

        if let Some(recorder) = self.combined.as_mut() {
            recorder.shutdown();
        }
        summary
    }
}

async fn reconcile_task(
    mut pool: WorkerPool,
    interval: Duration,
    subscriptions: watch::Sender<Vec<SlotSubscription>>,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; startup already reconciled.
    ticker.tick().await;

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let report = pool.reconcile(Instant::now()).await;
                if !report.is_empty() {
                    subscriptions.send_replace(pool.subscriptions());
                }
            }
        }
    }

    pool.shutdown().await;
}
