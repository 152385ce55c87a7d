// THEORY:
// `motion-watch` is the harness around the `motion_watch` engine. It owns the
// parts the library deliberately leaves out: argument parsing, logging setup,
// the tokio runtime, and the choice of camera, sink and display backends.
//
// Without the `opencv` feature only synthetic cameras are available (useful
// for demos and soak runs) and clips are written as Motion-JPEG. With it, real
// V4L/OpenCV devices are opened, clips go through OpenCV's `VideoWriter` with
// the configured FourCC, and the composite is shown in a HighGUI window.

#[cfg(feature = "opencv")]
mod opencv_backend;

use anyhow::{Context, Result};
use clap::Parser;
use motion_watch::capture::DeviceProvider;
use motion_watch::pipeline::FrameDisplay;
use motion_watch::synthetic::{MotionPattern, SyntheticRig};
use motion_watch::{
    EventSink, FileEventLog, MemoryEventLog, MemorySinkFactory, MjpegSinkFactory, MonitorLoop,
    ParallelMonitor, RecordingMode, RunSummary, SchedulingMode, SinkFactory, SourceSettings,
    WatchConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "motion-watch")]
#[command(about = "Watches every attached camera and records clips when something moves")]
struct Args {
    /// JSON configuration file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for clips and the event log
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Maximum number of cameras watched at once
    #[arg(long)]
    max_cameras: Option<usize>,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    /// Frames used only to train the background model
    #[arg(long)]
    warmup: Option<u64>,

    /// Minimum region area, in pixels, that counts as motion
    #[arg(long)]
    min_area: Option<u32>,

    /// Quiet ticks a recording survives after the last motion
    #[arg(long)]
    delay: Option<u32>,

    #[arg(long)]
    fps: Option<f64>,

    /// Four-character codec code, e.g. XVID or MJPG
    #[arg(long)]
    codec: Option<String>,

    /// Record the composite grid instead of one clip per camera
    #[arg(long)]
    combined: bool,

    /// One worker per camera instead of a single polling loop
    #[arg(long)]
    workers: bool,

    /// Use N synthetic cameras instead of real devices
    #[arg(long, value_name = "N")]
    synthetic: Option<usize>,

    /// Keep clips and events in memory; nothing is written to disk
    #[arg(long)]
    dry_run: bool,

    /// Write Motion-JPEG clips even when OpenCV encoders are available
    #[arg(long)]
    mjpeg: bool,

    /// JPEG quality (1-100) of Motion-JPEG clips
    #[arg(long, value_name = "Q")]
    jpeg_quality: Option<u8>,

    /// Do not open a preview window
    #[arg(long)]
    headless: bool,

    /// Stop after this many seconds (default: run until Ctrl+C)
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Use OpenCV's MOG2 background subtractor (requires the `opencv` feature)
    #[arg(long)]
    mog2: bool,
}

impl Args {
    fn apply(&self, config: &mut WatchConfig) {
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(max) = self.max_cameras {
            config.max_pool_size = max;
        }
        if let Some(width) = self.width {
            config.frame_width = width;
        }
        if let Some(height) = self.height {
            config.frame_height = height;
        }
        if let Some(warmup) = self.warmup {
            config.warmup_frames = warmup;
        }
        if let Some(area) = self.min_area {
            config.min_motion_area = area;
        }
        if let Some(delay) = self.delay {
            config.debounce_delay = delay;
        }
        if let Some(fps) = self.fps {
            config.fps = fps;
        }
        if let Some(codec) = &self.codec {
            config.codec = codec.clone();
        }
        if self.combined {
            config.recording_mode = RecordingMode::Combined;
        }
        if self.workers {
            config.scheduling_mode = SchedulingMode::Workers;
        }
    }
}

fn load_config(args: &Args) -> Result<WatchConfig> {
    let mut config = match &args.config {
        Some(path) => WatchConfig::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => WatchConfig::default(),
    };
    args.apply(&mut config);
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Synthetic cameras with staggered motion bursts so clips actually get cut.
fn synthetic_provider(count: usize, config: &WatchConfig) -> Box<dyn DeviceProvider> {
    let rig = SyntheticRig::with_devices(count, config.frame_size());
    for (n, id) in rig.device_ids().iter().enumerate() {
        let period = config.warmup_frames + 150 + 40 * n as u64;
        rig.set_motion_pattern(id, Some(MotionPattern { period, burst: 30 }));
    }
    Box::new(rig.timed_provider())
}

fn camera_provider(args: &Args, config: &WatchConfig) -> Result<Box<dyn DeviceProvider>> {
    if let Some(count) = args.synthetic {
        return Ok(synthetic_provider(count, config));
    }
    #[cfg(feature = "opencv")]
    {
        Ok(Box::new(opencv_backend::OpenCvProvider::new(config.max_pool_size as u32)))
    }
    #[cfg(not(feature = "opencv"))]
    {
        anyhow::bail!("no camera backend available: rebuild with `--features opencv` or pass `--synthetic N`")
    }
}

fn sink_factory(args: &Args) -> Arc<dyn SinkFactory> {
    if args.dry_run {
        return Arc::new(MemorySinkFactory::new());
    }
    #[cfg(feature = "opencv")]
    if !args.mjpeg {
        return Arc::new(opencv_backend::OpenCvSinkFactory::default());
    }
    #[cfg(not(feature = "opencv"))]
    if !args.mjpeg {
        tracing::debug!("built without `opencv`, writing Motion-JPEG clips");
    }
    match args.jpeg_quality {
        Some(quality) => Arc::new(MjpegSinkFactory::with_quality(quality)),
        None => Arc::new(MjpegSinkFactory::default()),
    }
}

fn event_sink(args: &Args, config: &WatchConfig) -> Result<Arc<dyn EventSink>> {
    if args.dry_run {
        return Ok(Arc::new(MemoryEventLog::new()));
    }
    let log = FileEventLog::open(config.log_path())
        .with_context(|| format!("failed to open event log {}", config.log_path().display()))?;
    Ok(Arc::new(log))
}

fn source_settings(
    args: &Args,
    config: &WatchConfig,
    sinks: Arc<dyn SinkFactory>,
    events: Arc<dyn EventSink>,
) -> Result<SourceSettings> {
    let settings = SourceSettings::from_config(config, sinks, events);
    if !args.mog2 {
        return Ok(settings);
    }
    #[cfg(feature = "opencv")]
    {
        Ok(settings.with_subtractor(Arc::new(opencv_backend::Mog2Subtractor::boxed)))
    }
    #[cfg(not(feature = "opencv"))]
    {
        let _ = settings;
        anyhow::bail!("--mog2 requires the `opencv` feature")
    }
}

fn display(args: &Args) -> Option<Box<dyn FrameDisplay>> {
    if args.headless {
        return None;
    }
    #[cfg(feature = "opencv")]
    {
        Some(Box::new(opencv_backend::HighGuiDisplay::new("Motion Watch")))
    }
    #[cfg(not(feature = "opencv"))]
    {
        tracing::debug!("built without `opencv`, running headless");
        None
    }
}

/// Resolves on Ctrl+C or after `duration`, whichever comes first.
async fn shutdown_signal(duration: Option<Duration>) {
    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                tracing::error!(error = %err, "failed to listen for Ctrl+C");
            }
            tracing::info!("interrupt received, shutting down");
        }
        _ = deadline => tracing::info!("run duration elapsed, shutting down"),
    }
}

async fn run(args: Args, config: WatchConfig) -> Result<RunSummary> {
    let sinks = sink_factory(&args);
    let events = event_sink(&args, &config)?;
    let provider = camera_provider(&args, &config)?;
    let settings = source_settings(&args, &config, sinks, events)?;
    let display = display(&args);
    let shutdown = shutdown_signal(args.duration_secs.map(Duration::from_secs));

    tracing::info!(
        max_cameras = config.max_pool_size,
        size = %config.frame_size(),
        mode = ?config.recording_mode,
        scheduling = ?config.scheduling_mode,
        output = %config.output_dir.display(),
        "starting motion watch"
    );

    match config.scheduling_mode {
        SchedulingMode::Workers => {
            let mut monitor = ParallelMonitor::with_settings(&config, provider, settings)?;
            if let Some(display) = display {
                monitor = monitor.with_display(display);
            }
            Ok(monitor.run(shutdown).await)
        }
        SchedulingMode::Cooperative => {
            let mut monitor = MonitorLoop::with_settings(&config, provider, settings)?;
            if let Some(display) = display {
                monitor = monitor.with_display(display);
            }
            let stop = Arc::new(AtomicBool::new(false));
            let loop_stop = Arc::clone(&stop);
            let handle = tokio::task::spawn_blocking(move || monitor.run(&loop_stop));
            tokio::pin!(handle);

            let summary = tokio::select! {
                joined = &mut handle => joined,
                _ = shutdown => {
                    stop.store(true, Ordering::Release);
                    (&mut handle).await
                }
            };
            summary.context("monitor loop panicked")
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = load_config(&args)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .thread_name("motion-watch")
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    let summary = runtime.block_on(run(args, config))?;
    tracing::info!(
        ticks = summary.ticks,
        stopped_by_display = summary.stopped_by_display,
        "motion watch finished"
    );
    Ok(())
}
