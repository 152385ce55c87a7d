mod common;

use common::{Bench, config};
use image::GrayImage;
use motion_watch::core_modules::background_model::BackgroundSubtractor;
use motion_watch::parallel_pipeline::{SlotFrame, SlotState, WorkerPool};
use motion_watch::{
    CompositeFrame, DisplayControl, Frame, FrameDisplay, ParallelMonitor, SchedulingMode,
};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::{Duration, Instant};
use tokio::sync::watch;

fn worker_config(max: usize) -> motion_watch::WatchConfig {
    let mut cfg = config(max, 5, 5);
    cfg.scheduling_mode = SchedulingMode::Workers;
    cfg.tick_interval_ms = 5;
    cfg.reconcile_interval_ms = 40;
    cfg.read_timeout_ms = 200;
    cfg
}

async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn workers_record_independently_and_close_on_shutdown() {
    let bench = Bench::new(2, worker_config(4));
    let ids = bench.rig.device_ids();
    bench.rig.set_motion(&ids[0], true);

    let monitor = ParallelMonitor::with_settings(
        &bench.config,
        Box::new(bench.rig.provider()),
        bench.exact_settings(),
    )
    .expect("monitor");

    let sinks = bench.sinks.clone();
    let shutdown = async move {
        wait_for(|| sinks.open_sessions() > 0).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    let summary = monitor.run(shutdown).await;

    assert!(summary.ticks > 0);
    assert!(!summary.stopped_by_display);
    let clips = bench.sinks.clips();
    assert!(!clips.is_empty());
    assert!(clips.iter().all(|clip| clip.closed));
    assert!(clips.iter().all(|clip| {
        clip.path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.contains("_cam1"))
    }));
    assert_eq!(
        bench.events.count_containing("start recording"),
        bench.events.count_containing("stop recording")
    );
    assert_eq!(bench.events.count_containing("connected."), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_worker_is_detached_once() {
    let bench = Bench::new(2, worker_config(4));
    let ids = bench.rig.device_ids();
    let monitor = ParallelMonitor::with_settings(
        &bench.config,
        Box::new(bench.rig.provider()),
        bench.exact_settings(),
    )
    .expect("monitor");

    let rig = bench.rig.clone();
    let events = bench.events.clone();
    let failing = ids[0].clone();
    let shutdown = async move {
        wait_for(|| rig.frames_served(&failing) > 3).await;
        rig.unplug(&failing);
        wait_for(|| events.count_containing("disconnected") > 0).await;
        // A few more reconcile rounds must not log it again.
        tokio::time::sleep(Duration::from_millis(150)).await;
    };
    monitor.run(shutdown).await;

    assert_eq!(
        bench
            .events
            .count_containing("Camera 'Cam1' disconnected or no frames."),
        1
    );
    assert_eq!(bench.events.count_containing("Camera 'Cam2' disconnected"), 0);
    assert!(bench.rig.frames_served(&ids[1]) > 3);
}

async fn wait_for_state(receiver: &mut watch::Receiver<SlotFrame>, state: SlotState) -> bool {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if receiver.borrow_and_update().state == state {
                return true;
            }
            if receiver.changed().await.is_err() {
                return false;
            }
        }
    })
    .await
    .unwrap_or(false)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_pool_publishes_slots_and_respects_capacity() {
    let bench = Bench::new(3, worker_config(2));
    let ids = bench.rig.device_ids();
    let mut pool = WorkerPool::from_config(
        &bench.config,
        Box::new(bench.rig.provider()),
        bench.exact_settings(),
    );
    let t0 = Instant::now();

    let report = pool.force_reconcile(t0).await;
    assert_eq!(report.attached.len(), 2);
    assert_eq!(pool.device_ids(), vec![ids[0].clone(), ids[1].clone()]);

    let subscriptions = pool.subscriptions();
    assert_eq!(subscriptions.iter().map(|s| s.slot).collect::<Vec<_>>(), vec![0, 1]);
    let mut first = subscriptions[0].receiver.clone();
    assert!(wait_for_state(&mut first, SlotState::Live).await);

    bench.rig.unplug(&ids[1]);
    let report = pool.reconcile(t0 + Duration::from_secs(1)).await;
    assert!(report.detached.contains(&ids[1]));
    assert!(report.attached.contains(&ids[2]));
    assert_eq!(pool.len(), 2);

    pool.shutdown().await;
    assert!(pool.is_empty());
    assert_eq!(bench.sinks.open_sessions(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hung_worker_times_out_and_is_detached_after_its_clip_closes() {
    let mut cfg = worker_config(4);
    cfg.read_timeout_ms = 50;
    let bench = Bench::new(2, cfg);
    let ids = bench.rig.device_ids();
    bench.rig.set_motion(&ids[0], true);
    let mut pool = WorkerPool::from_config(
        &bench.config,
        Box::new(bench.rig.timed_provider()),
        bench.exact_settings(),
    );
    let t0 = Instant::now();
    pool.force_reconcile(t0).await;
    assert!(wait_for(|| bench.sinks.open_sessions() == 1).await);

    bench.rig.set_hung(&ids[0], true);
    let mut first = pool.subscriptions()[0].receiver.clone();
    assert!(wait_for_state(&mut first, SlotState::Disconnected).await);

    // The other worker keeps delivering while the hung one is gone.
    let served = bench.rig.frames_served(&ids[1]);
    assert!(wait_for(|| bench.rig.frames_served(&ids[1]) > served + 3).await);
    // The clip stays open until reconcile detaches the camera.
    assert_eq!(bench.sinks.open_sessions(), 1);
    assert_eq!(bench.events.count_containing("disconnected"), 0);

    bench.rig.set_hung(&ids[0], false);
    let report = pool.reconcile(t0 + Duration::from_secs(1)).await;
    assert!(report.detached.contains(&ids[0]));
    assert!(report.attached.contains(&ids[0]));

    let stop = bench.event_position("Camera 'Cam1' stop recording.").expect("stop event");
    let gone = bench
        .event_position("Camera 'Cam1' disconnected or no frames.")
        .expect("disconnect event");
    assert!(stop < gone);
    assert_eq!(bench.events.count_containing("Camera 'Cam1' disconnected"), 1);

    pool.shutdown().await;
    assert_eq!(bench.sinks.open_sessions(), 0);
}

/// Panics once it has seen `frames` frames.
struct PanicsAfter {
    frames: u32,
}

impl BackgroundSubtractor for PanicsAfter {
    fn apply(&mut self, frame: &Frame) -> GrayImage {
        assert!(self.frames > 0, "background model blew up");
        self.frames -= 1;
        GrayImage::new(frame.width(), frame.height())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicked_worker_is_reported_by_camera_name() {
    let bench = Bench::new(1, worker_config(4));
    let id = bench.rig.device_ids().remove(0);
    let settings = bench.settings().with_subtractor(Arc::new(|| {
        Box::new(PanicsAfter { frames: 3 }) as Box<dyn BackgroundSubtractor>
    }));
    let mut pool = WorkerPool::from_config(&bench.config, Box::new(bench.rig.provider()), settings);
    let t0 = Instant::now();
    pool.force_reconcile(t0).await;

    let mut detached = false;
    for round in 1..=200u64 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let report = pool.reconcile(t0 + Duration::from_secs(round)).await;
        if report.detached.contains(&id) {
            detached = true;
            break;
        }
    }
    assert!(detached);
    assert_eq!(
        bench.events.count_containing("Camera 'Cam1' disconnected or no frames."),
        1
    );
    assert_eq!(bench.events.count_containing("synthetic:"), 0);
    pool.shutdown().await;
}

/// Records which thread every display call lands on.
struct ThreadRecordingDisplay {
    threads: Arc<Mutex<Vec<ThreadId>>>,
    stop_after: usize,
}

impl ThreadRecordingDisplay {
    fn record(&self) -> usize {
        let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        threads.push(std::thread::current().id());
        threads.len()
    }
}

impl FrameDisplay for ThreadRecordingDisplay {
    fn show(&mut self, _composite: &CompositeFrame) -> DisplayControl {
        if self.record() >= self.stop_after {
            DisplayControl::Stop
        } else {
            DisplayControl::Continue
        }
    }
}

impl Drop for ThreadRecordingDisplay {
    fn drop(&mut self) {
        self.record();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn display_is_driven_from_a_single_thread() {
    let bench = Bench::new(2, worker_config(4));
    let threads = Arc::new(Mutex::new(Vec::new()));
    let monitor = ParallelMonitor::with_settings(
        &bench.config,
        Box::new(bench.rig.provider()),
        bench.exact_settings(),
    )
    .expect("monitor")
    .with_display(Box::new(ThreadRecordingDisplay {
        threads: Arc::clone(&threads),
        stop_after: 25,
    }));

    let summary = monitor.run(tokio::time::sleep(Duration::from_secs(10))).await;
    assert!(summary.stopped_by_display);
    assert_eq!(summary.ticks, 25);

    let threads = threads.lock().unwrap_or_else(|e| e.into_inner());
    // 25 frames shown plus the drop.
    assert_eq!(threads.len(), 26);
    assert!(threads.iter().all(|id| *id == threads[0]));
    assert_ne!(threads[0], std::thread::current().id());
}
