mod common;

use common::{Bench, FRAME, config};
use motion_watch::{CompositeFrame, DisplayControl, FrameDisplay, RecordingMode};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[test]
fn three_quiet_sources_tile_into_a_padded_two_by_two_grid() {
    let bench = Bench::new(3, config(4, 5, 10));
    let mut monitor = bench.monitor();
    let t0 = Instant::now();

    for _ in 0..20 {
        let report = monitor.tick(t0);
        assert_eq!(report.active_sources, 3);
        assert_eq!((report.rows, report.cols, report.padding), (2, 2, 1));
        assert!(report.motion_slots.is_empty());
    }
    let composite = monitor.last_composite().expect("composite");
    assert_eq!(composite.image.dimensions(), (FRAME.width * 2, FRAME.height * 2));
    assert!(bench.sinks.clips().is_empty());
}

#[test]
fn no_sources_still_produce_a_placeholder() {
    let bench = Bench::new(0, config(4, 5, 10));
    let mut monitor = bench.monitor();
    let report = monitor.tick(Instant::now());
    assert_eq!(report.active_sources, 0);
    assert_eq!((report.rows, report.cols), (0, 0));
    let composite = monitor.last_composite().expect("composite");
    assert_eq!(composite.image.dimensions(), (FRAME.width, FRAME.height));
}

#[test]
fn combined_mode_records_the_grid_and_rotates_on_reshape() {
    let mut cfg = config(4, 5, 60);
    cfg.recording_mode = RecordingMode::Combined;
    let bench = Bench::new(2, cfg);
    let ids = bench.rig.device_ids();
    let mut monitor = bench.exact_monitor();
    let t0 = Instant::now();

    for tick in 1..=15u64 {
        bench.rig.set_motion(&ids[0], tick == 10);
        let report = monitor.tick(t0);
        assert!(report.recording_slots.is_empty(), "no per-camera clips in combined mode");
        assert_eq!(report.combined_recording, tick >= 10, "tick {tick}");
    }
    assert_eq!(bench.events.count_containing("[+] Combined grid start recording:"), 1);

    // A third camera turns the 1x2 grid into 2x2.
    bench.rig.add_device("Cam3");
    let report = monitor.tick(t0 + Duration::from_secs(5));
    assert_eq!(report.reconcile.attached.len(), 1);
    assert_eq!((report.rows, report.cols), (2, 2));
    assert!(report.combined_recording);

    let clips = bench.sinks.clips();
    assert_eq!(clips.len(), 2);
    assert!(clips[0].closed);
    assert_eq!(clips[0].spec.frame_size.width, FRAME.width * 2);
    assert_eq!(clips[0].spec.frame_size.height, FRAME.height);
    assert_eq!(clips[1].spec.frame_size.height, FRAME.height * 2);
    let name = clips[0].path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    assert!(!name.contains("_cam"), "{name}");

    monitor.shutdown();
    assert_eq!(bench.sinks.open_sessions(), 0);
    assert_eq!(bench.events.count_containing("[-] Combined grid stop recording."), 2);
}

struct CountingDisplay {
    shown: Arc<AtomicU64>,
    stop_after: u64,
}

impl FrameDisplay for CountingDisplay {
    fn show(&mut self, _composite: &CompositeFrame) -> DisplayControl {
        let shown = self.shown.fetch_add(1, Ordering::SeqCst) + 1;
        if shown >= self.stop_after {
            DisplayControl::Stop
        } else {
            DisplayControl::Continue
        }
    }
}

#[test]
fn display_can_stop_the_run() {
    let mut cfg = config(4, 5, 10);
    cfg.tick_interval_ms = 1;
    let bench = Bench::new(1, cfg);
    let shown = Arc::new(AtomicU64::new(0));
    let mut monitor = bench.monitor().with_display(Box::new(CountingDisplay {
        shown: Arc::clone(&shown),
        stop_after: 3,
    }));

    let summary = monitor.run(&AtomicBool::new(false));
    assert!(summary.stopped_by_display);
    assert_eq!(summary.ticks, 3);
    assert_eq!(shown.load(Ordering::SeqCst), 3);
}

#[test]
fn raised_stop_flag_ends_the_run_immediately() {
    let bench = Bench::new(1, config(4, 5, 10));
    let mut monitor = bench.monitor();
    let summary = monitor.run(&AtomicBool::new(true));
    assert_eq!(summary.ticks, 0);
    assert!(!summary.stopped_by_display);
}

#[test]
fn failed_camera_keeps_a_no_data_tile_until_reconcile() {
    let mut cfg = config(4, 5, 60);
    cfg.recording_mode = RecordingMode::Combined;
    let bench = Bench::new(2, cfg);
    let ids = bench.rig.device_ids();
    bench.rig.set_motion(&ids[1], true);
    let mut monitor = bench.exact_monitor();
    let t0 = Instant::now();

    for _ in 0..8 {
        monitor.tick(t0);
    }
    assert!(monitor.combined_recorder().is_some_and(|r| r.is_recording()));

    bench.rig.set_failing(&ids[0], true);
    for _ in 0..3 {
        let report = monitor.tick(t0);
        assert_eq!(report.active_sources, 1);
        assert_eq!((report.rows, report.cols, report.padding), (1, 2, 0));
    }
    // Same grid shape, so the combined clip was not rotated.
    assert_eq!(bench.sinks.clips().len(), 1);

    let report = monitor.tick(t0 + Duration::from_secs(5));
    assert!(report.reconcile.detached.contains(&ids[0]));
    assert_eq!((report.rows, report.cols), (1, 1));
    assert_eq!(bench.sinks.clips().len(), 2);
    assert_eq!(bench.events.count_containing("Camera 'Cam1' disconnected or no frames."), 1);
}
