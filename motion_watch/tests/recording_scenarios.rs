mod common;

use common::{Bench, config};
use std::time::Instant;

#[test]
fn motion_during_warmup_is_ignored() {
    let bench = Bench::new(1, config(4, 50, 60));
    let id = bench.rig.device_ids().remove(0);
    let mut monitor = bench.monitor();
    let t0 = Instant::now();

    for tick in 1..=60u64 {
        bench.rig.set_motion(&id, tick == 10);
        let report = monitor.tick(t0);
        assert!(report.motion_slots.is_empty(), "tick {tick} reported motion");
        assert!(report.recording_slots.is_empty());
    }
    assert!(bench.sinks.clips().is_empty());
    assert_eq!(bench.events.count_containing("start recording"), 0);
}

#[test]
fn single_motion_tick_records_the_debounce_window() {
    let bench = Bench::new(1, config(4, 50, 60));
    let id = bench.rig.device_ids().remove(0);
    let mut monitor = bench.monitor();
    let t0 = Instant::now();

    for tick in 1..=130u64 {
        bench.rig.set_motion(&id, tick == 60);
        let report = monitor.tick(t0);
        assert_eq!(report.motion_slots == vec![0], tick == 60, "motion at tick {tick}");
        let recording = !report.recording_slots.is_empty();
        assert_eq!(recording, (60..120).contains(&tick), "recording state at tick {tick}");
    }

    let clips = bench.sinks.clips();
    assert_eq!(clips.len(), 1);
    assert_eq!(clips[0].frames, 60);
    assert!(clips[0].closed);
    let name = clips[0].path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    assert!(name.starts_with("motion_") && name.ends_with("_cam1.mem"), "{name}");
    assert!(clips[0].path.starts_with(&bench.config.output_dir));

    assert_eq!(
        bench.events.messages().iter().filter(|m| m.contains("Cam1") && m.contains("recording")).count(),
        2
    );
}

#[test]
fn sustained_motion_extends_one_clip() {
    let bench = Bench::new(1, config(4, 5, 10));
    let id = bench.rig.device_ids().remove(0);
    let mut monitor = bench.exact_monitor();
    let t0 = Instant::now();

    // Motion on ticks 10..=29, then quiet.
    for tick in 1..=60u64 {
        bench.rig.set_motion(&id, (10..30).contains(&tick));
        monitor.tick(t0);
    }

    let clips = bench.sinks.clips();
    assert_eq!(clips.len(), 1);
    // 20 motion frames plus 9 trailing quiet frames; tick 39 closes.
    assert_eq!(clips[0].frames, 29);
    assert!(clips[0].closed);
}

#[test]
fn sink_open_failure_is_retried_on_the_next_motion() {
    let bench = Bench::new(1, config(4, 5, 10));
    let id = bench.rig.device_ids().remove(0);
    let mut monitor = bench.exact_monitor();
    let t0 = Instant::now();
    bench.sinks.fail_next_opens(1);

    for tick in 1..=12u64 {
        bench.rig.set_motion(&id, tick >= 10);
        let report = monitor.tick(t0);
        assert_eq!(report.recording_slots.is_empty(), tick < 11, "tick {tick}");
    }
    assert_eq!(bench.events.count_containing("failed to start recording"), 1);
    assert_eq!(bench.sinks.clips().len(), 1);
}

#[test]
fn shutdown_closes_open_clips() {
    let bench = Bench::new(2, config(4, 5, 100));
    let ids = bench.rig.device_ids();
    let mut monitor = bench.exact_monitor();
    let t0 = Instant::now();

    for tick in 1..=8u64 {
        for id in &ids {
            bench.rig.set_motion(id, tick >= 7);
        }
        monitor.tick(t0);
    }
    assert_eq!(bench.sinks.open_sessions(), 2);

    monitor.shutdown();
    assert_eq!(bench.sinks.open_sessions(), 0);
    assert_eq!(bench.events.count_containing("stop recording"), 2);
    assert_eq!(bench.events.count_containing("disconnected"), 0);
}
