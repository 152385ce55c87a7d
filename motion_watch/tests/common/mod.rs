#![allow(dead_code)]

use image::{GrayImage, Luma};
use motion_watch::core_modules::background_model::{BackgroundSubtractor, FOREGROUND};
use motion_watch::synthetic::SyntheticRig;
use motion_watch::{
    Frame, FrameSize, MemoryEventLog, MemorySinkFactory, MonitorLoop, SourceSettings, WatchConfig,
};
use std::sync::Arc;

pub const FRAME: FrameSize = FrameSize::new(96, 72);

/// Test configuration: small frames, the given warm-up and debounce.
pub fn config(max_pool_size: usize, warmup_frames: u64, debounce_delay: u32) -> WatchConfig {
    WatchConfig {
        max_pool_size,
        frame_width: FRAME.width,
        frame_height: FRAME.height,
        warmup_frames,
        debounce_delay,
        codec: "MJPG".into(),
        ..WatchConfig::default()
    }
}

/// Marks pure white pixels as foreground; the synthetic square is the only
/// white content before annotation, so motion is exact.
pub struct WhiteIsForeground;

impl BackgroundSubtractor for WhiteIsForeground {
    fn apply(&mut self, frame: &Frame) -> GrayImage {
        let mut mask = GrayImage::new(frame.width(), frame.height());
        for (x, y, pixel) in frame.enumerate_pixels() {
            if pixel.0 == [255, 255, 255] {
                mask.put_pixel(x, y, Luma([FOREGROUND]));
            }
        }
        mask
    }
}

pub struct Bench {
    pub rig: SyntheticRig,
    pub sinks: MemorySinkFactory,
    pub events: Arc<MemoryEventLog>,
    pub config: WatchConfig,
}

impl Bench {
    pub fn new(devices: usize, config: WatchConfig) -> Self {
        Self {
            rig: SyntheticRig::with_devices(devices, FRAME),
            sinks: MemorySinkFactory::new(),
            events: Arc::new(MemoryEventLog::new()),
            config,
        }
    }

    pub fn settings(&self) -> SourceSettings {
        SourceSettings::from_config(
            &self.config,
            Arc::new(self.sinks.clone()),
            self.events.clone(),
        )
    }

    /// Settings whose motion signal is exactly "the square is visible".
    pub fn exact_settings(&self) -> SourceSettings {
        self.settings()
            .with_subtractor(Arc::new(|| Box::new(WhiteIsForeground) as Box<dyn BackgroundSubtractor>))
    }

    /// Cooperative loop using the default background model.
    pub fn monitor(&self) -> MonitorLoop {
        MonitorLoop::with_settings(&self.config, Box::new(self.rig.provider()), self.settings())
            .expect("valid test config")
    }

    pub fn exact_monitor(&self) -> MonitorLoop {
        MonitorLoop::with_settings(
            &self.config,
            Box::new(self.rig.provider()),
            self.exact_settings(),
        )
        .expect("valid test config")
    }

    /// Index of the first event message containing `needle`.
    pub fn event_position(&self, needle: &str) -> Option<usize> {
        self.events.messages().iter().position(|m| m.contains(needle))
    }
}
