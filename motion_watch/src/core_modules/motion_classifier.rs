// THEORY:
// The `MotionClassifier` turns one camera's frame stream into a boolean motion
// signal. It owns that camera's background model and is the only thing allowed
// to feed it, which is how the "every frame updates the model exactly once"
// rule is enforced: `classify` is the single entry point and it always calls
// `BackgroundSubtractor::apply`, warm-up or not.
//
// During warm-up the mask is discarded because the model is still converging
// and would report most of the scene as foreground. Afterwards the mask is
// opened to drop sensor noise and the largest connected region decides.

use crate::core_modules::background_model::{BackgroundSubtractor, RunningGaussian};
use crate::core_modules::blob_detector;
use crate::core_modules::frame::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifierConfig {
    /// Frames used only to train the model; `classify` is false for frames `1..=warmup_frames`.
    pub warmup_frames: u64,
    /// A region must be strictly larger than this many pixels to count as motion.
    pub min_motion_area: u32,
    /// Side of the square kernel used for the noise-reducing opening.
    pub opening_kernel: u32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            warmup_frames: 50,
            min_motion_area: 500,
            opening_kernel: 5,
        }
    }
}

/// Diagnostic view of one classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionReport {
    /// One-based index of the frame within this classifier's lifetime.
    pub frame_index: u64,
    pub warming_up: bool,
    pub region_count: usize,
    pub largest_area: u32,
    pub motion: bool,
}

pub struct MotionClassifier {
    config: ClassifierConfig,
    model: Box<dyn BackgroundSubtractor>,
    frame_count: u64,
}

impl MotionClassifier {
    pub fn new(config: ClassifierConfig, model: Box<dyn BackgroundSubtractor>) -> Self {
        Self {
            config,
            model,
            frame_count: 0,
        }
    }

    /// A classifier backed by the built-in running Gaussian model.
    pub fn with_default_model(config: ClassifierConfig) -> Self {
        Self::new(config, Box::new(RunningGaussian::default()))
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Frames seen so far, warm-up included.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Updates the model with `frame` and reports whether it contains motion.
    pub fn classify(&mut self, frame: &Frame) -> bool {
        self.classify_detailed(frame).motion
    }

    pub fn classify_detailed(&mut self, frame: &Frame) -> MotionReport {
        self.frame_count += 1;
        let mask = self.model.apply(frame);

        if self.frame_count <= self.config.warmup_frames {
            return MotionReport {
                frame_index: self.frame_count,
                warming_up: true,
                region_count: 0,
                largest_area: 0,
                motion: false,
            };
        }

        let opened = blob_detector::open(&mask, self.config.opening_kernel);
        let regions = blob_detector::find_regions(&opened);
        let largest_area = regions.iter().map(|r| r.area).max().unwrap_or(0);

        MotionReport {
            frame_index: self.frame_count,
            warming_up: false,
            region_count: regions.len(),
            largest_area,
            motion: largest_area > self.config.min_motion_area,
        }
    }
}
