// THEORY:
// The background model is the stateful, learning half of motion detection. It
// observes every frame a camera produces and keeps, per pixel, a statistical
// picture of what "normal" looks like. A pixel whose current value is a
// statistical outlier against that picture is foreground.
//
// Key architectural principles:
// 1.  **Update and query are one call**: `apply` both classifies the frame against
//     the model and folds the frame into the model. There is deliberately no way to
//     do one without the other; skipping a frame or querying twice would silently
//     skew the learned statistics.
// 2.  **Pluggable**: the trait is the seam to an external vision library. The
//     runner can swap in OpenCV's MOG2; the default is the running Gaussian below.
// 3.  **Adaptive learning**: each pixel keeps a running mean and variance of its
//     luminance. The learning rate starts high (fast convergence on the first
//     frames) and settles at `1 / history`, so slow lighting drift is absorbed
//     while sudden change stands out.
// 4.  **Outlier test**: a pixel is foreground when its squared deviation exceeds
//     `variance_threshold` times its learned variance (a Mahalanobis test on one
//     channel). Variance is clamped so a perfectly static pixel does not turn
//     every small sensor flicker into foreground.

use crate::core_modules::frame::{Frame, FrameSize};
use image::{GrayImage, Luma};

pub const FOREGROUND: u8 = 255;
pub const BACKGROUND: u8 = 0;

/// Produces a foreground mask for a frame while updating its model with it.
pub trait BackgroundSubtractor: Send {
    /// Feeds `frame` into the model and returns its foreground mask
    /// (`FOREGROUND` or `BACKGROUND` per pixel, same dimensions as `frame`).
    fn apply(&mut self, frame: &Frame) -> GrayImage;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianConfig {
    /// Number of frames the learning rate settles at (alpha = 1 / history).
    pub history: u32,
    /// Squared-deviation multiple of the variance that marks foreground.
    pub variance_threshold: f32,
    pub initial_variance: f32,
    pub min_variance: f32,
    pub max_variance: f32,
}

impl Default for GaussianConfig {
    fn default() -> Self {
        Self {
            history: 500,
            variance_threshold: 16.0,
            initial_variance: 15.0,
            min_variance: 4.0,
            max_variance: 75.0,
        }
    }
}

/// Per-pixel running Gaussian over luminance.
pub struct RunningGaussian {
    config: GaussianConfig,
    size: Option<FrameSize>,
    means: Vec<f32>,
    variances: Vec<f32>,
    frames_seen: u32,
}

impl Default for RunningGaussian {
    fn default() -> Self {
        Self::new(GaussianConfig::default())
    }
}

impl RunningGaussian {
    pub fn new(config: GaussianConfig) -> Self {
        Self {
            config,
            size: None,
            means: Vec::new(),
            variances: Vec::new(),
            frames_seen: 0,
        }
    }

    pub fn frames_seen(&self) -> u32 {
        self.frames_seen
    }

    /// Rec. 601 luma, the same weighting the frame pipeline uses everywhere else.
    fn luminance(pixel: &image::Rgb<u8>) -> f32 {
        let [r, g, b] = pixel.0;
        0.299 * f32::from(r) + 0.587 * f32::from(g) + 0.114 * f32::from(b)
    }

    fn seed(&mut self, frame: &Frame) {
        self.size = Some(FrameSize::of(frame));
        self.means = frame.pixels().map(Self::luminance).collect();
        self.variances = vec![self.config.initial_variance; self.means.len()];
        self.frames_seen = 1;
    }
}

impl BackgroundSubtractor for RunningGaussian {
    fn apply(&mut self, frame: &Frame) -> GrayImage {
        let size = FrameSize::of(frame);
        let mut mask = GrayImage::from_pixel(size.width, size.height, Luma([BACKGROUND]));

        // A new camera resolution invalidates everything learned so far.
        if self.size != Some(size) {
            self.seed(frame);
            return mask;
        }

        self.frames_seen = self.frames_seen.saturating_add(1);
        let alpha = 1.0 / self.frames_seen.min(self.config.history.max(1)) as f32;
        let cfg = self.config;

        for ((pixel, mask_pixel), (mean, variance)) in frame
            .pixels()
            .zip(mask.pixels_mut())
            .zip(self.means.iter_mut().zip(self.variances.iter_mut()))
        {
            let value = Self::luminance(pixel);
            let delta = value - *mean;
            let squared = delta * delta;
            if squared > cfg.variance_threshold * *variance {
                mask_pixel.0 = [FOREGROUND];
            }
            *mean += alpha * delta;
            *variance = (*variance + alpha * (squared - *variance))
                .clamp(cfg.min_variance, cfg.max_variance);
        }

        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn flat(width: u32, height: u32, value: u8) -> Frame {
        Frame::from_pixel(width, height, Rgb([value, value, value]))
    }

    fn foreground_count(mask: &GrayImage) -> usize {
        mask.pixels().filter(|p| p.0[0] == FOREGROUND).count()
    }

    #[test]
    fn first_frame_seeds_and_reports_nothing() {
        let mut model = RunningGaussian::default();
        let mask = model.apply(&flat(16, 16, 200));
        assert_eq!(foreground_count(&mask), 0);
        assert_eq!(model.frames_seen(), 1);
    }

    #[test]
    fn static_scene_stays_background() {
        let mut model = RunningGaussian::default();
        for _ in 0..30 {
            let mask = model.apply(&flat(16, 16, 90));
            assert_eq!(foreground_count(&mask), 0);
        }
    }

    #[test]
    fn sudden_change_is_foreground_and_then_learned() {
        let mut model = RunningGaussian::default();
        for _ in 0..20 {
            model.apply(&flat(8, 8, 40));
        }
        let mut changed = flat(8, 8, 40);
        for y in 0..4 {
            for x in 0..4 {
                changed.put_pixel(x, y, Rgb([220, 220, 220]));
            }
        }
        assert_eq!(foreground_count(&model.apply(&changed)), 16);

        // Held long enough, the new content becomes background.
        let mut last = 16;
        for _ in 0..400 {
            last = foreground_count(&model.apply(&changed));
        }
        assert_eq!(last, 0);
    }

    #[test]
    fn resolution_change_reseeds() {
        let mut model = RunningGaussian::default();
        model.apply(&flat(8, 8, 10));
        model.apply(&flat(8, 8, 10));
        let mask = model.apply(&flat(4, 4, 250));
        assert_eq!(mask.dimensions(), (4, 4));
        assert_eq!(foreground_count(&mask), 0);
        assert_eq!(model.frames_seen(), 1);
    }
}
