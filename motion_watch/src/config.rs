// THEORY:
// Every option in `WatchConfig` has a default that reproduces a four-camera
// 320x240 setup writing XVID clips at 20 fps. A JSON file may override any
// subset of the fields; the runner then layers command-line flags on top and
// calls `WatchConfig::validate` before anything is opened.

use crate::core_modules::frame::FrameSize;
use crate::core_modules::motion_classifier::ClassifierConfig;
use crate::core_modules::recording_controller::RecorderSettings;
use crate::error::{Result, WatchError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Whether clips are recorded per camera or from the composite grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingMode {
    #[default]
    PerSource,
    Combined,
}

/// How camera acquisition is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingMode {
    /// One loop polls every camera in turn.
    #[default]
    Cooperative,
    /// One blocking worker per camera, composited on its own cadence.
    Workers,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub max_pool_size: usize,
    pub frame_width: u32,
    pub frame_height: u32,
    pub warmup_frames: u64,
    /// Minimum area, in pixels, of a foreground region that counts as motion.
    pub min_motion_area: u32,
    /// Ticks a recording survives after the last motion.
    pub debounce_delay: u32,
    pub reconcile_interval_ms: u64,
    pub tick_interval_ms: u64,
    pub read_timeout_ms: u64,
    pub output_dir: PathBuf,
    pub log_file_name: String,
    /// Four-character codec code handed to the video sink.
    pub codec: String,
    pub fps: f64,
    pub recording_mode: RecordingMode,
    pub scheduling_mode: SchedulingMode,
    /// Draw the motion border and camera label onto each frame.
    pub annotate: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 4,
            frame_width: 320,
            frame_height: 240,
            warmup_frames: 50,
            min_motion_area: 500,
            debounce_delay: 60,
            reconcile_interval_ms: 5_000,
            tick_interval_ms: 30,
            read_timeout_ms: 1_000,
            output_dir: PathBuf::from("motion_clips"),
            log_file_name: "motion_log.txt".to_string(),
            codec: "XVID".to_string(),
            fps: 20.0,
            recording_mode: RecordingMode::default(),
            scheduling_mode: SchedulingMode::default(),
            annotate: true,
        }
    }
}

impl WatchConfig {
    pub fn from_json_str(payload: &str) -> Result<Self> {
        serde_json::from_str(payload).map_err(|err| WatchError::Config(err.to_string()))
    }

    /// Reads a JSON configuration file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let payload = std::fs::read_to_string(path).map_err(|err| {
            WatchError::Config(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_json_str(&payload)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_pool_size == 0 {
            return Err(WatchError::Config("max_pool_size must be at least 1".into()));
        }
        if self.frame_width == 0 || self.frame_height == 0 {
            return Err(WatchError::Config(format!(
                "frame dimensions must be non-zero, got {}x{}",
                self.frame_width, self.frame_height
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(WatchError::Config("tick_interval_ms must be positive".into()));
        }
        if self.read_timeout_ms == 0 {
            return Err(WatchError::Config("read_timeout_ms must be positive".into()));
        }
        if !(self.fps.is_finite() && self.fps > 0.0) {
            return Err(WatchError::Config(format!("fps must be positive, got {}", self.fps)));
        }
        if self.codec.chars().count() != 4 || !self.codec.is_ascii() {
            return Err(WatchError::Config(format!(
                "codec must be a four-character ASCII code, got {:?}",
                self.codec
            )));
        }
        if self.log_file_name.trim().is_empty() {
            return Err(WatchError::Config("log_file_name must not be empty".into()));
        }
        Ok(())
    }

    pub fn frame_size(&self) -> FrameSize {
        FrameSize::new(self.frame_width, self.frame_height)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn log_path(&self) -> PathBuf {
        self.output_dir.join(&self.log_file_name)
    }

    pub fn classifier_config(&self) -> ClassifierConfig {
        ClassifierConfig {
            warmup_frames: self.warmup_frames,
            min_motion_area: self.min_motion_area,
            ..ClassifierConfig::default()
        }
    }

    pub fn recorder_settings(&self) -> RecorderSettings {
        RecorderSettings {
            output_dir: self.output_dir.clone(),
            codec: self.codec.clone(),
            fps: self.fps,
            delay: self.debounce_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = WatchConfig::default();
        config.validate().expect("defaults validate");
        assert_eq!(config.frame_size(), FrameSize::new(320, 240));
        assert_eq!(config.reconcile_interval(), Duration::from_secs(5));
        assert_eq!(config.log_path(), PathBuf::from("motion_clips/motion_log.txt"));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = WatchConfig::from_json_str(
            r#"{ "max_pool_size": 2, "recording_mode": "combined", "scheduling_mode": "workers" }"#,
        )
        .expect("parses");
        assert_eq!(config.max_pool_size, 2);
        assert_eq!(config.recording_mode, RecordingMode::Combined);
        assert_eq!(config.scheduling_mode, SchedulingMode::Workers);
        assert_eq!(config.warmup_frames, 50);
        assert_eq!(config.codec, "XVID");
    }

    #[test]
    fn rejects_bad_codec_and_zero_pool() {
        let mut config = WatchConfig {
            codec: "H264X".into(),
            ..WatchConfig::default()
        };
        assert!(matches!(config.validate(), Err(WatchError::Config(_))));

        config.codec = "MJPG".into();
        config.max_pool_size = 0;
        assert!(matches!(config.validate(), Err(WatchError::Config(_))));
    }

    #[test]
    fn unknown_mode_is_a_config_error() {
        let err = WatchConfig::from_json_str(r#"{ "recording_mode": "sometimes" }"#)
            .expect_err("unknown variant");
        assert!(matches!(err, WatchError::Config(_)));
    }
}
