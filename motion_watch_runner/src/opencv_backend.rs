// THEORY:
// OpenCV implementations of the engine's seams: V4L capture, `VideoWriter`
// clips, the MOG2 background model and a HighGUI preview window.

use motion_watch::capture::{DeviceProvider, FrameSource, TimedSource};
use motion_watch::core_modules::background_model::BackgroundSubtractor;
use motion_watch::core_modules::compositor::CompositeFrame;
use motion_watch::pipeline::{DisplayControl, FrameDisplay};
use motion_watch::sink::{SinkFactory, SinkSpec, VideoSink};
use motion_watch::{DeviceInfo, Frame, FrameSize, WatchError};
use image::GrayImage;
use opencv::{
    core::{self, Mat, Ptr, Scalar, Size},
    highgui, imgproc,
    prelude::*,
    video::{self, BackgroundSubtractorMOG2},
    videoio::{self, VideoCapture, VideoWriter},
};
use std::path::Path;
use std::time::Duration;

const ESC: i32 = 27;

fn cv_error(err: opencv::Error) -> String {
    format!("opencv: {err}")
}

/// RGB frame -> BGR `Mat`.
fn frame_to_bgr(frame: &Frame) -> opencv::Result<Mat> {
    let mut rgb = Mat::new_rows_cols_with_default(
        frame.height() as i32,
        frame.width() as i32,
        core::CV_8UC3,
        Scalar::all(0.0),
    )?;
    rgb.data_bytes_mut()?.copy_from_slice(frame.as_raw());
    let mut bgr = Mat::default();
    imgproc::cvt_color(&rgb, &mut bgr, imgproc::COLOR_RGB2BGR, 0)?;
    Ok(bgr)
}

/// BGR `Mat` -> RGB frame.
fn bgr_to_frame(mat: &Mat) -> opencv::Result<Option<Frame>> {
    let mut rgb = Mat::default();
    imgproc::cvt_color(mat, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;
    let (width, height) = (rgb.cols() as u32, rgb.rows() as u32);
    Ok(Frame::from_raw(width, height, rgb.data_bytes()?.to_vec()))
}

/// Opens `/dev/video*` devices (or plain indices where there is no `/dev`).
pub struct OpenCvProvider {
    max_index: u32,
}

impl OpenCvProvider {
    pub fn new(max_index: u32) -> Self {
        Self { max_index }
    }

    fn index_of(device: &DeviceInfo) -> Option<i32> {
        device
            .id
            .as_str()
            .trim_start_matches("/dev/video")
            .trim_start_matches("index:")
            .parse()
            .ok()
    }
}

impl DeviceProvider for OpenCvProvider {
    fn discover(&mut self) -> Vec<DeviceInfo> {
        let mut indices: Vec<u32> = std::fs::read_dir("/dev")
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .filter_map(|entry| {
                        entry
                            .file_name()
                            .to_str()
                            .and_then(|name| name.strip_prefix("video"))
                            .and_then(|n| n.parse().ok())
                    })
                    .collect()
            })
            .unwrap_or_default();
        indices.sort_unstable();

        if indices.is_empty() {
            return (0..self.max_index)
                .map(|i| DeviceInfo::new(format!("index:{i}"), i))
                .collect();
        }
        indices
            .into_iter()
            .enumerate()
            .map(|(position, i)| DeviceInfo::new(format!("/dev/video{i}"), position as u32))
            .collect()
    }

    fn open(&mut self, device: &DeviceInfo, read_timeout: Duration) -> motion_watch::Result<Box<dyn FrameSource>> {
        let index = Self::index_of(device)
            .ok_or_else(|| WatchError::SourceUnavailable(format!("{} is not a capture index", device.id)))?;
        let capture = VideoCapture::new(index, videoio::CAP_ANY)
            .map_err(|err| WatchError::SourceUnavailable(cv_error(err)))?;
        if !capture.is_opened().unwrap_or(false) {
            return Err(WatchError::SourceUnavailable(format!("{} did not open", device.id)));
        }
        let source = OpenCvSource {
            label: device.id.to_string(),
            capture,
            frame: Mat::default(),
        };
        Ok(Box::new(TimedSource::spawn(device.id.as_str(), Box::new(source), read_timeout)?))
    }
}

struct OpenCvSource {
    label: String,
    capture: VideoCapture,
    frame: Mat,
}

impl FrameSource for OpenCvSource {
    fn read(&mut self) -> motion_watch::Result<Frame> {
        let disconnected = |reason: String| WatchError::SourceDisconnected(format!("{}: {reason}", self.label));
        match self.capture.read(&mut self.frame) {
            Ok(true) if !self.frame.empty() => bgr_to_frame(&self.frame)
                .map_err(|err| disconnected(cv_error(err)))?
                .ok_or_else(|| disconnected("unexpected frame layout".into())),
            Ok(_) => Err(disconnected("no frame".into())),
            Err(err) => Err(disconnected(cv_error(err))),
        }
    }

    fn is_open(&self) -> bool {
        self.capture.is_opened().unwrap_or(false)
    }

    fn release(&mut self) {
        if let Err(err) = self.capture.release() {
            tracing::warn!(source = %self.label, error = %err, "failed to release capture");
        }
    }
}

/// `VideoWriter` sink; the FourCC comes from the configured codec.
pub struct OpenCvSinkFactory {
    extension: String,
}

impl Default for OpenCvSinkFactory {
    fn default() -> Self {
        Self {
            extension: "avi".to_string(),
        }
    }
}

impl SinkFactory for OpenCvSinkFactory {
    fn extension(&self) -> &str {
        &self.extension
    }

    fn open(&self, path: &Path, spec: &SinkSpec) -> motion_watch::Result<Box<dyn VideoSink>> {
        let open_error = |reason: String| WatchError::SinkOpen {
            path: path.to_path_buf(),
            reason,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|err| open_error(err.to_string()))?;
        }
        let mut code = spec.codec.chars();
        let (Some(a), Some(b), Some(c), Some(d)) = (code.next(), code.next(), code.next(), code.next()) else {
            return Err(open_error(format!("codec {:?} is not a FourCC", spec.codec)));
        };
        let fourcc = VideoWriter::fourcc(a, b, c, d).map_err(|err| open_error(cv_error(err)))?;
        let size = Size::new(spec.frame_size.width as i32, spec.frame_size.height as i32);
        let writer = VideoWriter::new(&path.to_string_lossy(), fourcc, spec.fps, size, true)
            .map_err(|err| open_error(cv_error(err)))?;
        if !writer.is_opened().unwrap_or(false) {
            return Err(open_error(format!("no encoder for {}", spec.codec)));
        }
        Ok(Box::new(OpenCvSink {
            path: path.to_path_buf(),
            writer,
            frame_size: spec.frame_size,
        }))
    }
}

struct OpenCvSink {
    path: std::path::PathBuf,
    writer: VideoWriter,
    frame_size: FrameSize,
}

impl VideoSink for OpenCvSink {
    fn write(&mut self, frame: &Frame) -> motion_watch::Result<()> {
        let write_error = |reason: String| WatchError::SinkWrite {
            path: self.path.clone(),
            reason,
        };
        if FrameSize::of(frame) != self.frame_size {
            return Err(write_error(format!("frame is {}", FrameSize::of(frame))));
        }
        let bgr = frame_to_bgr(frame).map_err(|err| write_error(cv_error(err)))?;
        self.writer
            .write(&bgr)
            .map_err(|err| write_error(cv_error(err)))
    }

    fn close(mut self: Box<Self>) -> motion_watch::Result<()> {
        self.writer.release().map_err(|err| WatchError::SinkWrite {
            path: self.path.clone(),
            reason: cv_error(err),
        })
    }
}

/// OpenCV's Gaussian-mixture background model.
pub struct Mog2Subtractor {
    inner: Ptr<BackgroundSubtractorMOG2>,
}

impl Mog2Subtractor {
    pub fn new() -> opencv::Result<Self> {
        Ok(Self {
            inner: video::create_background_subtractor_mog2(500, 16.0, false)?,
        })
    }

    /// Factory shape expected by `SourceSettings::with_subtractor`. Falls back to
    /// the built-in model if OpenCV cannot create one.
    pub fn boxed() -> Box<dyn BackgroundSubtractor> {
        match Self::new() {
            Ok(model) => Box::new(model),
            Err(err) => {
                tracing::error!(error = %err, "MOG2 unavailable, using the running Gaussian model");
                Box::new(motion_watch::core_modules::background_model::RunningGaussian::default())
            }
        }
    }
}

impl BackgroundSubtractor for Mog2Subtractor {
    fn apply(&mut self, frame: &Frame) -> GrayImage {
        let empty = || GrayImage::new(frame.width(), frame.height());
        let result = frame_to_bgr(frame).and_then(|bgr| {
            let mut mask = Mat::default();
            self.inner.apply(&bgr, &mut mask, -1.0)?;
            Ok(mask.data_bytes()?.to_vec())
        });
        match result {
            Ok(bytes) => GrayImage::from_raw(frame.width(), frame.height(), bytes).unwrap_or_else(empty),
            Err(err) => {
                tracing::warn!(error = %err, "MOG2 apply failed");
                empty()
            }
        }
    }
}

/// HighGUI preview window. ESC or closing the window stops the run.
///
/// The window is created by the first `show`, so every HighGUI call happens
/// on the thread that drives the display.
pub struct HighGuiDisplay {
    window: String,
    created: bool,
}

impl HighGuiDisplay {
    pub fn new(window: &str) -> Self {
        Self {
            window: window.to_string(),
            created: false,
        }
    }
}

impl FrameDisplay for HighGuiDisplay {
    fn show(&mut self, composite: &CompositeFrame) -> DisplayControl {
        if !self.created {
            if let Err(err) = highgui::named_window(&self.window, highgui::WINDOW_AUTOSIZE) {
                tracing::error!(error = %err, "failed to open preview window");
                return DisplayControl::Stop;
            }
            self.created = true;
        }
        let shown = frame_to_bgr(&composite.image).and_then(|bgr| highgui::imshow(&self.window, &bgr));
        if let Err(err) = shown {
            tracing::warn!(error = %err, "failed to draw preview");
        }
        if highgui::wait_key(1).unwrap_or(-1) == ESC {
            return DisplayControl::Stop;
        }
        let visible = highgui::get_window_property(&self.window, highgui::WND_PROP_VISIBLE).unwrap_or(1.0);
        if visible < 1.0 {
            DisplayControl::Stop
        } else {
            DisplayControl::Continue
        }
    }
}

impl Drop for HighGuiDisplay {
    fn drop(&mut self) {
        if self.created {
            let _ = highgui::destroy_window(&self.window);
        }
    }
}
