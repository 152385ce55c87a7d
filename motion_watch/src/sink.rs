// THEORY:
// Container encoding is not the engine's business: a `SinkFactory` opens a
// `VideoSink` for a path and the recording controller only writes frames and
// closes it. Two factories live here: a Motion-JPEG writer that needs nothing
// beyond the `image` crate, and an in-memory recorder used by tests and dry runs.

use crate::core_modules::frame::{Frame, FrameSize};
use crate::error::{Result, WatchError};
use image::codecs::jpeg::JpegEncoder;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Parameters a sink is opened with.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkSpec {
    /// Four-character codec code, e.g. `XVID` or `MJPG`.
    pub codec: String,
    pub fps: f64,
    pub frame_size: FrameSize,
}

pub trait VideoSink: Send {
    fn write(&mut self, frame: &Frame) -> Result<()>;
    /// Flushes buffered data and finalises the container before returning.
    fn close(self: Box<Self>) -> Result<()>;
}

pub trait SinkFactory: Send + Sync {
    /// File extension (without the dot) of the containers this factory writes.
    fn extension(&self) -> &str;
    fn open(&self, path: &Path, spec: &SinkSpec) -> Result<Box<dyn VideoSink>>;
}

/// Writes concatenated baseline JPEG frames (a raw `.mjpeg` stream).
#[derive(Debug, Clone, Copy)]
pub struct MjpegSinkFactory {
    quality: u8,
}

impl Default for MjpegSinkFactory {
    fn default() -> Self {
        Self { quality: 85 }
    }
}

impl MjpegSinkFactory {
    pub fn with_quality(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }
}

impl SinkFactory for MjpegSinkFactory {
    fn extension(&self) -> &str {
        "mjpeg"
    }

    fn open(&self, path: &Path, spec: &SinkSpec) -> Result<Box<dyn VideoSink>> {
        let open_error = |err: std::io::Error| WatchError::SinkOpen {
            path: path.to_path_buf(),
            reason: err.to_string(),
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(open_error)?;
        }
        // `create_new` refuses to reuse an existing clip.
        let file = File::options()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(open_error)?;
        Ok(Box::new(MjpegSink {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            quality: self.quality,
            frame_size: spec.frame_size,
        }))
    }
}

struct MjpegSink {
    path: PathBuf,
    writer: BufWriter<File>,
    quality: u8,
    frame_size: FrameSize,
}

impl MjpegSink {
    fn write_error(&self, reason: impl ToString) -> WatchError {
        WatchError::SinkWrite {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }
}

impl VideoSink for MjpegSink {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        let size = FrameSize::of(frame);
        if size != self.frame_size {
            return Err(self.write_error(format!(
                "frame is {size}, sink was opened for {}",
                self.frame_size
            )));
        }
        let mut encoder = JpegEncoder::new_with_quality(&mut self.writer, self.quality);
        encoder
            .encode_image(frame)
            .map_err(|err| self.write_error(err))
    }

    fn close(self: Box<Self>) -> Result<()> {
        let path = self.path;
        let file = self
            .writer
            .into_inner()
            .map_err(|err| WatchError::SinkWrite {
                path: path.clone(),
                reason: err.error().to_string(),
            })?;
        file.sync_all().map_err(|err| WatchError::SinkWrite {
            path,
            reason: err.to_string(),
        })
    }
}

/// What a [`MemorySinkFactory`] observed for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedClip {
    pub path: PathBuf,
    pub spec: SinkSpec,
    pub frames: u64,
    pub closed: bool,
}

#[derive(Debug, Default)]
struct FailurePlan {
    failing_opens: u32,
    fail_writes_after: Option<u64>,
}

/// Records sessions in memory instead of writing files.
#[derive(Debug, Clone, Default)]
pub struct MemorySinkFactory {
    clips: Arc<Mutex<Vec<RecordedClip>>>,
    plan: Arc<Mutex<FailurePlan>>,
}

impl MemorySinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clips(&self) -> Vec<RecordedClip> {
        self.clips
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn open_sessions(&self) -> usize {
        self.clips().iter().filter(|clip| !clip.closed).count()
    }

    /// Makes the next `count` opens fail.
    pub fn fail_next_opens(&self, count: u32) {
        self.plan
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .failing_opens = count;
    }

    /// Sinks opened from now on fail once they hold `frames` frames.
    pub fn fail_writes_after(&self, frames: u64) {
        self.plan
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fail_writes_after = Some(frames);
    }
}

impl SinkFactory for MemorySinkFactory {
    fn extension(&self) -> &str {
        "mem"
    }

    fn open(&self, path: &Path, spec: &SinkSpec) -> Result<Box<dyn VideoSink>> {
        let fail_writes_after = {
            let mut plan = self.plan.lock().unwrap_or_else(PoisonError::into_inner);
            if plan.failing_opens > 0 {
                plan.failing_opens -= 1;
                return Err(WatchError::SinkOpen {
                    path: path.to_path_buf(),
                    reason: "scripted open failure".into(),
                });
            }
            plan.fail_writes_after
        };

        let mut clips = self.clips.lock().unwrap_or_else(PoisonError::into_inner);
        clips.push(RecordedClip {
            path: path.to_path_buf(),
            spec: spec.clone(),
            frames: 0,
            closed: false,
        });
        Ok(Box::new(MemorySink {
            index: clips.len() - 1,
            clips: Arc::clone(&self.clips),
            fail_writes_after,
        }))
    }
}

struct MemorySink {
    index: usize,
    clips: Arc<Mutex<Vec<RecordedClip>>>,
    fail_writes_after: Option<u64>,
}

impl VideoSink for MemorySink {
    fn write(&mut self, _frame: &Frame) -> Result<()> {
        let mut clips = self.clips.lock().unwrap_or_else(PoisonError::into_inner);
        let clip = &mut clips[self.index];
        if self.fail_writes_after.is_some_and(|limit| clip.frames >= limit) {
            return Err(WatchError::SinkWrite {
                path: clip.path.clone(),
                reason: "scripted write failure".into(),
            });
        }
        clip.frames += 1;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        let mut clips = self.clips.lock().unwrap_or_else(PoisonError::into_inner);
        clips[self.index].closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(width: u32, height: u32) -> SinkSpec {
        SinkSpec {
            codec: "MJPG".into(),
            fps: 20.0,
            frame_size: FrameSize::new(width, height),
        }
    }

    #[test]
    fn memory_sink_tracks_frames_and_close() {
        let factory = MemorySinkFactory::new();
        let mut sink = factory
            .open(Path::new("clip.mem"), &spec(4, 4))
            .expect("open");
        sink.write(&Frame::new(4, 4)).expect("write");
        sink.write(&Frame::new(4, 4)).expect("write");
        assert_eq!(factory.open_sessions(), 1);
        sink.close().expect("close");

        let clips = factory.clips();
        assert_eq!(clips.len(), 1);
        assert_eq!(clips[0].frames, 2);
        assert!(clips[0].closed);
        assert_eq!(factory.open_sessions(), 0);
    }

    #[test]
    fn memory_sink_scripted_failures() {
        let factory = MemorySinkFactory::new();
        factory.fail_next_opens(1);
        assert!(matches!(
            factory.open(Path::new("a.mem"), &spec(2, 2)),
            Err(WatchError::SinkOpen { .. })
        ));

        factory.fail_writes_after(1);
        let mut sink = factory.open(Path::new("b.mem"), &spec(2, 2)).expect("open");
        sink.write(&Frame::new(2, 2)).expect("first write");
        assert!(matches!(
            sink.write(&Frame::new(2, 2)),
            Err(WatchError::SinkWrite { .. })
        ));
    }

    #[test]
    fn mjpeg_quality_is_clamped_and_used() {
        assert_eq!(MjpegSinkFactory::with_quality(0).quality, 1);
        assert_eq!(MjpegSinkFactory::with_quality(250).quality, 100);

        let dir = tempfile::tempdir().expect("tempdir");
        let frame = crate::synthetic::render_frame(FrameSize::new(64, 48), 3, true);
        let mut sizes = Vec::new();
        for (name, quality) in [("low.mjpeg", 10), ("high.mjpeg", 95)] {
            let path = dir.path().join(name);
            let mut sink = MjpegSinkFactory::with_quality(quality)
                .open(&path, &spec(64, 48))
                .expect("open");
            sink.write(&frame).expect("write");
            sink.close().expect("close");
            sizes.push(std::fs::metadata(&path).expect("metadata").len());
        }
        assert!(sizes[0] < sizes[1], "{sizes:?}");
    }
}
