// THEORY:
// A `SyntheticRig` is a scriptable bench of fake cameras. Each device renders
// a static gradient and, while it is "moving", a bright square sliding across
// it. The rig can plug, unplug, break or hang devices at any time, which is
// what the pool and driver tests are built on. The runner uses the same rig
// for `--synthetic` demos with an automatic motion pattern.

use crate::capture::{DeviceProvider, FrameSource, TimedSource};
use crate::core_modules::frame::{DeviceId, DeviceInfo, Frame, FrameSize};
use crate::error::{Result, WatchError};
use image::Rgb;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const SQUARE_SIDE: u32 = 40;
const SQUARE_STEP: u64 = 7;
const HANG_POLL: Duration = Duration::from_millis(5);

/// Repeating motion: `burst` moving frames out of every `period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionPattern {
    pub period: u64,
    pub burst: u64,
}

impl MotionPattern {
    fn is_moving(&self, frame_index: u64) -> bool {
        self.period > 0 && frame_index % self.period < self.burst
    }
}

#[derive(Debug, Clone)]
struct DeviceState {
    info: DeviceInfo,
    plugged: bool,
    motion: bool,
    pattern: Option<MotionPattern>,
    failing: bool,
    hung: bool,
    unopenable: bool,
    frames_served: u64,
    opens: u32,
}

#[derive(Debug)]
struct RigState {
    size: FrameSize,
    devices: Vec<DeviceState>,
}

/// Shared control surface for a set of synthetic devices.
#[derive(Debug, Clone)]
pub struct SyntheticRig {
    state: Arc<Mutex<RigState>>,
}

impl SyntheticRig {
    pub fn new(size: FrameSize) -> Self {
        Self {
            state: Arc::new(Mutex::new(RigState {
                size,
                devices: Vec::new(),
            })),
        }
    }

    /// A rig with `count` plugged devices named `Cam1..=CamN`.
    pub fn with_devices(count: usize, size: FrameSize) -> Self {
        let rig = Self::new(size);
        for n in 0..count {
            rig.add_device(format!("Cam{}", n + 1));
        }
        rig
    }

    fn lock(&self) -> MutexGuard<'_, RigState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, id: &DeviceId, f: impl FnOnce(&mut DeviceState)) {
        let mut state = self.lock();
        match state.devices.iter_mut().find(|d| d.info.id == *id) {
            Some(device) => f(device),
            None => tracing::warn!(device = %id, "unknown synthetic device"),
        }
    }

    /// Adds a plugged device and returns its id (`synthetic:<n>`).
    pub fn add_device(&self, name: impl Into<String>) -> DeviceId {
        let mut state = self.lock();
        let index = state.devices.len() as u32;
        let info = DeviceInfo::new(format!("synthetic:{index}"), index).with_name(name);
        let id = info.id.clone();
        state.devices.push(DeviceState {
            info,
            plugged: true,
            motion: false,
            pattern: None,
            failing: false,
            hung: false,
            unopenable: false,
            frames_served: 0,
            opens: 0,
        });
        id
    }

    /// Ids of every device ever added, plugged or not.
    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.lock().devices.iter().map(|d| d.info.id.clone()).collect()
    }

    pub fn plug(&self, id: &DeviceId) {
        self.update(id, |d| d.plugged = true);
    }

    /// Removes the device from discovery; open sources fail their next read.
    pub fn unplug(&self, id: &DeviceId) {
        self.update(id, |d| d.plugged = false);
    }

    pub fn set_motion(&self, id: &DeviceId, motion: bool) {
        self.update(id, |d| d.motion = motion);
    }

    pub fn set_motion_pattern(&self, id: &DeviceId, pattern: Option<MotionPattern>) {
        self.update(id, |d| d.pattern = pattern);
    }

    /// Reads fail and reopening is refused while set; discovery still lists it.
    pub fn set_failing(&self, id: &DeviceId, failing: bool) {
        self.update(id, |d| d.failing = failing);
    }

    /// Reads block until cleared.
    pub fn set_hung(&self, id: &DeviceId, hung: bool) {
        self.update(id, |d| d.hung = hung);
    }

    pub fn set_unopenable(&self, id: &DeviceId, unopenable: bool) {
        self.update(id, |d| d.unopenable = unopenable);
    }

    pub fn frames_served(&self, id: &DeviceId) -> u64 {
        self.lock()
            .devices
            .iter()
            .find(|d| d.info.id == *id)
            .map_or(0, |d| d.frames_served)
    }

    pub fn opens(&self, id: &DeviceId) -> u32 {
        self.lock()
            .devices
            .iter()
            .find(|d| d.info.id == *id)
            .map_or(0, |d| d.opens)
    }

    /// A provider over this rig. Reads are not time-bounded.
    pub fn provider(&self) -> SyntheticProvider {
        SyntheticProvider {
            rig: self.clone(),
            timed: false,
        }
    }

    /// A provider whose sources run behind [`TimedSource`].
    pub fn timed_provider(&self) -> SyntheticProvider {
        SyntheticProvider {
            rig: self.clone(),
            timed: true,
        }
    }
}

/// Renders one synthetic frame. Pure, so tests can predict pixels.
pub fn render_frame(size: FrameSize, frame_index: u64, moving: bool) -> Frame {
    let (w, h) = (size.width.max(1), size.height.max(1));
    let mut frame = Frame::from_fn(size.width, size.height, |x, y| {
        Rgb([(x * 120 / w) as u8, (y * 120 / h) as u8, 60])
    });
    if moving {
        let side = SQUARE_SIDE.min(size.width / 2).min(size.height / 2);
        let travel = u64::from(size.width - side).max(1);
        let x0 = (frame_index * SQUARE_STEP % travel) as u32;
        let y0 = (size.height - side) / 2;
        for y in y0..y0 + side {
            for x in x0..x0 + side {
                frame.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
    }
    frame
}

#[derive(Debug, Clone)]
pub struct SyntheticProvider {
    rig: SyntheticRig,
    timed: bool,
}

impl DeviceProvider for SyntheticProvider {
    fn discover(&mut self) -> Vec<DeviceInfo> {
        self.rig
            .lock()
            .devices
            .iter()
            .filter(|d| d.plugged)
            .map(|d| d.info.clone())
            .collect()
    }

    fn open(&mut self, device: &DeviceInfo, read_timeout: Duration) -> Result<Box<dyn FrameSource>> {
        {
            let mut state = self.rig.lock();
            let Some(entry) = state.devices.iter_mut().find(|d| d.info.id == device.id) else {
                return Err(WatchError::SourceUnavailable(format!("{} is unknown", device.id)));
            };
            if !entry.plugged || entry.failing || entry.unopenable {
                return Err(WatchError::SourceUnavailable(format!("{} refused to open", device.id)));
            }
            entry.opens += 1;
        }

        let source = SyntheticSource {
            rig: self.rig.clone(),
            id: device.id.clone(),
            frame_index: 0,
            released: false,
        };
        if self.timed {
            let timed = TimedSource::spawn(device.id.as_str(), Box::new(source), read_timeout)?;
            Ok(Box::new(timed))
        } else {
            Ok(Box::new(source))
        }
    }
}

struct SyntheticSource {
    rig: SyntheticRig,
    id: DeviceId,
    frame_index: u64,
    released: bool,
}

impl FrameSource for SyntheticSource {
    fn read(&mut self) -> Result<Frame> {
        loop {
            if self.released {
                return Err(WatchError::SourceDisconnected(format!("{} was released", self.id)));
            }
            let mut state = self.rig.lock();
            let size = state.size;
            let Some(device) = state.devices.iter_mut().find(|d| d.info.id == self.id) else {
                return Err(WatchError::SourceDisconnected(format!("{} vanished", self.id)));
            };
            if !device.plugged || device.failing {
                return Err(WatchError::SourceDisconnected(format!("{} stopped delivering frames", self.id)));
            }
            if device.hung {
                drop(state);
                std::thread::sleep(HANG_POLL);
                continue;
            }

            let moving = device.motion
                || device
                    .pattern
                    .is_some_and(|pattern| pattern.is_moving(self.frame_index));
            device.frames_served += 1;
            drop(state);

            let frame = render_frame(size, self.frame_index, moving);
            self.frame_index += 1;
            return Ok(frame);
        }
    }

    fn is_open(&self) -> bool {
        !self.released
    }

    fn release(&mut self) {
        self.released = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_tracks_plugging() {
        let rig = SyntheticRig::with_devices(2, FrameSize::new(64, 48));
        let ids = rig.device_ids();
        let mut provider = rig.provider();
        assert_eq!(provider.discover().len(), 2);

        rig.unplug(&ids[0]);
        let found = provider.discover();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, ids[1]);
        assert_eq!(found[0].display_name(), "Cam2");
    }

    #[test]
    fn failing_device_refuses_reads_and_reopen() {
        let rig = SyntheticRig::with_devices(1, FrameSize::new(64, 48));
        let id = rig.device_ids().remove(0);
        let mut provider = rig.provider();
        let device = provider.discover().remove(0);
        let mut source = provider.open(&device, Duration::from_secs(1)).expect("open");
        assert!(source.read().is_ok());

        rig.set_failing(&id, true);
        assert!(matches!(source.read(), Err(WatchError::SourceDisconnected(_))));
        assert!(provider.open(&device, Duration::from_secs(1)).is_err());
        assert_eq!(rig.frames_served(&id), 1);
        assert_eq!(rig.opens(&id), 1);
    }

    #[test]
    fn moving_frames_carry_the_square() {
        let size = FrameSize::new(96, 72);
        let still = render_frame(size, 0, false);
        let moving = render_frame(size, 0, true);
        assert_eq!(still.get_pixel(20, 36).0, [25, 60, 60]);
        assert_eq!(moving.get_pixel(20, 36).0, [255, 255, 255]);
        assert_eq!(render_frame(size, 3, false), still);
    }

    #[test]
    fn pattern_repeats() {
        let pattern = MotionPattern { period: 10, burst: 3 };
        let moving: Vec<u64> = (0..20).filter(|i| pattern.is_moving(*i)).collect();
        assert_eq!(moving, vec![0, 1, 2, 10, 11, 12]);
    }
}
