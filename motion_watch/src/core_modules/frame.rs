// THEORY:
// A frame is a plain `image::RgbImage`. Every camera delivers frames at whatever
// resolution its driver picks; the acquisition layer normalises them to the
// configured `FrameSize` before anything else looks at them, so the background
// model, the recorder and the compositor can all assume one fixed size per source.
//
// Devices are identified by a `DeviceId` that the provider guarantees to be
// stable across enumerations (a device path, a serial, ...). The discovery
// position (`index`) is informational only and may change between reconciles.

use crate::core_modules::overlay::{self, TextStyle};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use std::fmt;

pub type Frame = RgbImage;

/// Stable identity of a capture device.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A device as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    /// Position in the provider's enumeration order.
    pub index: u32,
    /// Human-readable name, when the platform exposes one.
    pub name: Option<String>,
}

impl DeviceInfo {
    pub fn new(id: impl Into<String>, index: u32) -> Self {
        Self {
            id: DeviceId::new(id),
            index,
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The device name, or `Cam<n>` numbered from one.
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("Cam{}", self.index + 1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn of(frame: &Frame) -> Self {
        Self::new(frame.width(), frame.height())
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A zero-valued (black) frame.
pub fn blank_frame(size: FrameSize) -> Frame {
    RgbImage::new(size.width, size.height)
}

/// A black frame with `text` centred on it, used for "no data" style slots.
pub fn placeholder_frame(size: FrameSize, text: &str) -> Frame {
    let mut frame = blank_frame(size);
    let style = TextStyle {
        color: Rgb([255, 255, 255]),
        scale: 2,
        background: None,
    };
    overlay::draw_text_centered(&mut frame, text, &style);
    frame
}

/// Resizes `frame` to `size` unless it already matches.
pub fn fit_to(frame: Frame, size: FrameSize) -> Frame {
    if FrameSize::of(&frame) == size {
        return frame;
    }
    imageops::resize(&frame, size.width, size.height, FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_falls_back_to_one_based_index() {
        let anonymous = DeviceInfo::new("/dev/video2", 2);
        assert_eq!(anonymous.display_name(), "Cam3");
        let named = DeviceInfo::new("/dev/video0", 0).with_name("Logitech C920");
        assert_eq!(named.display_name(), "Logitech C920");
    }

    #[test]
    fn fit_to_resizes_only_when_needed() {
        let size = FrameSize::new(32, 24);
        let exact = blank_frame(size);
        assert_eq!(FrameSize::of(&fit_to(exact, size)), size);

        let large = blank_frame(FrameSize::new(64, 48));
        assert_eq!(FrameSize::of(&fit_to(large, size)), size);
    }

    #[test]
    fn placeholder_draws_something() {
        let frame = placeholder_frame(FrameSize::new(160, 120), "NO DATA");
        assert!(frame.pixels().any(|p| p.0 != [0, 0, 0]));
    }
}
