// THEORY:
// The compositor tiles the latest frame of every active camera into one image
// for display and combined recording. It is stateless and never resizes: the
// acquisition layer already normalised every frame, so each cell takes the
// first frame's size and the grid is simply `cols` by `rows` of them.
//
// The grid is the smallest near-square that fits: `cols = ceil(sqrt(n))`,
// `rows = ceil(n / cols)`. Unused cells stay black. With no cameras at all a
// placeholder of the configured frame size is produced instead, so consumers
// always get an image. Every output carries a wall-clock timestamp.

use crate::core_modules::frame::{self, Frame, FrameSize};
use crate::core_modules::overlay::{self, TextStyle};
use chrono::{DateTime, Local};
use image::imageops;

pub const OVERLAY_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const TIMESTAMP_ANCHOR: (i64, i64) = (10, 8);

#[derive(Debug, Clone)]
pub struct CompositeFrame {
    pub image: Frame,
    pub rows: u32,
    pub cols: u32,
    /// Blank cells appended after the last source.
    pub padding: u32,
    pub sources: usize,
}

/// `(rows, cols)` of the grid for `n` tiles; `(0, 0)` for none.
pub fn grid_for(n: usize) -> (usize, usize) {
    if n == 0 {
        return (0, 0);
    }
    // Float sqrt can land one off for large n; settle on the exact ceiling.
    let mut cols = (n as f64).sqrt() as usize;
    while cols * cols < n {
        cols += 1;
    }
    while cols > 1 && (cols - 1) * (cols - 1) >= n {
        cols -= 1;
    }
    (n.div_ceil(cols), cols)
}

#[derive(Debug, Clone)]
pub struct FrameCompositor {
    placeholder_size: FrameSize,
    timestamp_style: TextStyle,
}

impl FrameCompositor {
    pub fn new(placeholder_size: FrameSize) -> Self {
        Self {
            placeholder_size,
            timestamp_style: TextStyle::default(),
        }
    }

    pub fn compose(&self, frames: &[&Frame]) -> CompositeFrame {
        self.compose_at(frames, Local::now())
    }

    pub fn compose_at(&self, frames: &[&Frame], now: DateTime<Local>) -> CompositeFrame {
        let mut composite = match frames.first() {
            None => CompositeFrame {
                image: frame::placeholder_frame(self.placeholder_size, "NO SOURCES"),
                rows: 0,
                cols: 0,
                padding: 0,
                sources: 0,
            },
            Some(first) => {
                let cell = FrameSize::of(first);
                let (rows, cols) = grid_for(frames.len());
                let mut image = frame::blank_frame(FrameSize::new(
                    cell.width * cols as u32,
                    cell.height * rows as u32,
                ));
                for (index, tile) in frames.iter().enumerate() {
                    let x = (index % cols) as i64 * i64::from(cell.width);
                    let y = (index / cols) as i64 * i64::from(cell.height);
                    imageops::replace(&mut image, *tile, x, y);
                }
                CompositeFrame {
                    image,
                    rows: rows as u32,
                    cols: cols as u32,
                    padding: (rows * cols - frames.len()) as u32,
                    sources: frames.len(),
                }
            }
        };

        let stamp = now.format(OVERLAY_TIMESTAMP_FORMAT).to_string();
        let (x, y) = TIMESTAMP_ANCHOR;
        overlay::draw_text(&mut composite.image, x, y, &stamp, &self.timestamp_style);
        composite
    }
}
