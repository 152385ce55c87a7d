// THEORY:
// Overlays are the only drawing the engine does itself: the timestamp on the
// composite, camera labels, the motion border and placeholder captions. They
// only need digits, upper-case letters and a little punctuation, so a fixed
// 5x7 bitmap font is enough and keeps the engine free of font files.
//
// All drawing clips against the image bounds; nothing here can panic on
// small frames.

use image::{Rgb, RgbImage};

pub const GLYPH_WIDTH: u32 = 5;
pub const GLYPH_HEIGHT: u32 = 7;
const GLYPH_SPACING: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextStyle {
    pub color: Rgb<u8>,
    /// Integer magnification of the 5x7 glyphs.
    pub scale: u32,
    /// Optional filled box drawn behind the text.
    pub background: Option<Rgb<u8>>,
}

impl Default for TextStyle {
    fn default() -> Self {
        Self {
            color: Rgb([255, 255, 255]),
            scale: 1,
            background: None,
        }
    }
}

/// Rows of a glyph, top to bottom, five low bits each (MSB is the leftmost column).
fn glyph(c: char) -> [u8; 7] {
    match c.to_ascii_uppercase() {
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1C, 0x12, 0x11, 0x11, 0x11, 0x12, 0x1C],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        'X' => [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
        'Y' => [0x11, 0x11, 0x11, 0x0A, 0x04, 0x04, 0x04],
        'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        '_' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1F],
        '/' => [0x00, 0x01, 0x02, 0x04, 0x08, 0x10, 0x00],
        '\'' => [0x04, 0x04, 0x08, 0x00, 0x00, 0x00, 0x00],
        ' ' => [0x00; 7],
        _ => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x00, 0x04],
    }
}

/// Width and height in pixels of `text` rendered at `scale`.
pub fn text_extent(text: &str, scale: u32) -> (u32, u32) {
    let count = text.chars().count() as u32;
    if count == 0 {
        return (0, 0);
    }
    let advance = (GLYPH_WIDTH + GLYPH_SPACING) * scale;
    (count * advance - GLYPH_SPACING * scale, GLYPH_HEIGHT * scale)
}

fn put_pixel_clipped(img: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>) {
    if x < 0 || y < 0 || x >= i64::from(img.width()) || y >= i64::from(img.height()) {
        return;
    }
    img.put_pixel(x as u32, y as u32, color);
}

fn fill_rect_clipped(img: &mut RgbImage, x: i64, y: i64, w: u32, h: u32, color: Rgb<u8>) {
    for dy in 0..i64::from(h) {
        for dx in 0..i64::from(w) {
            put_pixel_clipped(img, x + dx, y + dy, color);
        }
    }
}

/// Draws `text` with its top-left corner at `(x, y)`.
pub fn draw_text(img: &mut RgbImage, x: i64, y: i64, text: &str, style: &TextStyle) {
    let scale = style.scale.max(1);
    if let Some(background) = style.background {
        let (w, h) = text_extent(text, scale);
        fill_rect_clipped(img, x - 2, y - 2, w + 4, h + 4, background);
    }

    let advance = i64::from((GLYPH_WIDTH + GLYPH_SPACING) * scale);
    for (i, c) in text.chars().enumerate() {
        let origin_x = x + i as i64 * advance;
        for (row, bits) in glyph(c).iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if bits & (0x10 >> col) == 0 {
                    continue;
                }
                fill_rect_clipped(
                    img,
                    origin_x + i64::from(col * scale),
                    y + row as i64 * i64::from(scale),
                    scale,
                    scale,
                    style.color,
                );
            }
        }
    }
}

pub fn draw_text_centered(img: &mut RgbImage, text: &str, style: &TextStyle) {
    let (w, h) = text_extent(text, style.scale.max(1));
    let x = (i64::from(img.width()) - i64::from(w)) / 2;
    let y = (i64::from(img.height()) - i64::from(h)) / 2;
    draw_text(img, x, y, text, style);
}

/// Outlines the whole image with a `thickness`-pixel frame.
pub fn draw_border(img: &mut RgbImage, color: Rgb<u8>, thickness: u32) {
    let (w, h) = img.dimensions();
    let t = thickness.min(w).min(h);
    fill_rect_clipped(img, 0, 0, w, t, color);
    fill_rect_clipped(img, 0, i64::from(h - t), w, t, color);
    fill_rect_clipped(img, 0, 0, t, h, color);
    fill_rect_clipped(img, i64::from(w - t), 0, t, h, color);
}
