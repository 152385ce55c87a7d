// THEORY:
// The `blob_detector` is the spatial half of motion detection. The background
// model says, pixel by pixel, *what* changed; this module decides whether the
// changed pixels form anything large enough to matter.
//
// Algorithm steps:
// 1.  **Noise reduction**: a morphological opening (erosion followed by dilation
//     with the same square kernel) removes speckles smaller than the kernel while
//     leaving larger shapes at roughly their original extent. Both passes are
//     separable min/max filters, so the cost is linear in the kernel width.
// 2.  **Region growing**: every unvisited foreground pixel seeds a region that is
//     grown over its 8-connected foreground neighbours with an explicit stack.
//     A `visited` grid guarantees each pixel is claimed by exactly one region.
// 3.  **Aggregation**: each region reports its area (pixel count) and bounding
//     box. The detector is stateless; it has no memory of previous frames.

use crate::core_modules::background_model::{BACKGROUND, FOREGROUND};
use image::GrayImage;

/// A pixel coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

/// A connected group of foreground pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    /// Number of pixels in the region.
    pub area: u32,
    /// Top-left and bottom-right corners, inclusive.
    pub bounding_box: (Point, Point),
}

#[derive(Clone, Copy)]
enum Extremum {
    Min,
    Max,
}

/// One separable pass of a min or max filter along rows (`horizontal`) or columns.
fn filter_pass(mask: &GrayImage, kernel: u32, extremum: Extremum, horizontal: bool) -> GrayImage {
    let (width, height) = mask.dimensions();
    let before = kernel / 2;
    let after = kernel.saturating_sub(1) - before;
    let mut out = GrayImage::new(width, height);

    for y in 0..height {
        for x in 0..width {
            let (center, limit) = if horizontal { (x, width) } else { (y, height) };
            let start = center.saturating_sub(before);
            let end = (center + after).min(limit - 1);
            let mut value = match extremum {
                Extremum::Min => u8::MAX,
                Extremum::Max => u8::MIN,
            };
            for i in start..=end {
                let sample = if horizontal {
                    mask.get_pixel(i, y).0[0]
                } else {
                    mask.get_pixel(x, i).0[0]
                };
                value = match extremum {
                    Extremum::Min => value.min(sample),
                    Extremum::Max => value.max(sample),
                };
            }
            out.put_pixel(x, y, image::Luma([value]));
        }
    }
    out
}

pub fn erode(mask: &GrayImage, kernel: u32) -> GrayImage {
    let rows = filter_pass(mask, kernel, Extremum::Min, true);
    filter_pass(&rows, kernel, Extremum::Min, false)
}

pub fn dilate(mask: &GrayImage, kernel: u32) -> GrayImage {
    let rows = filter_pass(mask, kernel, Extremum::Max, true);
    filter_pass(&rows, kernel, Extremum::Max, false)
}

/// Morphological opening with a `kernel` x `kernel` square structuring element.
pub fn open(mask: &GrayImage, kernel: u32) -> GrayImage {
    if kernel <= 1 || mask.width() == 0 || mask.height() == 0 {
        return mask.clone();
    }
    dilate(&erode(mask, kernel), kernel)
}

/// Finds every 8-connected region of non-background pixels.
pub fn find_regions(mask: &GrayImage) -> Vec<Region> {
    let (width, height) = mask.dimensions();
    let mut visited = vec![false; (width as usize) * (height as usize)];
    let index = |x: u32, y: u32| (y as usize) * (width as usize) + x as usize;
    let mut regions = Vec::new();

    for y in 0..height {
        for x in 0..width {
            if visited[index(x, y)] || mask.get_pixel(x, y).0[0] == BACKGROUND {
                continue;
            }
            regions.push(grow_region(mask, Point { x, y }, &mut visited));
        }
    }
    regions
}

/// Depth-first flood fill from `seed`, claiming pixels in `visited`.
fn grow_region(mask: &GrayImage, seed: Point, visited: &mut [bool]) -> Region {
    let (width, height) = mask.dimensions();
    let index = |p: Point| (p.y as usize) * (width as usize) + p.x as usize;

    let mut stack = vec![seed];
    visited[index(seed)] = true;
    let mut area = 0u32;
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (seed.x, seed.y, seed.x, seed.y);

    while let Some(current) = stack.pop() {
        area += 1;
        min_x = min_x.min(current.x);
        min_y = min_y.min(current.y);
        max_x = max_x.max(current.x);
        max_y = max_y.max(current.y);

        for dy in -1i64..=1 {
            for dx in -1i64..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let nx = i64::from(current.x) + dx;
                let ny = i64::from(current.y) + dy;
                if nx < 0 || ny < 0 || nx >= i64::from(width) || ny >= i64::from(height) {
                    continue;
                }
                let neighbour = Point {
                    x: nx as u32,
                    y: ny as u32,
                };
                let slot = index(neighbour);
                if !visited[slot] && mask.get_pixel(neighbour.x, neighbour.y).0[0] != BACKGROUND {
                    visited[slot] = true;
                    stack.push(neighbour);
                }
            }
        }
    }

    Region {
        area,
        bounding_box: (Point { x: min_x, y: min_y }, Point { x: max_x, y: max_y }),
    }
}

/// Marks the rectangle `[x0, x1) x [y0, y1)` as foreground. Test and demo helper.
pub fn fill_foreground(mask: &mut GrayImage, x0: u32, y0: u32, x1: u32, y1: u32) {
    for y in y0..y1.min(mask.height()) {
        for x in x0..x1.min(mask.width()) {
            mask.put_pixel(x, y, image::Luma([FOREGROUND]));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opening_removes_specks_and_keeps_blocks() {
        let mut mask = GrayImage::new(40, 40);
        fill_foreground(&mut mask, 2, 2, 5, 5); // 3x3 speck
        fill_foreground(&mut mask, 20, 20, 30, 30); // 10x10 block

        let opened = open(&mask, 5);
        let regions = find_regions(&opened);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].area, 100);
        assert_eq!(
            regions[0].bounding_box,
            (Point { x: 20, y: 20 }, Point { x: 29, y: 29 })
        );
    }

    #[test]
    fn diagonal_neighbours_join_one_region() {
        let mut mask = GrayImage::new(4, 4);
        fill_foreground(&mut mask, 0, 0, 1, 1);
        fill_foreground(&mut mask, 1, 1, 2, 2);
        fill_foreground(&mut mask, 3, 3, 4, 4);
        let mut areas: Vec<u32> = find_regions(&mask).iter().map(|r| r.area).collect();
        areas.sort_unstable();
        assert_eq!(areas, vec![1, 2]);
    }

    #[test]
    fn empty_and_degenerate_masks() {
        assert!(find_regions(&GrayImage::new(10, 10)).is_empty());
        assert!(find_regions(&GrayImage::new(0, 0)).is_empty());
        assert_eq!(open(&GrayImage::new(0, 0), 5).dimensions(), (0, 0));
    }
}
