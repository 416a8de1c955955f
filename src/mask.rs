use std::collections::VecDeque;

use anyhow::{ensure, Result};
use image::{imageops, GrayImage, Luma};

use crate::segment::Bounds;

/// Binary object mask with the same dimensions as the image it was predicted for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
    width: usize,
    height: usize,
    data: Vec<bool>,
}

/// Which connected regions `remove_small_regions` operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionMode {
    /// Fill background regions enclosed by (or touching) the mask.
    Holes,
    /// Drop disconnected foreground regions.
    Islands,
}

impl Mask {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![false; width * height],
        }
    }

    pub fn from_vec(width: usize, height: usize, data: Vec<bool>) -> Result<Self> {
        ensure!(
            data.len() == width * height,
            "mask data has {} values, expected {}x{}",
            data.len(),
            width,
            height
        );
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn get(&self, x: usize, y: usize) -> bool {
        self.data[y * self.width + x]
    }

    pub fn set(&mut self, x: usize, y: usize, value: bool) {
        self.data[y * self.width + x] = value;
    }

    /// Number of set pixels.
    pub fn area(&self) -> usize {
        self.data.iter().filter(|v| **v).count()
    }

    pub fn is_empty(&self) -> bool {
        !self.data.iter().any(|v| *v)
    }

    /// Tightest box containing every set pixel.
    pub fn bounds(&self) -> Option<Bounds> {
        let mut extent: Option<(usize, usize, usize, usize)> = None;
        for (i, _) in self.data.iter().enumerate().filter(|(_, v)| **v) {
            let (x, y) = (i % self.width, i / self.width);
            extent = Some(match extent {
                None => (x, y, x, y),
                Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
            });
        }
        extent.map(|(x0, y0, x1, y1)| Bounds {
            x: x0 as u32,
            y: y0 as u32,
            width: (x1 - x0 + 1) as u32,
            height: (y1 - y0 + 1) as u32,
        })
    }

    /// Raster bytes as sent over the wire: 255 for set pixels, 0 otherwise.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.data.iter().map(|v| if *v { 255 } else { 0 }).collect()
    }

    /// Nearest-neighbour rescale.
    pub fn resize(&self, width: usize, height: usize) -> Self {
        if width == self.width && height == self.height {
            return self.clone();
        }
        let gray = GrayImage::from_fn(self.width as u32, self.height as u32, |x, y| {
            Luma([if self.get(x as usize, y as usize) { 255 } else { 0 }])
        });
        let resized = imageops::resize(
            &gray,
            width as u32,
            height as u32,
            imageops::FilterType::Nearest,
        );
        Self {
            width,
            height,
            data: resized.pixels().map(|p| p.0[0] > 127).collect(),
        }
    }

    /// Clears every pixel outside the box `[x1, x2] x [y1, y2]`.
    pub fn clip(&mut self, x1: f64, y1: f64, x2: f64, y2: f64) {
        let (x1, x2) = (x1.min(x2), x1.max(x2));
        let (y1, y2) = (y1.min(y2), y1.max(y2));
        for y in 0..self.height {
            for x in 0..self.width {
                let (fx, fy) = (x as f64, y as f64);
                if fx < x1.floor() || fx > x2.ceil() || fy < y1.floor() || fy > y2.ceil() {
                    self.set(x, y, false);
                }
            }
        }
    }

    /// Removes regions smaller than `min_area` pixels. Returns whether the
    /// mask changed.
    ///
    /// In `Islands` mode, if every foreground region is below the threshold
    /// the largest one is kept.
    pub fn remove_small_regions(&mut self, min_area: usize, mode: RegionMode) -> bool {
        let target = mode == RegionMode::Holes;
        let regions = self.regions(|v| v != target);
        let (small, large): (Vec<_>, Vec<_>) =
            regions.into_iter().partition(|r| r.len() < min_area);
        if small.is_empty() {
            return false;
        }
        match mode {
            RegionMode::Holes => {
                for idx in small.iter().flatten() {
                    self.data[*idx] = true;
                }
            }
            RegionMode::Islands => {
                let keep = if large.is_empty() {
                    small.iter().max_by_key(|r| r.len()).map(|r| r.as_slice())
                } else {
                    None
                };
                for region in &small {
                    if keep.is_some_and(|k| std::ptr::eq(k, region.as_slice())) {
                        continue;
                    }
                    for idx in region {
                        self.data[*idx] = false;
                    }
                }
            }
        }
        true
    }

    /// 8-connected components of the pixels matching `pred`, as flat indices.
    fn regions(&self, pred: impl Fn(bool) -> bool) -> Vec<Vec<usize>> {
        let mut seen = vec![false; self.data.len()];
        let mut regions = Vec::new();
        let mut queue = VecDeque::new();

        for start in 0..self.data.len() {
            if seen[start] || !pred(self.data[start]) {
                continue;
            }
            seen[start] = true;
            queue.push_back(start);
            let mut region = Vec::new();

            while let Some(idx) = queue.pop_front() {
                region.push(idx);
                let (x, y) = ((idx % self.width) as isize, (idx / self.width) as isize);
                for dy in -1..=1 {
                    for dx in -1..=1 {
                        let (nx, ny) = (x + dx, y + dy);
                        if nx < 0
                            || ny < 0
                            || nx >= self.width as isize
                            || ny >= self.height as isize
                        {
                            continue;
                        }
                        let n = ny as usize * self.width + nx as usize;
                        if !seen[n] && pred(self.data[n]) {
                            seen[n] = true;
                            queue.push_back(n);
                        }
                    }
                }
            }
            regions.push(region);
        }
        regions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask(rows: &[&str]) -> Mask {
        let height = rows.len();
        let width = rows[0].len();
        let data = rows
            .iter()
            .flat_map(|row| row.chars().map(|c| c == '#'))
            .collect();
        Mask::from_vec(width, height, data).unwrap()
    }

    #[test]
    fn bounds_are_inclusive_extent() {
        let m = mask(&[
            "......", //
            "..#...", //
            "...##.", //
            "......",
        ]);
        assert_eq!(m.area(), 3);
        assert_eq!(
            m.bounds(),
            Some(Bounds {
                x: 2,
                y: 1,
                width: 3,
                height: 2
            })
        );
        assert_eq!(Mask::new(4, 4).bounds(), None);
    }

    #[test]
    fn bytes_are_row_major_0_or_255() {
        let m = mask(&["#.", ".."]);
        assert_eq!(m.to_bytes(), vec![255, 0, 0, 0]);
    }

    #[test]
    fn from_vec_rejects_wrong_length() {
        assert!(Mask::from_vec(3, 3, vec![true; 8]).is_err());
    }

    #[test]
    fn resize_keeps_blocks() {
        let m = mask(&["#.", ".#"]);
        let big = m.resize(4, 4);
        assert_eq!(big.width(), 4);
        assert_eq!(big.area(), 8);
        assert!(big.get(0, 0) && big.get(1, 1) && big.get(3, 3));
        assert!(!big.get(3, 0));
    }

    #[test]
    fn clip_clears_outside_box() {
        let mut m = mask(&["####", "####", "####"]);
        m.clip(1.0, 0.0, 2.0, 1.0);
        assert_eq!(m, mask(&[".##.", ".##.", "...."]));
    }

    #[test]
    fn small_islands_are_removed() {
        let mut m = mask(&[
            "##....", //
            "##....", //
            "......", //
            ".....#",
        ]);
        assert!(m.remove_small_regions(2, RegionMode::Islands));
        assert_eq!(m.area(), 4);
        assert!(!m.get(5, 3));
    }

    #[test]
    fn diagonal_pixels_are_one_region() {
        let mut m = mask(&["#..", ".#.", "..#"]);
        assert!(!m.remove_small_regions(3, RegionMode::Islands));
        assert_eq!(m.area(), 3);
    }

    #[test]
    fn largest_island_survives_when_all_are_small() {
        let mut m = mask(&[
            "##...#", //
            "......",
        ]);
        assert!(m.remove_small_regions(10, RegionMode::Islands));
        assert_eq!(m, mask(&["##....", "......"]));
    }

    #[test]
    fn small_holes_are_filled() {
        let mut m = mask(&[
            "#####", //
            "#.###", //
            "#####",
        ]);
        assert!(m.remove_small_regions(2, RegionMode::Holes));
        assert_eq!(m.area(), 15);
    }

    #[test]
    fn large_holes_are_kept() {
        let mut m = mask(&[
            "#####", //
            "#...#", //
            "#####",
        ]);
        assert!(!m.remove_small_regions(2, RegionMode::Holes));
        assert_eq!(m.area(), 12);
    }
}
