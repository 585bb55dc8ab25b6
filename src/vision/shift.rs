//! Measures how far the list actually moved between two captures.
//!
//! The result is drift telemetry only; row placement is always re-derived
//! from the new frame.

use image::{GrayImage, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::ocr::preprocess::{crop_region, to_gray, Region};

/// Reference strip and default search window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShiftConfig {
    /// Left edge of the strip (the avatar column carries unique texture)
    pub strip_x1: i32,
    pub strip_x2: i32,
    /// First usable line below the header chrome
    pub band_top: i32,
    /// Pixels excluded above the bottom edge (footer chrome)
    pub footer_margin: i32,
    /// Expected displacement of one scroll step
    pub expected_offset: i32,
    pub search_radius: i32,
}

impl Default for ShiftConfig {
    fn default() -> Self {
        Self {
            strip_x1: 0,
            strip_x2: 350,
            band_top: 380,
            footer_margin: 200,
            expected_offset: 1615,
            search_radius: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ShiftMeasurement {
    /// Upward displacement of the content in pixels
    pub offset_px: i32,
    /// Mean absolute difference at that offset (0 = identical)
    pub residual: f32,
}

#[derive(Debug, Clone)]
pub struct ShiftEstimator {
    config: ShiftConfig,
}

impl ShiftEstimator {
    pub fn new(config: ShiftConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ShiftConfig {
        &self.config
    }

    fn strip(&self, img: &RgbaImage) -> GrayImage {
        let bottom = img.height() as i32 - self.config.footer_margin;
        let region = Region::new(
            self.config.strip_x1,
            self.config.band_top,
            self.config.strip_x2,
            bottom.max(self.config.band_top),
        );
        to_gray(&crop_region(img, &region))
    }

    /// Best offset in `[expected - radius, expected + radius)`.
    ///
    /// Returns `None` when no candidate offset leaves an overlapping window.
    pub fn estimate(
        &self,
        before: &RgbaImage,
        after: &RgbaImage,
        expected_offset: i32,
        search_radius: i32,
    ) -> Option<ShiftMeasurement> {
        let strip_before = self.strip(before);
        let strip_after = self.strip(after);
        best_offset(
            &strip_before,
            &strip_after,
            expected_offset - search_radius,
            expected_offset + search_radius,
        )
    }

    /// `estimate` with the configured window.
    pub fn estimate_default(&self, before: &RgbaImage, after: &RgbaImage) -> Option<ShiftMeasurement> {
        self.estimate(
            before,
            after,
            self.config.expected_offset,
            self.config.search_radius,
        )
    }
}

/// Mean absolute difference between `before[offset..]` and `after[..len - offset]`.
///
/// A negative offset compares `before[..len + offset]` with `after[-offset..]`.
fn window_residual(before: &GrayImage, after: &GrayImage, offset: i32) -> Option<f32> {
    let width = before.width().min(after.width());
    let len = before.height().min(after.height()) as i64;
    let shift = offset as i64;
    if width == 0 || shift.abs() >= len {
        return None;
    }

    let rows = (len - shift.abs()) as u32;
    let (before_start, after_start) = if shift >= 0 {
        (shift as u32, 0)
    } else {
        (0, (-shift) as u32)
    };

    let mut total: u64 = 0;
    for row in 0..rows {
        for x in 0..width {
            let a = before.get_pixel(x, before_start + row)[0] as i32;
            let b = after.get_pixel(x, after_start + row)[0] as i32;
            total += (a - b).unsigned_abs() as u64;
        }
    }

    Some(total as f32 / (rows as u64 * width as u64) as f32)
}

fn best_offset(before: &GrayImage, after: &GrayImage, from: i32, to: i32) -> Option<ShiftMeasurement> {
    let mut best: Option<ShiftMeasurement> = None;

    for offset in from..to {
        let Some(residual) = window_residual(before, after, offset) else {
            continue;
        };
        if best.is_none_or(|b| residual < b.residual) {
            best = Some(ShiftMeasurement {
                offset_px: offset,
                residual,
            });
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgba};

    /// Deterministic texture that never repeats vertically within a few hundred lines.
    fn texture(y: i64, x: u32) -> u8 {
        let v = (y * 7919 + (x as i64) * 104_729 + (y * y) % 251) % 256;
        v.rem_euclid(256) as u8
    }

    fn frame_scrolled_by(height: u32, scroll: i64) -> RgbaImage {
        RgbaImage::from_fn(400, height, |x, y| {
            let v = texture(y as i64 + scroll, x);
            Rgba([v, v, v, 255])
        })
    }

    #[test]
    fn test_recovers_known_scroll() {
        let estimator = ShiftEstimator::new(ShiftConfig {
            band_top: 50,
            footer_margin: 50,
            ..ShiftConfig::default()
        });
        let before = frame_scrolled_by(800, 0);
        let after = frame_scrolled_by(800, 203);

        let shift = estimator.estimate(&before, &after, 200, 10).unwrap();
        assert_eq!(shift.offset_px, 203);
        assert_eq!(shift.residual, 0.0);
    }

    #[test]
    fn test_handles_negative_offsets() {
        let before = GrayImage::from_fn(20, 100, |x, y| Luma([texture(y as i64, x)]));
        let after = GrayImage::from_fn(20, 100, |x, y| Luma([texture(y as i64 - 6, x)]));

        let shift = best_offset(&before, &after, -10, 10).unwrap();
        assert_eq!(shift.offset_px, -6);
    }

    #[test]
    fn test_degenerate_windows_are_skipped() {
        let before = GrayImage::from_pixel(10, 50, Luma([0]));
        let after = GrayImage::from_pixel(10, 50, Luma([255]));

        // Every offset is at least the strip length: nothing to compare.
        assert!(best_offset(&before, &after, 50, 60).is_none());

        // Only the offsets below the length are scored, never as zero.
        let shift = best_offset(&before, &after, 45, 60).unwrap();
        assert!(shift.offset_px < 50);
        assert_eq!(shift.residual, 255.0);
    }

    #[test]
    fn test_empty_window_range() {
        let estimator = ShiftEstimator::new(ShiftConfig::default());
        let img = frame_scrolled_by(600, 0);
        assert!(estimator.estimate(&img, &img, 100, 0).is_none());
    }
}
