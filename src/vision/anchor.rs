//! Re-finds the last committed row on a new frame by template correlation.

use image::GrayImage;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::{extrapolate_grid, ListGeometry, RowLocator, RowPosition};
use crate::device::Frame;
use crate::ocr::preprocess::{crop_region, to_gray, Region};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorConfig {
    /// Horizontal extent of the template (name and value area of a row)
    pub x1: i32,
    pub x2: i32,
    /// Rows are cropped this far below their top edge to avoid separator lines
    pub inset: i32,
    pub height: i32,
    /// Matches scoring below this are treated as lost
    pub min_confidence: f32,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            x1: 300,
            x2: 1000,
            inset: 20,
            height: 120,
            min_confidence: 0.7,
        }
    }
}

/// A cropped row used as the search pattern.
#[derive(Debug, Clone)]
pub struct AnchorTemplate {
    pixels: GrayImage,
    x: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnchorMatch {
    /// Top edge of the matched row
    pub y: f32,
    /// Zero-mean normalized correlation in `[-1, 1]`
    pub confidence: f32,
}

#[derive(Debug, Clone)]
pub struct VisualAnchorMatcher {
    config: AnchorConfig,
}

impl VisualAnchorMatcher {
    pub fn new(config: AnchorConfig) -> Self {
        Self { config }
    }

    /// Crops the template for the row whose top edge is `row_y`.
    pub fn extract_template(&self, frame: &Frame, row_y: f32) -> Option<AnchorTemplate> {
        let cfg = &self.config;
        let top = row_y.round() as i32 + cfg.inset;
        let region = Region::new(cfg.x1, top, cfg.x2, top + cfg.height);
        if region.x1 < 0 || region.y1 < 0 || region.x2 > frame.width() as i32 || region.y2 > frame.height() as i32 {
            return None;
        }
        let pixels = to_gray(&crop_region(&frame.image, &region));
        if pixels.width() == 0 || pixels.height() == 0 {
            return None;
        }
        Some(AnchorTemplate {
            pixels,
            x: cfg.x1 as u32,
        })
    }

    /// Best-scoring position of `template` on `frame`, regardless of threshold.
    ///
    /// Rows only move vertically, so the search runs down the template's own column.
    pub fn best_match(&self, frame: &Frame, template: &AnchorTemplate) -> Option<AnchorMatch> {
        let (tw, th) = template.pixels.dimensions();
        if template.x + tw > frame.width() || th > frame.height() {
            return None;
        }
        let column = to_gray(&crop_region(
            &frame.image,
            &Region::new(template.x as i32, 0, (template.x + tw) as i32, frame.height() as i32),
        ));

        let (match_y, score) = zncc_search_vertical(&column, &template.pixels)?;
        Some(AnchorMatch {
            y: match_y as f32 - self.config.inset as f32,
            confidence: score,
        })
    }

    /// Where `template` is now, or `None` when the match is too weak to trust.
    pub fn locate(&self, frame: &Frame, template: &AnchorTemplate) -> Option<AnchorMatch> {
        match self.best_match(frame, template) {
            Some(m) if m.confidence >= self.config.min_confidence => Some(m),
            Some(m) => {
                warn!("Anchor match failed (low confidence: {:.2})", m.confidence);
                None
            }
            None => None,
        }
    }
}

/// Slides `template` down `column` (same width) and returns the top offset
/// with the highest zero-mean normalized cross-correlation.
///
/// Flat windows score 0; a flat template cannot be matched at all.
fn zncc_search_vertical(column: &GrayImage, template: &GrayImage) -> Option<(u32, f32)> {
    let (w, th) = template.dimensions();
    if column.width() != w || column.height() < th || w == 0 || th == 0 {
        return None;
    }
    let n = (w * th) as f64;

    let t: Vec<f64> = template.pixels().map(|p| p[0] as f64).collect();
    let t_mean = t.iter().sum::<f64>() / n;
    let t_zero: Vec<f64> = t.iter().map(|v| v - t_mean).collect();
    let t_norm = t_zero.iter().map(|v| v * v).sum::<f64>().sqrt();
    if t_norm == 0.0 {
        return None;
    }

    let ch = column.height();
    let raw = column.as_raw();
    let row_sum: Vec<f64> = (0..ch)
        .map(|y| raw[(y * w) as usize..((y + 1) * w) as usize].iter().map(|&v| v as f64).sum())
        .collect();
    let row_sq: Vec<f64> = (0..ch)
        .map(|y| {
            raw[(y * w) as usize..((y + 1) * w) as usize]
                .iter()
                .map(|&v| (v as f64) * (v as f64))
                .sum()
        })
        .collect();

    let mut best: Option<(u32, f32)> = None;
    let mut sum: f64 = row_sum[..th as usize].iter().sum();
    let mut sq: f64 = row_sq[..th as usize].iter().sum();

    for top in 0..=(ch - th) {
        if top > 0 {
            sum += row_sum[(top + th - 1) as usize] - row_sum[(top - 1) as usize];
            sq += row_sq[(top + th - 1) as usize] - row_sq[(top - 1) as usize];
        }

        let variance = sq - sum * sum / n;
        let score = if variance <= 1e-6 {
            0.0
        } else {
            // The template is zero-mean, so the window mean drops out of the cross term.
            let start = (top * w) as usize;
            let window = &raw[start..start + (w * th) as usize];
            let cross: f64 = window.iter().zip(&t_zero).map(|(&v, &tz)| v as f64 * tz).sum();
            (cross / (variance.sqrt() * t_norm)) as f32
        };

        if best.is_none_or(|(_, b)| score > b) {
            best = Some((top, score));
        }
    }

    best
}

/// `RowLocator` that follows the last committed row from frame to frame.
pub struct TemplateRowLocator {
    matcher: VisualAnchorMatcher,
    geometry: ListGeometry,
    anchor: Option<(AnchorTemplate, u32)>,
}

impl TemplateRowLocator {
    pub fn new(matcher: VisualAnchorMatcher, geometry: ListGeometry) -> Self {
        Self {
            matcher,
            geometry,
            anchor: None,
        }
    }
}

impl RowLocator for TemplateRowLocator {
    fn name(&self) -> &'static str {
        "template"
    }

    fn locate(&mut self, frame: &Frame) -> Vec<RowPosition> {
        let Some((template, index)) = &self.anchor else {
            // Nothing committed yet: the caller decides the initial layout.
            return Vec::new();
        };

        match self.matcher.locate(frame, template) {
            Some(found) => {
                info!(
                    "Anchor #{} found at y={:.1} (conf {:.2})",
                    index, found.y, found.confidence
                );
                extrapolate_grid(*index, found.y, &self.geometry)
            }
            None => {
                warn!("Anchor #{} lost on this frame", index);
                Vec::new()
            }
        }
    }

    fn commit(&mut self, frame: &Frame, row: &RowPosition) {
        match self.matcher.extract_template(frame, row.y) {
            Some(template) => self.anchor = Some((template, row.index)),
            None => warn!("Could not crop an anchor template for row {}", row),
        }
    }
}
