//! Row grid from the per-row index markers.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{extrapolate_grid, ListGeometry, RowLocator, RowPosition};
use crate::device::Frame;
use crate::ocr::engine::{PageMode, TextRecognizer};
use crate::ocr::preprocess::{binarize, crop_region, prepare_numeric, Region};

const DIGITS: &str = "0123456789";

/// Where the index markers are drawn and how detections are filtered.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    pub column_x1: i32,
    pub column_x2: i32,
    /// Extra pixels on both sides of the column
    pub column_padding: i32,
    /// Distance from the top of a row to the top of its marker glyphs
    pub y_offset: f32,
    pub scale: u32,
    pub threshold: u8,
    /// Detections at or below this confidence are dropped
    pub min_confidence: f32,
    pub max_index: u32,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            column_x1: 70,
            column_x2: 200,
            column_padding: 10,
            y_offset: 35.0,
            scale: 4,
            threshold: 140,
            min_confidence: 30.0,
            max_index: 9999,
        }
    }
}

/// One recognized index marker, already mapped back to its row's top edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarkerDetection {
    pub value: u32,
    pub y: f32,
    pub confidence: f32,
}

pub struct RowGridReconstructor {
    recognizer: Arc<dyn TextRecognizer>,
    config: MarkerConfig,
    geometry: ListGeometry,
}

impl RowGridReconstructor {
    pub fn new(recognizer: Arc<dyn TextRecognizer>, config: MarkerConfig, geometry: ListGeometry) -> Self {
        Self {
            recognizer,
            config,
            geometry,
        }
    }

    /// Reads the marker column over the full frame height.
    pub fn detect(&self, frame: &Frame) -> Vec<MarkerDetection> {
        let cfg = &self.config;
        let column = Region::new(
            cfg.column_x1 - cfg.column_padding,
            0,
            cfg.column_x2 + cfg.column_padding,
            frame.height() as i32,
        );
        let prepared = prepare_numeric(&crop_region(&frame.image, &column), cfg.scale);
        let binary = binarize(&prepared, cfg.threshold);

        let scale = cfg.scale.max(1) as f32;
        self.recognizer
            .recognize_words(&binary, Some(DIGITS), PageMode::Block)
            .into_iter()
            .filter(|word| word.confidence > cfg.min_confidence)
            .filter(|word| !word.text.is_empty() && word.text.chars().all(|c| c.is_ascii_digit()))
            .filter_map(|word| {
                let value: u32 = word.text.parse().ok()?;
                if value == 0 || value > cfg.max_index {
                    return None;
                }
                Some(MarkerDetection {
                    value,
                    y: (word.top as f32 / scale).floor() - cfg.y_offset,
                    confidence: word.confidence,
                })
            })
            .collect()
    }

    /// Rows on `frame`, or empty when no marker survived filtering.
    pub fn reconstruct(&self, frame: &Frame) -> Vec<RowPosition> {
        let detections = self.detect(frame);
        let rows = Self::from_detections(&detections, &self.geometry);
        info!(
            "Reconstructed {} rows from {} marker detections",
            rows.len(),
            detections.len()
        );
        rows
    }

    /// Anchors on the most confident detection and extrapolates the rest.
    ///
    /// Ties go to the detection listed first.
    pub fn from_detections(detections: &[MarkerDetection], geometry: &ListGeometry) -> Vec<RowPosition> {
        let mut best: Option<&MarkerDetection> = None;
        for detection in detections {
            if best.is_none_or(|b| detection.confidence > b.confidence) {
                best = Some(detection);
            }
        }

        let Some(anchor) = best else {
            return Vec::new();
        };
        debug!(
            "Anchoring on index {} (y={:.0}, conf={:.0})",
            anchor.value, anchor.y, anchor.confidence
        );
        extrapolate_grid(anchor.value, anchor.y, geometry)
    }
}

impl RowLocator for RowGridReconstructor {
    fn name(&self) -> &'static str {
        "markers"
    }

    fn locate(&mut self, frame: &Frame) -> Vec<RowPosition> {
        self.reconstruct(frame)
    }
}
