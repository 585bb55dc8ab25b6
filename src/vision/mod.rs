//! Row placement on list frames.
//!
//! Two strategies answer "where are the rows on this frame": reading the
//! per-row index markers (`grid`) or re-finding the last committed row by
//! template correlation (`anchor`). Both produce the same evenly spaced grid.

pub mod anchor;
pub mod grid;
pub mod shift;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::device::Frame;

pub use grid::{MarkerConfig, RowGridReconstructor};
pub use shift::{ShiftEstimator, ShiftMeasurement};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RowConfidence {
    /// Directly recognized on this frame.
    Anchor,
    /// Extrapolated from the anchor by whole row heights.
    Inferred,
}

/// Top edge of one list row and its list index.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RowPosition {
    pub index: u32,
    pub y: f32,
    pub confidence: RowConfidence,
}

impl fmt::Display for RowPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.confidence {
            RowConfidence::Anchor => "anchor",
            RowConfidence::Inferred => "inferred",
        };
        write!(f, "#{} @ y={:.1} ({})", self.index, self.y, tag)
    }
}

/// Vertical layout of the list area.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListGeometry {
    /// Top of the first row on an unscrolled list
    pub first_row_y: f32,
    pub row_height: f32,
    pub visible_rows: u32,
    /// Rows whose top lies outside `[band_top, band_bottom]` are not usable
    pub band_top: f32,
    pub band_bottom: f32,
}

impl Default for ListGeometry {
    fn default() -> Self {
        Self {
            first_row_y: 323.0,
            row_height: 201.25,
            visible_rows: 8,
            band_top: 250.0,
            band_bottom: 2100.0,
        }
    }
}

impl ListGeometry {
    fn in_band(&self, y: f32) -> bool {
        y >= self.band_top && y <= self.band_bottom
    }
}

/// Answers "where are the rows on this frame" for the scan loop.
pub trait RowLocator {
    fn name(&self) -> &'static str;

    /// Rows found on `frame`, ascending by y. Empty when nothing could be placed.
    fn locate(&mut self, frame: &Frame) -> Vec<RowPosition>;

    /// Told about every row committed on `frame`.
    fn commit(&mut self, _frame: &Frame, _row: &RowPosition) {}
}

/// Lays out every row reachable from one anchor inside the usable band.
///
/// Walks up and down in whole row heights; indices below 1 are never produced.
/// When the anchor itself lies outside the band, the in-band row closest to it
/// carries the `Anchor` tag instead.
pub fn extrapolate_grid(anchor_index: u32, anchor_y: f32, geometry: &ListGeometry) -> Vec<RowPosition> {
    let mut rows = Vec::new();
    let step = geometry.row_height;
    if step <= 0.0 || anchor_index == 0 {
        return rows;
    }

    // Upward, stopping at index 1.
    let mut k: u32 = 1;
    while k < anchor_index {
        let y = anchor_y - step * k as f32;
        if y < geometry.band_top {
            break;
        }
        if geometry.in_band(y) {
            rows.push(RowPosition {
                index: anchor_index - k,
                y,
                confidence: RowConfidence::Inferred,
            });
        }
        k += 1;
    }

    if geometry.in_band(anchor_y) {
        rows.push(RowPosition {
            index: anchor_index,
            y: anchor_y,
            confidence: RowConfidence::Anchor,
        });
    }

    let mut k: u32 = 1;
    loop {
        let y = anchor_y + step * k as f32;
        if y > geometry.band_bottom {
            break;
        }
        if geometry.in_band(y) {
            rows.push(RowPosition {
                index: anchor_index + k,
                y,
                confidence: RowConfidence::Inferred,
            });
        }
        k += 1;
    }

    rows.sort_by(|a, b| a.y.total_cmp(&b.y));
    if !geometry.in_band(anchor_y) {
        let nearest = rows
            .iter_mut()
            .min_by(|a, b| (a.y - anchor_y).abs().total_cmp(&(b.y - anchor_y).abs()));
        if let Some(row) = nearest {
            row.confidence = RowConfidence::Anchor;
        }
    }
    rows
}

/// Fixed grid starting at `first_row_y`, numbered from `first_index`.
pub fn default_grid(geometry: &ListGeometry, first_index: u32) -> Vec<RowPosition> {
    (0..geometry.visible_rows)
        .map(|i| RowPosition {
            index: first_index + i,
            y: geometry.first_row_y + geometry.row_height * i as f32,
            confidence: RowConfidence::Inferred,
        })
        .filter(|row| row.y <= geometry.band_bottom)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_arithmetic(rows: &[RowPosition], step: f32) {
        for pair in rows.windows(2) {
            assert!((pair[1].y - pair[0].y - step).abs() < 1e-3, "{} -> {}", pair[0], pair[1]);
            assert_eq!(pair[1].index, pair[0].index + 1);
        }
    }

    #[test]
    fn test_extrapolate_grid_from_middle_anchor() {
        let geometry = ListGeometry::default();
        let rows = extrapolate_grid(14, 927.0, &geometry);

        assert_arithmetic(&rows, geometry.row_height);
        assert!(rows.iter().all(|r| r.y >= 250.0 && r.y <= 2100.0));
        assert_eq!(rows.iter().filter(|r| r.confidence == RowConfidence::Anchor).count(), 1);

        let anchor = rows.iter().find(|r| r.index == 14).unwrap();
        assert_eq!(anchor.y, 927.0);
        assert_eq!(rows[0].index, 11);
        assert_eq!(rows.last().unwrap().index, 19);
    }

    #[test]
    fn test_extrapolate_grid_never_goes_below_index_one() {
        let geometry = ListGeometry::default();
        let rows = extrapolate_grid(2, 1300.0, &geometry);

        assert_eq!(rows[0].index, 1);
        assert!((rows[0].y - (1300.0 - geometry.row_height)).abs() < 1e-3);
        assert_arithmetic(&rows, geometry.row_height);
    }

    #[test]
    fn test_extrapolate_grid_anchor_outside_band() {
        let geometry = ListGeometry::default();
        let rows = extrapolate_grid(30, 200.0, &geometry);

        let anchors: Vec<_> = rows.iter().filter(|r| r.confidence == RowConfidence::Anchor).collect();
        assert_eq!(anchors.len(), 1);
        assert_eq!(anchors[0].index, 31);
        assert_eq!(rows[0].index, 31);
        assert_arithmetic(&rows, geometry.row_height);
    }

    #[test]
    fn test_default_grid() {
        let geometry = ListGeometry::default();
        let rows = default_grid(&geometry, 1);
        assert_eq!(rows.len(), 8);
        assert_eq!(rows[0].y, 323.0);
        assert_eq!(rows[7].index, 8);
        assert_arithmetic(&rows, geometry.row_height);
    }
}
