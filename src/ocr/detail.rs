//! Reads the stable identifier from an entry's detail view.

use image::imageops;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::engine::{PageMode, TextRecognizer};
use super::preprocess::{binarize_above, crop_region, enhance, max_filter, to_gray, upscale, Region};
use crate::device::Frame;

const DIGITS: &str = "0123456789";

/// One max-filter recovery pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPass {
    pub filter_size: u8,
    pub threshold: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetailConfig {
    pub identifier_region: Region,
    pub group_region: Region,
    /// Header area that shows the list title while the list is on screen
    pub list_check_region: Region,
    pub list_keywords: Vec<String>,
    /// Identifiers shorter than this trigger the recovery passes
    pub min_identifier_len: usize,
    pub scale: u32,
    pub recovery_padding_x: i32,
    pub recovery_padding_y: i32,
    pub recovery_scale: u32,
    pub recovery_passes: Vec<RecoveryPass>,
    pub group_charset: String,
}

impl Default for DetailConfig {
    fn default() -> Self {
        let pass = |filter_size, threshold| RecoveryPass {
            filter_size,
            threshold,
        };
        Self {
            identifier_region: Region::new(440, 1825, 740, 1885),
            group_region: Region::new(550, 2010, 653, 2051),
            list_check_region: Region::new(150, 140, 950, 230),
            list_keywords: ["leaderboard", "governor", "power", "personal", "ranking"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            min_identifier_len: 9,
            scale: 4,
            recovery_padding_x: 15,
            recovery_padding_y: 5,
            recovery_scale: 8,
            recovery_passes: vec![pass(3, 160), pass(3, 110), pass(3, 50), pass(5, 150), pass(5, 110)],
            group_charset: "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz[]- "
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DetailReading {
    pub identifier: Option<String>,
    pub group_name: Option<String>,
}

pub trait DetailReader {
    fn read(&self, frame: &Frame) -> DetailReading;

    /// Whether `frame` still shows the list rather than a detail view.
    fn is_list_visible(&self, frame: &Frame) -> bool;
}

pub struct DetailViewReader {
    recognizer: Arc<dyn TextRecognizer>,
    config: DetailConfig,
}

/// Maps glyphs that Tesseract confuses with `1` and keeps only digits.
pub fn normalize_identifier(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            'l' | 'I' | 'i' | '|' | ']' | '[' => '1',
            other => other,
        })
        .filter(|c| c.is_ascii_digit())
        .collect()
}

impl DetailViewReader {
    pub fn new(recognizer: Arc<dyn TextRecognizer>, config: DetailConfig) -> Self {
        Self { recognizer, config }
    }

    fn read_text(&self, frame: &Frame, region: &Region, charset: Option<&str>) -> String {
        let crop = crop_region(&frame.image, region);
        if crop.width() == 0 || crop.height() == 0 {
            return String::new();
        }
        let prepared = enhance(&upscale(&to_gray(&crop), self.config.scale));
        self.recognizer
            .recognize(&prepared, charset, PageMode::SingleLine)
            .trim()
            .to_string()
    }

    /// Progressive max-filter passes over a padded, enlarged, inverted crop.
    ///
    /// Keeps the longest reading and stops once it reaches the minimum length.
    fn recover_identifier(&self, frame: &Frame, initial: &str) -> String {
        let cfg = &self.config;
        let region = cfg
            .identifier_region
            .padded(cfg.recovery_padding_x, cfg.recovery_padding_y);
        let crop = crop_region(&frame.image, &region);
        if crop.width() == 0 || crop.height() == 0 {
            return initial.to_string();
        }

        let mut base = upscale(&to_gray(&crop), cfg.recovery_scale);
        imageops::invert(&mut base);

        let mut best = initial.to_string();
        for pass in &cfg.recovery_passes {
            let thinned = binarize_above(&max_filter(&base, pass.filter_size), pass.threshold);
            let raw = self.recognizer.recognize(&thinned, None, PageMode::RawLine);
            let candidate = normalize_identifier(&raw);

            if candidate.len() > best.len() {
                info!(
                    "Improved identifier (F{}/T{}): {} -> {} (raw: {})",
                    pass.filter_size, pass.threshold, best, candidate, raw
                );
                best = candidate;
                if best.len() >= cfg.min_identifier_len {
                    break;
                }
            } else {
                debug!("F{}/T{}: {} (raw: {})", pass.filter_size, pass.threshold, candidate, raw);
            }
        }
        best
    }
}

impl DetailReader for DetailViewReader {
    fn read(&self, frame: &Frame) -> DetailReading {
        let tight = self.read_text(frame, &self.config.identifier_region, Some(DIGITS));
        let mut identifier: String = tight.chars().filter(|c| c.is_ascii_digit()).collect();

        if identifier.len() < self.config.min_identifier_len {
            info!(
                "Short identifier '{}' (<{} digits), running recovery passes",
                identifier, self.config.min_identifier_len
            );
            identifier = self.recover_identifier(frame, &identifier);
            if identifier.len() < self.config.min_identifier_len {
                warn!("Recovery could not complete the identifier (result: '{}')", identifier);
            }
        }

        let group = self.read_text(frame, &self.config.group_region, Some(&self.config.group_charset));

        DetailReading {
            identifier: (!identifier.is_empty()).then_some(identifier),
            group_name: (!group.is_empty()).then_some(group),
        }
    }

    fn is_list_visible(&self, frame: &Frame) -> bool {
        let text = self
            .read_text(frame, &self.config.list_check_region, None)
            .to_lowercase();
        let visible = self
            .config
            .list_keywords
            .iter()
            .any(|keyword| text.contains(&keyword.to_lowercase()));
        debug!("List check read '{}' -> visible={}", text, visible);
        visible
    }
}
