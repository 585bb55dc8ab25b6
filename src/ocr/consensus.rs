//! Multi-sample decoding of the noisy numeric field.
//!
//! Each row's value is read under every (jitter, threshold) variant and the
//! readings vote. One jitter where enough thresholds already agree ends the
//! search early.

use image::GrayImage;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::engine::{PageMode, TextRecognizer};
use super::preprocess::{binarize, crop_region, prepare_numeric, Region};
use crate::device::Frame;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub field_x1: i32,
    pub field_x2: i32,
    /// Offset of the crop's top edge from the row top
    pub y_offset: f32,
    pub crop_height: f32,
    pub scale: u32,
    pub thresholds: Vec<u8>,
    /// Vertical crop shifts, tried in order
    pub jitters: Vec<i32>,
    pub charset: String,
    /// Readings with fewer digits are noise
    pub min_digits: usize,
    /// Agreeing thresholds within one jitter that end the search
    pub early_exit_votes: u32,
    /// Votes needed for the most frequent reading to win outright
    pub consensus_votes: u32,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            field_x1: 777,
            field_x2: 997,
            y_offset: 0.0,
            crop_height: 201.25,
            scale: 4,
            thresholds: vec![100, 130, 160, 190],
            jitters: vec![0, -4, 4, -2, 2],
            charset: "0123456789,".to_string(),
            min_digits: 6,
            early_exit_votes: 3,
            consensus_votes: 2,
        }
    }
}

/// Outcome of one consensus decode.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldReading {
    /// Every plausible reading, in evaluation order
    pub raw_candidates: Vec<String>,
    pub chosen: Option<String>,
    /// How many candidates equal `chosen`
    pub votes: u32,
}

impl FieldReading {
    /// Picks the winner from a candidate multiset.
    ///
    /// The most frequent reading wins if it has `consensus_votes`; otherwise
    /// the longest one does. Ties go to the lexicographically smallest string.
    pub fn from_candidates(raw_candidates: Vec<String>, consensus_votes: u32) -> Self {
        let counts = tally(&raw_candidates);

        let mut top: Option<(&str, u32)> = None;
        for (text, &count) in &counts {
            if top.is_none_or(|(_, c)| count > c) {
                top = Some((text.as_str(), count));
            }
        }

        let chosen = match top {
            None => None,
            Some((text, count)) if count >= consensus_votes => Some(text.to_string()),
            Some(_) => {
                let mut longest: Option<&str> = None;
                for text in counts.keys() {
                    if longest.is_none_or(|l| text.len() > l.len()) {
                        longest = Some(text.as_str());
                    }
                }
                longest.map(str::to_string)
            }
        };

        let votes = chosen
            .as_ref()
            .and_then(|c| counts.get(c).copied())
            .unwrap_or(0);

        Self {
            raw_candidates,
            chosen,
            votes,
        }
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.chosen.is_none()
    }

    pub fn value(&self) -> Option<u64> {
        self.chosen.as_deref().and_then(|c| c.parse().ok())
    }
}

fn tally(candidates: &[String]) -> BTreeMap<String, u32> {
    let mut counts = BTreeMap::new();
    for candidate in candidates {
        *counts.entry(candidate.clone()).or_insert(0) += 1;
    }
    counts
}

/// Normalizes one raw OCR string into digits, or `None` when too short.
pub fn clean_candidate(text: &str, min_digits: usize) -> Option<String> {
    let digits: String = text
        .chars()
        .map(|c| if c == 'O' || c == 'o' { '0' } else { c })
        .filter(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() || digits.len() < min_digits {
        None
    } else {
        Some(digits)
    }
}

pub trait FieldDecoder {
    fn decode(&self, frame: &Frame, row_y: f32) -> FieldReading;
}

pub struct ConsensusFieldDecoder {
    recognizer: Arc<dyn TextRecognizer>,
    config: ConsensusConfig,
    debug_dir: Option<PathBuf>,
    debug_seq: AtomicU32,
}

impl ConsensusFieldDecoder {
    pub fn new(recognizer: Arc<dyn TextRecognizer>, config: ConsensusConfig) -> Self {
        Self {
            recognizer,
            config,
            debug_dir: None,
            debug_seq: AtomicU32::new(0),
        }
    }

    /// Saves the centre crop of every decode into `dir`.
    pub fn with_debug_dir(mut self, dir: PathBuf) -> Self {
        self.debug_dir = Some(dir);
        self
    }

    fn field_region(&self, row_y: f32, jitter: i32) -> Region {
        let top = (row_y + self.config.y_offset).round() as i32 + jitter;
        Region::new(
            self.config.field_x1,
            top,
            self.config.field_x2,
            top + self.config.crop_height.round() as i32,
        )
    }

    fn save_debug(&self, img: &GrayImage, row_y: f32) {
        let Some(dir) = &self.debug_dir else {
            return;
        };
        let seq = self.debug_seq.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!("value_{:04}_y{:.0}.png", seq, row_y));
        if let Err(e) = img.save(&path) {
            warn!("Failed to save debug crop {}: {}", path.display(), e);
        }
    }
}

impl FieldDecoder for ConsensusFieldDecoder {
    fn decode(&self, frame: &Frame, row_y: f32) -> FieldReading {
        let cfg = &self.config;
        let mut all = Vec::new();

        for &jitter in &cfg.jitters {
            let crop = crop_region(&frame.image, &self.field_region(row_y, jitter));
            if crop.width() == 0 || crop.height() == 0 {
                continue;
            }
            let prepared = prepare_numeric(&crop, cfg.scale);

            let mut per_jitter = Vec::new();
            for (t_idx, &threshold) in cfg.thresholds.iter().enumerate() {
                let binary = binarize(&prepared, threshold);
                if jitter == 0 && t_idx == 1 {
                    self.save_debug(&binary, row_y);
                }

                let text = self
                    .recognizer
                    .recognize(&binary, Some(&cfg.charset), PageMode::SingleLine);
                match clean_candidate(&text, cfg.min_digits) {
                    Some(candidate) => {
                        debug!("  jitter {:+} / t{}: {}", jitter, threshold, candidate);
                        per_jitter.push(candidate);
                    }
                    None => debug!("  jitter {:+} / t{}: rejected '{}'", jitter, threshold, text),
                }
            }

            all.extend(per_jitter.iter().cloned());

            let jitter_counts = tally(&per_jitter);
            let mut strongest: Option<(&String, u32)> = None;
            for (text, &count) in &jitter_counts {
                if strongest.is_none_or(|(_, c)| count > c) {
                    strongest = Some((text, count));
                }
            }
            if let Some((text, count)) = strongest {
                if count >= cfg.early_exit_votes {
                    debug!("Early consensus on {} ({} votes at jitter {:+})", text, count, jitter);
                    let votes = tally(&all).get(text).copied().unwrap_or(count);
                    return FieldReading {
                        chosen: Some(text.clone()),
                        votes,
                        raw_candidates: all,
                    };
                }
            }
        }

        FieldReading::from_candidates(all, cfg.consensus_votes)
    }
}
