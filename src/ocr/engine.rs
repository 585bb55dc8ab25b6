use anyhow::{anyhow, Result};
use image::GrayImage;
use log::{debug, warn};
use std::path::PathBuf;
use std::process::Command;
use tempfile::NamedTempFile;

use super::setup::TesseractPaths;

/// Tesseract page segmentation modes used by the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageMode {
    /// psm 7: a single text line
    SingleLine,
    /// psm 6: a uniform block of text
    Block,
    /// psm 13: raw line, bypassing Tesseract's layout heuristics
    RawLine,
}

impl PageMode {
    pub fn psm(&self) -> u8 {
        match self {
            PageMode::SingleLine => 7,
            PageMode::Block => 6,
            PageMode::RawLine => 13,
        }
    }
}

/// A single recognized word and its bounding box in image pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrWord {
    pub text: String,
    pub confidence: f32,
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

/// Turns an image crop into text.
///
/// Implementations are best effort: failures are logged and reported as empty
/// output, never as errors.
pub trait TextRecognizer: Send + Sync {
    fn recognize(&self, img: &GrayImage, charset: Option<&str>, mode: PageMode) -> String;

    fn recognize_words(&self, img: &GrayImage, charset: Option<&str>, mode: PageMode)
        -> Vec<OcrWord>;
}

/// Runs the `tesseract` executable on temporary PNG files.
#[derive(Debug, Clone)]
pub struct Tesseract {
    executable: PathBuf,
    tessdata: Option<PathBuf>,
    language: String,
}

impl Tesseract {
    pub fn new(paths: TesseractPaths) -> Self {
        Self {
            executable: paths.executable,
            tessdata: paths.tessdata,
            language: "eng".to_string(),
        }
    }

    fn command(&self, input: &NamedTempFile, charset: Option<&str>, mode: PageMode) -> Command {
        let mut cmd = Command::new(&self.executable);
        cmd.arg(input.path()).arg("stdout");
        if let Some(tessdata) = &self.tessdata {
            cmd.arg("--tessdata-dir").arg(tessdata);
        }
        cmd.arg("-l")
            .arg(&self.language)
            .arg("--psm")
            .arg(mode.psm().to_string())
            .arg("--oem")
            .arg("1");

        if let Some(charset) = charset {
            // Dictionaries merge digit runs into words; they only hurt restricted reads.
            cmd.arg("-c")
                .arg(format!("tessedit_char_whitelist={}", charset))
                .arg("-c")
                .arg("load_system_dawg=0")
                .arg("-c")
                .arg("load_freq_dawg=0");
        }
        cmd
    }

    fn run(&self, img: &GrayImage, charset: Option<&str>, mode: PageMode, tsv: bool) -> Result<String> {
        let input = NamedTempFile::with_suffix(".png")?;
        img.save(input.path())?;

        let mut cmd = self.command(&input, charset, mode);
        if tsv {
            cmd.arg("tsv");
        }

        let output = cmd.output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("Tesseract failed: {}", stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl TextRecognizer for Tesseract {
    fn recognize(&self, img: &GrayImage, charset: Option<&str>, mode: PageMode) -> String {
        match self.run(img, charset, mode, false) {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                warn!("OCR error: {}", e);
                String::new()
            }
        }
    }

    fn recognize_words(
        &self,
        img: &GrayImage,
        charset: Option<&str>,
        mode: PageMode,
    ) -> Vec<OcrWord> {
        match self.run(img, charset, mode, true) {
            Ok(tsv) => {
                let words = parse_tsv_words(&tsv);
                debug!("Tesseract returned {} words", words.len());
                words
            }
            Err(e) => {
                warn!("OCR error: {}", e);
                Vec::new()
            }
        }
    }
}

/// Parses Tesseract TSV output into word boxes.
///
/// Only level-5 (word) rows with non-empty text and a non-negative
/// confidence are kept.
pub fn parse_tsv_words(tsv: &str) -> Vec<OcrWord> {
    let mut words = Vec::new();

    for line in tsv.lines().skip(1) {
        // TSV fields: level, page_num, block_num, par_num, line_num, word_num,
        //             left, top, width, height, conf, text
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 12 {
            continue;
        }

        let level: i32 = fields[0].parse().unwrap_or(-1);
        if level != 5 {
            continue;
        }

        let text = fields[11].trim();
        let conf: f32 = fields[10].parse().unwrap_or(-1.0);
        if text.is_empty() || conf < 0.0 {
            continue;
        }

        let coord = |i: usize| fields[i].parse::<u32>().unwrap_or(0);
        words.push(OcrWord {
            text: text.to_string(),
            confidence: conf,
            left: coord(6),
            top: coord(7),
            width: coord(8),
            height: coord(9),
        });
    }

    words
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str =
        "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext";

    #[test]
    fn test_parse_tsv_words() {
        let tsv = format!(
            "{HEADER}\n\
             1\t1\t0\t0\t0\t0\t0\t0\t520\t9600\t-1\t\n\
             4\t1\t1\t1\t1\t0\t40\t120\t80\t60\t-1\t\n\
             5\t1\t1\t1\t1\t1\t40\t120\t80\t60\t91.5\t17\n\
             5\t1\t1\t1\t2\t1\t44\t924\t76\t58\t12.0\t18\n\
             5\t1\t1\t1\t3\t1\t44\t1700\t76\t58\t-1\t\n\
             5\t1\t1\t1\t4\t1\t44\t1800\t76\t58\t-1\tx\n"
        );

        let words = parse_tsv_words(&tsv);
        assert_eq!(words.len(), 2);
        assert_eq!(
            words[0],
            OcrWord {
                text: "17".to_string(),
                confidence: 91.5,
                left: 40,
                top: 120,
                width: 80,
                height: 60,
            }
        );
        assert_eq!(words[1].text, "18");
        assert_eq!(words[1].top, 924);
    }

    #[test]
    fn test_parse_tsv_ignores_short_rows() {
        assert!(parse_tsv_words("header\n5\t1\t1\n").is_empty());
        assert!(parse_tsv_words("").is_empty());
    }

    #[test]
    fn test_page_modes() {
        assert_eq!(PageMode::SingleLine.psm(), 7);
        assert_eq!(PageMode::Block.psm(), 6);
        assert_eq!(PageMode::RawLine.psm(), 13);
    }
}
