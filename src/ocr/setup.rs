use anyhow::{anyhow, Result};
use log::info;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::paths;

#[derive(Debug, Clone)]
pub struct TesseractPaths {
    pub executable: PathBuf,
    /// `None` lets Tesseract use its compiled-in tessdata location.
    pub tessdata: Option<PathBuf>,
}

const COMMON_EXECUTABLE_PATHS: &[&str] = &[
    "/usr/bin/tesseract",
    "/usr/local/bin/tesseract",
    "/opt/homebrew/bin/tesseract",
    r"C:\Program Files\Tesseract-OCR\tesseract.exe",
    r"C:\Program Files (x86)\Tesseract-OCR\tesseract.exe",
];

const COMMON_TESSDATA_PATHS: &[&str] = &[
    r"C:\Program Files\Tesseract-OCR\tessdata",
    r"C:\Program Files (x86)\Tesseract-OCR\tessdata",
];

/// Locates Tesseract: the configured path first, then our data dir, `$PATH`,
/// and common install locations.
pub fn find_tesseract(configured: Option<&Path>) -> Result<TesseractPaths> {
    let executable = find_tesseract_executable(configured)?;
    let tessdata = find_tessdata_dir();

    info!(
        "Using Tesseract at {} (tessdata: {})",
        executable.display(),
        tessdata
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "default".to_string())
    );

    Ok(TesseractPaths {
        executable,
        tessdata,
    })
}

fn runs(exe: &Path) -> bool {
    Command::new(exe)
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Finds the Tesseract executable, checking the configured path first.
pub fn find_tesseract_executable(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.exists() || runs(path) {
            return Ok(path.to_path_buf());
        }
        return Err(anyhow!(
            "configured Tesseract executable {} not found",
            path.display()
        ));
    }

    let local_dir = paths::get_tesseract_dir();
    for name in ["tesseract", "tesseract.exe"] {
        let local = local_dir.join(name);
        if local.exists() {
            return Ok(local);
        }
    }

    let on_path = PathBuf::from("tesseract");
    if runs(&on_path) {
        return Ok(on_path);
    }

    COMMON_EXECUTABLE_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
        .ok_or_else(|| {
            anyhow!(
                "Tesseract not found. Install tesseract-ocr, add it to PATH, \
                 or set ocr.tesseract_path in config.json"
            )
        })
}

/// Finds a tessdata directory holding `eng.traineddata`, if one is known.
pub fn find_tessdata_dir() -> Option<PathBuf> {
    let has_eng = |p: &Path| p.join("eng.traineddata").exists();

    let local = paths::get_tesseract_dir().join("tessdata");
    if has_eng(&local) {
        return Some(local);
    }

    if let Ok(prefix) = std::env::var("TESSDATA_PREFIX") {
        let p = PathBuf::from(&prefix);
        if has_eng(&p) {
            return Some(p);
        }
        let p = p.join("tessdata");
        if has_eng(&p) {
            return Some(p);
        }
    }

    COMMON_TESSDATA_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|p| has_eng(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_configured_executable_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no-such-tesseract");
        assert!(find_tesseract_executable(Some(&missing)).is_err());
    }

    #[test]
    fn test_existing_configured_executable_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("tesseract");
        std::fs::write(&exe, b"").unwrap();
        assert_eq!(find_tesseract_executable(Some(&exe)).unwrap(), exe);
    }
}
