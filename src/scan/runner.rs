//! Entry points behind the CLI subcommands.
//!
//! Builds the real collaborators (Tesseract, adb, SQLite, HTTP lookup) and
//! hands them to `ScanOrchestrator` or the retry path.

use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use super::config::{LocatorStrategy, ScanConfig};
use super::orchestrator::{ScanOrchestrator, ScanParts};
use super::report::ScanSummary;
use crate::db::Database;
use crate::device::AdbDevice;
use crate::enrich::{
    retry_failed, EnrichmentContext, EnrichmentPool, HttpIdentityLookup, IdentityLookup,
    LookupConfig, RateLimiter, RecoveryReport,
};
use crate::ledger::{ScanProgressLedger, ScanSession, SessionOptions};
use crate::ocr::{find_tesseract, ConsensusFieldDecoder, DetailViewReader, Tesseract, TextRecognizer};
use crate::paths;
use crate::vision::anchor::{TemplateRowLocator, VisualAnchorMatcher};
use crate::vision::{RowGridReconstructor, RowLocator, ShiftEstimator, ShiftMeasurement};

/// Per-run switches that are not part of config.json.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Skip app launch and navigation; the list must already be on screen
    pub fast: bool,
    /// Look up identifiers that are already stored, not just new ones
    pub use_lookup: bool,
    /// Save every preprocessed value crop to the debug directory
    pub debug_images: bool,
    pub notes: Option<String>,
}

fn open_database() -> Result<Database> {
    Database::open(paths::get_db_path())
}

/// HTTP lookup, or `None` when no endpoint is configured.
fn build_lookup(config: &LookupConfig) -> Result<Option<Arc<dyn IdentityLookup>>> {
    if config.endpoint.is_none() {
        warn!("Identity lookup not configured, entries are stored unverified");
        return Ok(None);
    }
    let limiter = Arc::new(RateLimiter::new(Duration::from_millis(config.min_interval_ms)));
    let lookup = HttpIdentityLookup::new(config, limiter)?;
    Ok(Some(Arc::new(lookup)))
}

/// Empties (or creates) the debug image directory.
fn reset_debug_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir).with_context(|| format!("Failed to clear {}", dir.display()))?;
    }
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    Ok(())
}

fn build_locator(config: &ScanConfig, recognizer: Arc<dyn TextRecognizer>) -> Box<dyn RowLocator> {
    match config.strategy {
        LocatorStrategy::Markers => Box::new(RowGridReconstructor::new(
            recognizer,
            config.markers,
            config.geometry,
        )),
        LocatorStrategy::Template => Box::new(TemplateRowLocator::new(
            VisualAnchorMatcher::new(config.anchor),
            config.geometry,
        )),
    }
}

/// Runs one full scan session.
pub fn run_scan(config: ScanConfig, options: &RunOptions, abort: Arc<AtomicBool>) -> Result<ScanSummary> {
    let recognizer: Arc<dyn TextRecognizer> =
        Arc::new(Tesseract::new(find_tesseract(config.tesseract_path.as_deref())?));

    let mut decoder = ConsensusFieldDecoder::new(recognizer.clone(), config.consensus.clone());
    if options.debug_images {
        let dir = paths::get_debug_dir();
        reset_debug_dir(&dir)?;
        info!("Saving OCR debug images to {}", dir.display());
        decoder = decoder.with_debug_dir(dir);
    }
    let detail = DetailViewReader::new(recognizer.clone(), config.detail.clone());
    let locator = build_locator(&config, recognizer);

    let mut device = AdbDevice::connect(&config.device.adb_path, config.device.serial.as_deref())?;
    info!("Device {} is {}", device.serial(), device.state()?);
    if options.fast {
        info!("Fast mode: assuming the list is already open");
    } else {
        device.launch_app(
            &config.device.app_package,
            Duration::from_millis(config.device.launch_wait_ms),
        )?;
        device.navigate(&config.device.navigation)?;
    }

    let db = open_database()?;
    let ledger = ScanProgressLedger::new(db.clone());
    let ctx = EnrichmentContext {
        store: Arc::new(db),
        lookup: build_lookup(&config.lookup)?,
        retry: config.lookup.retry.clone(),
        use_lookup: options.use_lookup,
    };
    let enrichment = EnrichmentPool::start(&config.enrichment, ctx, ledger.clone());

    let session = SessionOptions {
        strategy: config.strategy.as_str().to_string(),
        use_lookup: options.use_lookup,
        notes: options.notes.clone(),
    };
    let parts = ScanParts {
        device: Box::new(device),
        locator,
        decoder: Box::new(decoder),
        detail: Box::new(detail),
        enrichment: Box::new(enrichment),
        ledger,
    };

    let mut scan = ScanOrchestrator::new(parts, config, session, abort)
        .with_output_dir(paths::get_reports_dir());
    Ok(scan.run())
}

/// Re-runs enrichment for a session's failed identifiers, or the latest
/// session when `session_id` is `None`.
pub fn run_retry(config: &ScanConfig, session_id: Option<String>) -> Result<RecoveryReport> {
    let db = open_database()?;
    let ledger = ScanProgressLedger::new(db.clone());

    let session_id = match session_id {
        Some(id) => id,
        None => ledger
            .last_session_id()?
            .ok_or_else(|| anyhow!("no scan sessions recorded yet"))?,
    };

    let ctx = EnrichmentContext {
        store: Arc::new(db),
        lookup: build_lookup(&config.lookup)?,
        retry: config.lookup.retry.clone(),
        use_lookup: true,
    };
    retry_failed(&ledger, &ctx, &session_id)
}

fn load_rgba(path: &Path) -> Result<image::RgbaImage> {
    Ok(image::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?
        .to_rgba8())
}

/// Measures the scroll offset between two saved captures.
pub fn run_shift(
    config: &ScanConfig,
    before: &Path,
    after: &Path,
    expected: Option<i32>,
    radius: Option<i32>,
) -> Result<Option<ShiftMeasurement>> {
    let before = load_rgba(before)?;
    let after = load_rgba(after)?;
    let estimator = ShiftEstimator::new(config.shift);
    Ok(estimator.estimate(
        &before,
        &after,
        expected.unwrap_or(config.shift.expected_offset),
        radius.unwrap_or(config.shift.search_radius),
    ))
}

pub fn list_sessions(limit: u32) -> Result<Vec<ScanSession>> {
    ScanProgressLedger::new(open_database()?).recent_sessions(limit)
}

/// Where `list_sessions` and `run_retry` read from.
pub fn database_path() -> PathBuf {
    paths::get_db_path()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};
    use tempfile::tempdir;

    #[test]
    fn test_lookup_disabled_without_endpoint() {
        let config = LookupConfig::default();
        assert!(build_lookup(&config).unwrap().is_none());
    }

    #[test]
    fn test_lookup_requires_secret() {
        let config = LookupConfig {
            endpoint: Some("http://127.0.0.1:9/player".to_string()),
            secret: None,
            ..LookupConfig::default()
        };
        assert!(build_lookup(&config).is_err());
    }

    #[test]
    fn test_reset_debug_dir_clears_old_images() {
        let dir = tempdir().unwrap();
        let debug = dir.path().join("debug_ocr");
        fs::create_dir_all(&debug).unwrap();
        fs::write(debug.join("old.png"), b"x").unwrap();

        reset_debug_dir(&debug).unwrap();
        assert!(debug.exists());
        assert_eq!(fs::read_dir(&debug).unwrap().count(), 0);
    }

    #[test]
    fn test_shift_between_saved_captures() {
        let dir = tempdir().unwrap();
        // Distinct stripes every row, then the same list moved up by 40px.
        let content = |y: i64| -> u8 { ((y * 37) % 251) as u8 };
        let before = RgbaImage::from_fn(400, 2400, |_, y| {
            let v = content(y as i64);
            Rgba([v, v, v, 255])
        });
        let after = RgbaImage::from_fn(400, 2400, |_, y| {
            let v = content(y as i64 + 40);
            Rgba([v, v, v, 255])
        });
        let before_path = dir.path().join("before.png");
        let after_path = dir.path().join("after.png");
        before.save(&before_path).unwrap();
        after.save(&after_path).unwrap();

        let measured = run_shift(&ScanConfig::default(), &before_path, &after_path, Some(40), Some(10))
            .unwrap()
            .unwrap();
        assert_eq!(measured.offset_px, 40);
    }
}
