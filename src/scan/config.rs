//! Configuration for a scan run.
//!
//! Loads settings from config.json. Defaults carry the calibrated layout of a
//! 1080x2400 portrait device, so a partial file only needs the fields it changes.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::device::adb::NavigationStep;
use crate::device::Point;
use crate::enrich::{EnrichmentConfig, LookupConfig};
use crate::ocr::{ConsensusConfig, DetailConfig};
use crate::retry::RetryPolicy;
use crate::vision::anchor::AnchorConfig;
use crate::vision::shift::ShiftConfig;
use crate::vision::{ListGeometry, MarkerConfig};

/// Environment variable that overrides `lookup.secret`.
pub const LOOKUP_SECRET_ENV: &str = "LEADERBOARD_LOOKUP_SECRET";

/// How rows are placed on each frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LocatorStrategy {
    /// Read the per-row index markers
    #[default]
    Markers,
    /// Follow the last committed row by template matching
    Template,
}

impl LocatorStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocatorStrategy::Markers => "markers",
            LocatorStrategy::Template => "template",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub adb_path: PathBuf,
    /// Serial of the device to use; first connected device when unset
    pub serial: Option<String>,
    pub app_package: String,
    pub launch_wait_ms: u64,
    /// Taps that lead from the app's start screen to the list
    pub navigation: Vec<NavigationStep>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let step = |x, y, delay_ms| NavigationStep { x, y, delay_ms };
        Self {
            adb_path: PathBuf::from("adb"),
            serial: None,
            app_package: "com.run.tower.defense".to_string(),
            launch_wait_ms: 15_000,
            navigation: vec![
                step(560, 370, 1000),
                step(70, 144, 1000),
                step(674, 2248, 2000),
                step(305, 1295, 2000),
            ],
        }
    }
}

/// Gestures and the settle delays after them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigationConfig {
    /// Horizontal position used to open a row's detail view
    pub row_tap_x: i32,
    pub back_button: Point,
    pub scroll_from: Point,
    pub scroll_to: Point,
    pub scroll_duration_ms: u64,
    pub scroll_settle_ms: u64,
    pub detail_settle_ms: u64,
    pub back_settle_ms: u64,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            row_tap_x: 540,
            back_button: Point::new(72, 137),
            scroll_from: Point::new(540, 1930),
            scroll_to: Point::new(540, 315),
            scroll_duration_ms: 5000,
            scroll_settle_ms: 2000,
            detail_settle_ms: 1000,
            back_settle_ms: 700,
        }
    }
}

/// Complete scan configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub strategy: LocatorStrategy,
    pub target_count: u32,
    pub max_scrolls: u32,
    /// Decoded values below this are treated as misreads
    pub min_value: u64,
    /// Consecutive pages without new rows before the list is considered finished
    pub zero_progress_pages: u32,
    /// Tesseract executable; searched on PATH when unset
    pub tesseract_path: Option<PathBuf>,
    pub device: DeviceConfig,
    pub navigation: NavigationConfig,
    pub geometry: ListGeometry,
    pub markers: MarkerConfig,
    pub anchor: AnchorConfig,
    pub shift: ShiftConfig,
    pub consensus: ConsensusConfig,
    pub detail: DetailConfig,
    /// Retry policy for list and detail-view captures
    pub capture_retry: RetryPolicy,
    pub lookup: LookupConfig,
    pub enrichment: EnrichmentConfig,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            strategy: LocatorStrategy::Markers,
            target_count: 1000,
            max_scrolls: 100,
            min_value: 1000,
            zero_progress_pages: 2,
            tesseract_path: None,
            device: DeviceConfig::default(),
            navigation: NavigationConfig::default(),
            geometry: ListGeometry::default(),
            markers: MarkerConfig::default(),
            anchor: AnchorConfig::default(),
            shift: ShiftConfig::default(),
            consensus: ConsensusConfig::default(),
            detail: DetailConfig::default(),
            capture_retry: RetryPolicy::default(),
            lookup: LookupConfig::default(),
            enrichment: EnrichmentConfig::default(),
        }
    }
}

/// Default location: config.json next to the executable.
pub fn default_config_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.join("config.json")))
        .unwrap_or_else(|| Path::new("config.json").to_path_buf())
}

/// Reads `path` (or the default location). Missing or invalid files fall back
/// to defaults with a warning.
pub fn load_config(path: Option<&Path>) -> ScanConfig {
    let config_path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    info!("Looking for config at: {}", config_path.display());

    let mut config = if config_path.exists() {
        match fs::read_to_string(&config_path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    info!("Config loaded from {}", config_path.display());
                    config
                }
                Err(e) => {
                    warn!("Failed to parse {}: {}. Using defaults.", config_path.display(), e);
                    ScanConfig::default()
                }
            },
            Err(e) => {
                warn!("Failed to read {}: {}. Using defaults.", config_path.display(), e);
                ScanConfig::default()
            }
        }
    } else {
        info!("No config file found, using defaults");
        ScanConfig::default()
    };

    apply_secret_override(&mut config, std::env::var(LOOKUP_SECRET_ENV).ok());
    config
}

/// A non-empty secret from the environment replaces the configured one.
pub fn apply_secret_override(config: &mut ScanConfig, secret: Option<String>) {
    if let Some(secret) = secret.filter(|s| !s.trim().is_empty()) {
        config.lookup.secret = Some(secret.trim().to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"target_count": 250, "strategy": "template", "consensus": {{"early_exit_votes": 4}}, "geometry": {{"row_height": 200.0}}}}"#
        )
        .unwrap();

        let config = load_config(Some(file.path()));
        assert_eq!(config.target_count, 250);
        assert_eq!(config.strategy, LocatorStrategy::Template);
        assert_eq!(config.consensus.early_exit_votes, 4);
        assert_eq!(config.consensus.consensus_votes, 2);
        assert_eq!(config.geometry.row_height, 200.0);
        assert_eq!(config.geometry.first_row_y, 323.0);
        assert_eq!(config.max_scrolls, 100);
    }

    #[test]
    fn test_invalid_config_falls_back_to_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let mut config = load_config(Some(file.path()));
        config.lookup.secret = None;
        let mut expected = ScanConfig::default();
        expected.lookup.secret = None;
        assert_eq!(config, expected);
    }

    #[test]
    fn test_missing_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("absent.json")));
        assert_eq!(config.target_count, 1000);
    }

    #[test]
    fn test_secret_override() {
        let mut config = ScanConfig::default();
        config.lookup.secret = Some("from-file".to_string());

        apply_secret_override(&mut config, Some("   ".to_string()));
        assert_eq!(config.lookup.secret.as_deref(), Some("from-file"));

        apply_secret_override(&mut config, Some("from-env".to_string()));
        assert_eq!(config.lookup.secret.as_deref(), Some("from-env"));
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let json = serde_json::to_string_pretty(&ScanConfig::default()).unwrap();
        let parsed: ScanConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ScanConfig::default());
    }
}
