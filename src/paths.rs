use std::path::PathBuf;
use std::sync::OnceLock;

static EXE_DIR: OnceLock<PathBuf> = OnceLock::new();
static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

const APP_DIR: &str = "leaderboard-scan";

/// Returns the directory containing the executable.
pub fn get_exe_dir() -> &'static PathBuf {
    EXE_DIR.get_or_init(|| {
        std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."))
    })
}

/// Returns the data directory: `<local data dir>/leaderboard-scan/`, or the
/// executable's directory when the platform has none.
pub fn get_data_dir() -> &'static PathBuf {
    DATA_DIR.get_or_init(|| {
        dirs::data_local_dir()
            .map(|d| d.join(APP_DIR))
            .unwrap_or_else(|| get_exe_dir().clone())
    })
}

/// Returns the logs directory: `<data_dir>/logs/`
pub fn get_logs_dir() -> PathBuf {
    get_data_dir().join("logs")
}

/// Returns the reports directory: `<data_dir>/reports/`
pub fn get_reports_dir() -> PathBuf {
    get_data_dir().join("reports")
}

/// Returns the OCR debug image directory: `<data_dir>/debug_ocr/`
pub fn get_debug_dir() -> PathBuf {
    get_data_dir().join("debug_ocr")
}

/// Returns the bundled tesseract directory: `<exe_dir>/tesseract/`
pub fn get_tesseract_dir() -> PathBuf {
    get_exe_dir().join("tesseract")
}

/// Returns the ledger and entity database: `<data_dir>/scan.db`
pub fn get_db_path() -> PathBuf {
    get_data_dir().join("scan.db")
}

/// Ensures all output directories exist. Call at startup.
pub fn ensure_directories() -> std::io::Result<()> {
    std::fs::create_dir_all(get_logs_dir())?;
    std::fs::create_dir_all(get_reports_dir())?;
    Ok(())
}
