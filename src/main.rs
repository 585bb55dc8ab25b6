//! Leaderboard Scan
//!
//! Walks a scrolling ranked list on an Android device, reads each row's value
//! and identifier, and records one entry per rank.

mod db;
mod device;
mod enrich;
mod ledger;
mod ocr;
mod paths;
mod retry;
mod scan;
mod vision;

use anyhow::Result;
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::scan::config::{load_config, LocatorStrategy};
use crate::scan::runner::{self, RunOptions};

const LOG_FILE: &str = "leaderboard_scan.log";

#[derive(Parser, Debug)]
#[command(
    name = "leaderboard-scan",
    version,
    about = "Scans a scrolling ranked list on an Android device"
)]
struct Cli {
    /// Path to config.json (default: next to the executable)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a visual scan of the list
    Scan(ScanArgs),
    /// Retry lookup and storage for a session's failed identifiers
    Retry(RetryArgs),
    /// Measure the scroll offset between two saved captures
    Shift(ShiftArgs),
    /// Print recent scan sessions with their counts
    Sessions(SessionsArgs),
}

#[derive(Args, Debug)]
struct ScanArgs {
    /// Number of entries to collect
    #[arg(long)]
    count: Option<u32>,
    #[arg(long)]
    max_scrolls: Option<u32>,
    /// The list is already open; skip app launch and navigation
    #[arg(long)]
    fast: bool,
    /// Only look up identifiers that are not stored yet
    #[arg(long)]
    no_lookup: bool,
    /// Save preprocessed value crops for inspection
    #[arg(long)]
    debug_images: bool,
    #[arg(long, value_enum)]
    strategy: Option<LocatorStrategy>,
    /// Free-form note stored with the session
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Args, Debug)]
struct RetryArgs {
    #[arg(long, conflicts_with = "last", required_unless_present = "last")]
    session: Option<String>,
    /// Use the most recent session
    #[arg(long)]
    last: bool,
}

#[derive(Args, Debug)]
struct ShiftArgs {
    before: PathBuf,
    after: PathBuf,
    /// Expected offset in pixels (default from config)
    #[arg(long, allow_hyphen_values = true)]
    expected: Option<i32>,
    /// Search radius in pixels (default from config)
    #[arg(long)]
    radius: Option<i32>,
}

#[derive(Args, Debug)]
struct SessionsArgs {
    #[arg(long, default_value_t = 10)]
    limit: u32,
}

/// Appends one line to the log file. Failures are ignored.
fn append_to_log_file(line: &str) {
    let log_path = paths::get_logs_dir().join(LOG_FILE);
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&log_path) {
        let _ = writeln!(file, "{}", line);
    }
}

/// Logs to the console and to the log file with a local timestamp.
fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            let line = format!(
                "[{}] {:<5} {}",
                Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.args()
            );
            append_to_log_file(&line);
            writeln!(buf, "{}", line)
        })
        .init();
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let msg = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };
        let location = panic_info
            .location()
            .map(|loc| format!(" at {}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_default();
        append_to_log_file(&format!(
            "[{}] [PANIC]{} {}",
            Local::now().format("%H:%M:%S%.3f"),
            location,
            msg
        ));
        default_hook(panic_info);
    }));
}

/// First Ctrl-C asks the scan to stop after the current step; a second one exits.
fn install_interrupt_handler(abort: Arc<AtomicBool>) {
    thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!("Ctrl-C handling unavailable: {}", e);
                return;
            }
        };
        runtime.block_on(async move {
            loop {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Ctrl-C handling unavailable: {}", e);
                    return;
                }
                if abort.swap(true, Ordering::SeqCst) {
                    error!("Second interrupt, exiting immediately");
                    std::process::exit(130);
                }
                warn!("Interrupt received, stopping after the current step (Ctrl-C again to force quit)");
            }
        });
    });
}

fn main() -> Result<()> {
    install_panic_hook();
    paths::ensure_directories()?;
    init_logging();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref());

    match cli.command {
        Commands::Scan(args) => {
            if let Some(count) = args.count {
                config.target_count = count;
            }
            if let Some(max_scrolls) = args.max_scrolls {
                config.max_scrolls = max_scrolls;
            }
            if let Some(strategy) = args.strategy {
                config.strategy = strategy;
            }
            let options = RunOptions {
                fast: args.fast,
                use_lookup: !args.no_lookup,
                debug_images: args.debug_images,
                notes: args.notes,
            };

            let abort = Arc::new(AtomicBool::new(false));
            install_interrupt_handler(abort.clone());

            let summary = runner::run_scan(config, &options, abort)?;
            info!(
                "Session {} finished as {} ({} of {} attempts succeeded)",
                summary.session_id, summary.status, summary.counts.succeeded, summary.counts.attempted
            );
        }
        Commands::Retry(args) => {
            let session = if args.last { None } else { args.session };
            let report = runner::run_retry(&config, session)?;
            for (identifier, reason) in &report.needs_rescan {
                info!("  {} needs a new visual scan ({})", identifier, reason);
            }
            info!(
                "{} recovered, {} still failing, {} need a new scan",
                report.recovered.len(),
                report.still_failed.len(),
                report.needs_rescan.len()
            );
        }
        Commands::Shift(args) => {
            match runner::run_shift(&config, &args.before, &args.after, args.expected, args.radius)? {
                Some(measured) => info!(
                    "Measured offset {}px (residual {:.2}), expected {}px, drift {:+}px",
                    measured.offset_px,
                    measured.residual,
                    args.expected.unwrap_or(config.shift.expected_offset),
                    measured.offset_px - args.expected.unwrap_or(config.shift.expected_offset)
                ),
                None => warn!("No overlapping window in the search range"),
            }
        }
        Commands::Sessions(args) => {
            let sessions = runner::list_sessions(args.limit)?;
            info!("{} sessions in {}", sessions.len(), runner::database_path().display());
            for session in sessions {
                info!(
                    "{}  {}  {:<11}  target {:>5}  ok {:>5}  failed {:>5}  skipped {:>5}",
                    session.id,
                    session.started_at.format("%Y-%m-%d %H:%M"),
                    session.status.as_str(),
                    session.target_count,
                    session.counts.succeeded,
                    session.counts.failed,
                    session.counts.skipped
                );
            }
        }
    }

    Ok(())
}
