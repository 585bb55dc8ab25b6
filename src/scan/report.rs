//! Final scan summary and the per-session entries CSV.
//!
//! The CSV is opened in append mode for every row, so entries committed before
//! a crash are already on disk.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::enrich::EnrichmentSummary;
use crate::ledger::{FailedEntry, SessionCounts, SessionStatus};

const CSV_HEADER: &str = "rank,identifier,value,group,observed_at";

/// Measured-minus-expected scroll distance over a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DriftStats {
    pub samples: u32,
    pub mean_px: f32,
    pub max_abs_px: i32,
}

impl DriftStats {
    pub fn from_samples(samples: &[i32]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let sum: i64 = samples.iter().map(|&d| d as i64).sum();
        Self {
            samples: samples.len() as u32,
            mean_px: sum as f32 / samples.len() as f32,
            max_abs_px: samples.iter().map(|d| d.abs()).max().unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanSummary {
    pub session_id: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub counts: SessionCounts,
    pub pages: u32,
    pub scrolls: u32,
    pub drift: DriftStats,
    pub enrichment: EnrichmentSummary,
    /// Identifiers a `retry` run can still fix
    #[serde(skip)]
    pub retryable: Vec<FailedEntry>,
}

impl ScanSummary {
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    /// Succeeded attempts as a percentage of all attempts.
    pub fn success_rate(&self) -> f64 {
        if self.counts.attempted == 0 {
            0.0
        } else {
            self.counts.succeeded as f64 / self.counts.attempted as f64 * 100.0
        }
    }
}

fn format_duration(duration: chrono::Duration) -> String {
    let secs = duration.num_seconds().max(0);
    format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

pub fn render_report(summary: &ScanSummary) -> String {
    let rule = "========================================";
    let thin = "----------------------------------------";
    let mut lines = vec![
        rule.to_string(),
        "         LEADERBOARD SCAN REPORT".to_string(),
        rule.to_string(),
        format!("Session ID: {}", summary.session_id),
        format!("Status:     {}", summary.status),
        format!("Start Time: {}", summary.started_at.format("%Y-%m-%d %H:%M:%S")),
        format!("End Time:   {}", summary.finished_at.format("%Y-%m-%d %H:%M:%S")),
        format!("Duration:   {}", format_duration(summary.duration())),
        thin.to_string(),
        format!("Attempted:           {}", summary.counts.attempted),
        format!("Succeeded:           {}", summary.counts.succeeded),
        format!("Failed:              {}", summary.counts.failed),
        format!("Skipped:             {}", summary.counts.skipped),
        format!("Pages / Scrolls:     {} / {}", summary.pages, summary.scrolls),
        format!("Success Rate:        {:.1}%", summary.success_rate()),
        format!(
            "Drift:               {} samples, mean {:+.1}px, max |{}|px",
            summary.drift.samples, summary.drift.mean_px, summary.drift.max_abs_px
        ),
        thin.to_string(),
        format!(
            "Enrichment:          {} dispatched, {} created, {} updated",
            summary.enrichment.dispatched, summary.enrichment.created, summary.enrichment.updated
        ),
        format!(
            "                     {} rejected, {} lookup failed, {} store failed, {} abandoned",
            summary.enrichment.rejected,
            summary.enrichment.lookup_failed,
            summary.enrichment.store_failed,
            summary.enrichment.abandoned
        ),
        rule.to_string(),
    ];

    let retryable: Vec<_> = summary
        .retryable
        .iter()
        .filter(|f| f.failure_reason().is_some_and(|r| !r.needs_visual_scan()))
        .collect();
    if !retryable.is_empty() {
        lines.push(format!("Retryable identifiers ({}):", retryable.len()));
        for entry in &retryable {
            lines.push(format!("  {} ({})", entry.identifier, entry.reason));
        }
        lines.push(String::new());
        lines.push("To retry failed identifiers (lookup and store only), run:".to_string());
        lines.push(format!("  leaderboard-scan retry --session {}", summary.session_id));
        lines.push(rule.to_string());
    }

    lines.join("\n")
}

/// Writes the report as `scan_report_<start time>.txt` into `dir`.
pub fn write_report(dir: &Path, summary: &ScanSummary) -> Result<PathBuf> {
    fs::create_dir_all(dir).context("Failed to create reports directory")?;
    let path = dir.join(format!(
        "scan_report_{}.txt",
        summary.started_at.format("%Y%m%d_%H%M%S")
    ));
    fs::write(&path, render_report(summary))
        .with_context(|| format!("Failed to write report {}", path.display()))?;
    Ok(path)
}

/// One committed entry, as written to the CSV.
#[derive(Debug, Clone)]
pub struct EntryRow<'a> {
    pub rank: u32,
    pub identifier: &'a str,
    pub value: u64,
    pub group_name: Option<&'a str>,
    pub observed_at: DateTime<Local>,
}

/// Quotes a field when it contains a separator, quote or newline.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Append-only `<session>_entries.csv`.
#[derive(Debug, Clone)]
pub struct EntryLog {
    path: PathBuf,
}

impl EntryLog {
    /// Creates the file with a header unless it already has content.
    pub fn open(dir: &Path, session_id: &str) -> Result<Self> {
        fs::create_dir_all(dir).context("Failed to create reports directory")?;
        let path = dir.join(format!("{}_entries.csv", session_id));

        if path.exists() {
            let file = File::open(&path).context("Failed to open existing CSV")?;
            if BufReader::new(file).lines().next().is_some() {
                return Ok(Self { path });
            }
        }

        let mut file = File::create(&path).context("Failed to create CSV file")?;
        writeln!(file, "{}", CSV_HEADER).context("Failed to write CSV header")?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, row: &EntryRow) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("Failed to open CSV for append")?;

        writeln!(
            file,
            "{},{},{},{},{}",
            row.rank,
            csv_field(row.identifier),
            row.value,
            csv_field(row.group_name.unwrap_or_default()),
            row.observed_at.format("%Y-%m-%dT%H:%M:%S"),
        )
        .context("Failed to write CSV row")?;
        Ok(())
    }
}
