//! Ledger data models.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal and non-terminal states of a scan session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Interrupted => "interrupted",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "running" => Ok(SessionStatus::Running),
            "completed" => Ok(SessionStatus::Completed),
            "interrupted" => Ok(SessionStatus::Interrupted),
            "failed" => Ok(SessionStatus::Failed),
            other => Err(anyhow!("unknown session status '{other}'")),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one entry attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    Success,
    Failed,
    Duplicate,
    Skipped,
    /// Appended by the offline retry pass once a failed identifier was persisted.
    Recovered,
    /// Lookup or persistence failed after the entry was already counted as a success.
    EnrichmentFailed,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Failed => "failed",
            AttemptOutcome::Duplicate => "duplicate",
            AttemptOutcome::Skipped => "skipped",
            AttemptOutcome::Recovered => "recovered",
            AttemptOutcome::EnrichmentFailed => "enrichment_failed",
        }
    }

    #[cfg(test)]
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "success" => Ok(AttemptOutcome::Success),
            "failed" => Ok(AttemptOutcome::Failed),
            "duplicate" => Ok(AttemptOutcome::Duplicate),
            "skipped" => Ok(AttemptOutcome::Skipped),
            "recovered" => Ok(AttemptOutcome::Recovered),
            "enrichment_failed" => Ok(AttemptOutcome::EnrichmentFailed),
            other => Err(anyhow!("unknown attempt outcome '{other}'")),
        }
    }

    /// Column deltas `(attempted, succeeded, failed, skipped)` applied to the session row.
    ///
    /// Outcomes appended after the scan loop already counted the entry leave the
    /// counters alone.
    pub fn counter_deltas(&self) -> (i64, i64, i64, i64) {
        match self {
            AttemptOutcome::Success => (1, 1, 0, 0),
            AttemptOutcome::Failed => (1, 0, 1, 0),
            AttemptOutcome::Duplicate | AttemptOutcome::Skipped => (0, 0, 0, 1),
            AttemptOutcome::Recovered | AttemptOutcome::EnrichmentFailed => (0, 0, 0, 0),
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an entry attempt did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    InvalidValue,
    PageCaptureFailed,
    ProfileCaptureFailed,
    ProfileOcrFailed,
    DuplicateInSession,
    IdentityRejected,
    LookupFailed,
    StoreFailed,
    EnrichmentAbandoned,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::InvalidValue => "invalid_value",
            FailureReason::PageCaptureFailed => "page_capture_failed",
            FailureReason::ProfileCaptureFailed => "profile_capture_failed",
            FailureReason::ProfileOcrFailed => "profile_ocr_failed",
            FailureReason::DuplicateInSession => "duplicate_in_session",
            FailureReason::IdentityRejected => "identity_rejected",
            FailureReason::LookupFailed => "lookup_failed",
            FailureReason::StoreFailed => "store_failed",
            FailureReason::EnrichmentAbandoned => "enrichment_abandoned",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "invalid_value" => Some(FailureReason::InvalidValue),
            "page_capture_failed" => Some(FailureReason::PageCaptureFailed),
            "profile_capture_failed" => Some(FailureReason::ProfileCaptureFailed),
            "profile_ocr_failed" => Some(FailureReason::ProfileOcrFailed),
            "duplicate_in_session" => Some(FailureReason::DuplicateInSession),
            "identity_rejected" => Some(FailureReason::IdentityRejected),
            "lookup_failed" => Some(FailureReason::LookupFailed),
            "store_failed" => Some(FailureReason::StoreFailed),
            "enrichment_abandoned" => Some(FailureReason::EnrichmentAbandoned),
            _ => None,
        }
    }

    /// Failures that can only be fixed by scanning the list again.
    pub fn needs_visual_scan(&self) -> bool {
        matches!(
            self,
            FailureReason::InvalidValue
                | FailureReason::PageCaptureFailed
                | FailureReason::ProfileCaptureFailed
                | FailureReason::ProfileOcrFailed
        )
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where on the list an attempt happened. Used for placeholder keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttemptPosition {
    pub rank: Option<u32>,
    pub page: u32,
    pub row_slot: u32,
}

impl AttemptPosition {
    pub fn new(rank: Option<u32>, page: u32, row_slot: u32) -> Self {
        Self {
            rank,
            page,
            row_slot,
        }
    }

    /// Synthetic identifier for an attempt that never produced one.
    pub fn placeholder_key(&self) -> String {
        let rank = self
            .rank
            .map(|r| r.to_string())
            .unwrap_or_else(|| "na".to_string());
        format!(
            "{}rank_{}_page_{}_row_{}",
            PLACEHOLDER_PREFIX, rank, self.page, self.row_slot
        )
    }
}

pub const PLACEHOLDER_PREFIX: &str = "unknown_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionCounts {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// Settings stored alongside a session row.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub strategy: String,
    pub use_lookup: bool,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanSession {
    pub id: String,
    pub started_at: DateTime<Local>,
    pub finished_at: Option<DateTime<Local>>,
    pub status: SessionStatus,
    pub target_count: u32,
    pub strategy: String,
    pub use_lookup: bool,
    pub notes: Option<String>,
    pub counts: SessionCounts,
}

#[cfg(test)]
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub session_id: String,
    pub identifier: String,
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    pub reason: Option<String>,
    pub numeric_value: Option<u64>,
    pub rank: Option<u32>,
    pub recorded_at: DateTime<Local>,
}

/// A failed identifier and the reason of its most recent failure.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedEntry {
    pub identifier: String,
    pub reason: String,
    pub numeric_value: Option<u64>,
    pub rank: Option<u32>,
}

impl FailedEntry {
    pub fn failure_reason(&self) -> Option<FailureReason> {
        FailureReason::parse(&self.reason)
    }
}
