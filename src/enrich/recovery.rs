//! Enrichment-only retry of a session's failed identifiers.
//!
//! Uses the ledger alone: values come from the identifier's last successful
//! attempt, so no visual scan is needed.

use anyhow::{bail, Result};
use chrono::Local;
use log::{info, warn};
use serde::Serialize;

use super::queue::EnrichmentTask;
use super::worker::{enrich_entry, EnrichmentContext};
use crate::ledger::{AttemptOutcome, AttemptPosition, FailedEntry, ScanProgressLedger};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryReport {
    pub recovered: Vec<String>,
    /// Identifier and the reason of the new failure
    pub still_failed: Vec<(String, String)>,
    /// Identifier and original reason; only a new scan can fix these
    pub needs_rescan: Vec<(String, String)>,
}

fn retryable_value(ledger: &ScanProgressLedger, session_id: &str, entry: &FailedEntry) -> Result<Option<(u64, Option<u32>)>> {
    if entry.failure_reason().is_none_or(|r| r.needs_visual_scan()) {
        return Ok(None);
    }
    if let Some(found) = ledger.last_success_value(session_id, &entry.identifier)? {
        return Ok(Some(found));
    }
    Ok(entry.numeric_value.map(|v| (v, entry.rank)))
}

pub fn retry_failed(
    ledger: &ScanProgressLedger,
    ctx: &EnrichmentContext,
    session_id: &str,
) -> Result<RecoveryReport> {
    if ledger.session(session_id)?.is_none() {
        bail!("unknown scan session {session_id}");
    }

    let failed = ledger.list_failed(session_id)?;
    info!("Retrying {} failed identifiers from {}", failed.len(), session_id);

    let mut report = RecoveryReport::default();
    for entry in failed {
        let Some((value, rank)) = retryable_value(ledger, session_id, &entry)? else {
            info!("  {} needs a new scan ({})", entry.identifier, entry.reason);
            report.needs_rescan.push((entry.identifier, entry.reason));
            continue;
        };

        let task = EnrichmentTask {
            session_id: session_id.to_string(),
            identifier: entry.identifier.clone(),
            value,
            group_name: None,
            position: AttemptPosition::new(rank, 0, 0),
            observed_at: Local::now(),
        };

        let outcome = enrich_entry(ctx, &task);
        let (attempt, reason) = match outcome.ledger_entry() {
            None => (AttemptOutcome::Recovered, None),
            Some((attempt, reason)) => (attempt, Some(reason)),
        };
        ledger.record_attempt(session_id, Some(&entry.identifier), attempt, reason, Some(value), task.position)?;

        match reason {
            None => {
                info!("  Recovered {}", entry.identifier);
                report.recovered.push(entry.identifier);
            }
            Some(reason) => {
                warn!("  {} still failing ({})", entry.identifier, reason);
                report.still_failed.push((entry.identifier, reason.to_string()));
            }
        }
    }

    info!(
        "Retry finished: {} recovered, {} still failing, {} need a new scan",
        report.recovered.len(),
        report.still_failed.len(),
        report.needs_rescan.len()
    );
    Ok(report)
}
