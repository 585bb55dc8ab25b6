//! Per-session record of entry attempts.
//!
//! Every attempt is one appended row plus an additive update of the session
//! counters, both inside a single transaction, so an interrupted scan leaves a
//! consistent partial record.

pub mod models;

use anyhow::{bail, Context, Result};
use chrono::Local;
use log::{debug, info};
use rusqlite::{params, OptionalExtension, Row};

use crate::db::{parse_datetime, parse_optional_datetime, to_i64, to_u64, Database};

pub use models::{
    AttemptOutcome, AttemptPosition, FailedEntry, FailureReason, ScanSession, SessionCounts,
    SessionOptions, SessionStatus, PLACEHOLDER_PREFIX,
};
#[cfg(test)]
pub use models::AttemptRecord;

#[derive(Clone)]
pub struct ScanProgressLedger {
    db: Database,
}

fn row_to_session(row: &Row) -> Result<ScanSession> {
    let started_at: String = row.get("started_at")?;
    let finished_at: Option<String> = row.get("finished_at")?;
    let status: String = row.get("status")?;
    let target_count: i64 = row.get("target_count")?;
    let use_lookup: i64 = row.get("use_lookup")?;

    Ok(ScanSession {
        id: row.get("id")?,
        started_at: parse_datetime(&started_at, "started_at")?,
        finished_at: parse_optional_datetime(finished_at, "finished_at")?,
        status: SessionStatus::parse(&status)?,
        target_count: to_u64(target_count, "target_count")? as u32,
        strategy: row.get("strategy")?,
        use_lookup: use_lookup != 0,
        notes: row.get("notes")?,
        counts: SessionCounts {
            attempted: to_u64(row.get("attempted")?, "attempted")?,
            succeeded: to_u64(row.get("succeeded")?, "succeeded")?,
            failed: to_u64(row.get("failed")?, "failed")?,
            skipped: to_u64(row.get("skipped")?, "skipped")?,
        },
    })
}

#[cfg(test)]
fn row_to_attempt(row: &Row) -> Result<AttemptRecord> {
    let outcome: String = row.get("outcome")?;
    let recorded_at: String = row.get("recorded_at")?;
    let numeric_value: Option<i64> = row.get("numeric_value")?;
    let rank: Option<i64> = row.get("rank")?;
    let attempt_number: i64 = row.get("attempt_number")?;

    Ok(AttemptRecord {
        session_id: row.get("session_id")?,
        identifier: row.get("identifier")?,
        attempt_number: to_u64(attempt_number, "attempt_number")? as u32,
        outcome: AttemptOutcome::parse(&outcome)?,
        reason: row.get("reason")?,
        numeric_value: numeric_value.map(|v| to_u64(v, "numeric_value")).transpose()?,
        rank: rank.map(|r| to_u64(r, "rank").map(|r| r as u32)).transpose()?,
        recorded_at: parse_datetime(&recorded_at, "recorded_at")?,
    })
}

const SESSION_COLUMNS: &str = "id, started_at, finished_at, status, target_count, strategy, \
     use_lookup, notes, attempted, succeeded, failed, skipped";

impl ScanProgressLedger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Opens a new session in `running` state and returns its id.
    pub fn start_session(&self, target_count: u32, options: &SessionOptions) -> Result<String> {
        let now = Local::now();
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        let session_id = format!("scan_{}_{}", now.format("%Y%m%d_%H%M%S"), &uuid[..8]);
        let options = options.clone();
        let id = session_id.clone();

        self.db.execute(move |conn| {
            conn.execute(
                "INSERT INTO scan_sessions (id, started_at, status, target_count, strategy, use_lookup, notes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id,
                    now.to_rfc3339(),
                    SessionStatus::Running.as_str(),
                    target_count,
                    options.strategy,
                    options.use_lookup as i64,
                    options.notes,
                ],
            )
            .context("failed to insert scan session")?;
            Ok(())
        })?;

        info!("Started scan session {}", session_id);
        Ok(session_id)
    }

    /// Appends one attempt and returns its attempt number.
    ///
    /// `identifier` of `None` is stored under the position's placeholder key.
    pub fn record_attempt(
        &self,
        session_id: &str,
        identifier: Option<&str>,
        outcome: AttemptOutcome,
        reason: Option<FailureReason>,
        numeric_value: Option<u64>,
        position: AttemptPosition,
    ) -> Result<u32> {
        let key = match identifier {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => position.placeholder_key(),
        };
        let session_id = session_id.to_string();
        let numeric_value = numeric_value.map(to_i64).transpose()?;
        let recorded_at = Local::now().to_rfc3339();

        let attempt_number = self.db.execute(move |conn| {
            let tx = conn.transaction().context("failed to open attempt transaction")?;

            let next: i64 = tx
                .query_row(
                    "SELECT COALESCE(MAX(attempt_number), 0) + 1 FROM scan_attempts
                     WHERE session_id = ?1 AND identifier = ?2",
                    params![session_id, key],
                    |row| row.get(0),
                )
                .context("failed to compute attempt number")?;

            tx.execute(
                "INSERT INTO scan_attempts
                 (session_id, identifier, attempt_number, outcome, reason, numeric_value, rank, page, row_slot, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    session_id,
                    key,
                    next,
                    outcome.as_str(),
                    reason.map(|r| r.as_str()),
                    numeric_value,
                    position.rank,
                    position.page,
                    position.row_slot,
                    recorded_at,
                ],
            )
            .with_context(|| format!("failed to insert attempt for {key}"))?;

            let (attempted, succeeded, failed, skipped) = outcome.counter_deltas();
            let updated = tx
                .execute(
                    "UPDATE scan_sessions
                     SET attempted = attempted + ?1,
                         succeeded = succeeded + ?2,
                         failed = failed + ?3,
                         skipped = skipped + ?4
                     WHERE id = ?5",
                    params![attempted, succeeded, failed, skipped, session_id],
                )
                .context("failed to update session counters")?;
            if updated == 0 {
                bail!("unknown scan session {session_id}");
            }

            tx.commit().context("failed to commit attempt")?;
            debug!(
                "Recorded attempt #{} for {} ({}{})",
                next,
                key,
                outcome,
                reason.map(|r| format!(", {}", r)).unwrap_or_default()
            );
            Ok(next)
        })?;

        Ok(attempt_number as u32)
    }

    /// Moves a running session into a terminal status.
    ///
    /// Calling it again with the same status is a no-op; a different terminal
    /// status is rejected and the stored one is kept.
    pub fn finalize(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        if !status.is_terminal() {
            bail!("cannot finalize session {session_id} as {status}");
        }
        let session_id = session_id.to_string();
        let finished_at = Local::now().to_rfc3339();

        self.db.execute(move |conn| {
            let tx = conn.transaction().context("failed to open finalize transaction")?;
            let current: Option<String> = tx
                .query_row(
                    "SELECT status FROM scan_sessions WHERE id = ?1",
                    params![session_id],
                    |row| row.get(0),
                )
                .optional()
                .context("failed to read session status")?;

            let Some(current) = current else {
                bail!("unknown scan session {session_id}");
            };
            let current = SessionStatus::parse(&current)?;

            if current == status {
                debug!("Session {} already finalized as {}", session_id, status);
                return Ok(());
            }
            if current.is_terminal() {
                bail!("session {session_id} already finalized as {current}, refusing {status}");
            }

            tx.execute(
                "UPDATE scan_sessions SET status = ?1, finished_at = ?2 WHERE id = ?3",
                params![status.as_str(), finished_at, session_id],
            )
            .context("failed to finalize session")?;
            tx.commit().context("failed to commit finalize")?;

            info!("Session {} finalized as {}", session_id, status);
            Ok(())
        })
    }

    /// Identifiers whose latest decisive attempt failed, with that failure's reason.
    ///
    /// Placeholder keys are excluded since they cannot be retried by identifier.
    pub fn list_failed(&self, session_id: &str) -> Result<Vec<FailedEntry>> {
        let session_id = session_id.to_string();
        let pattern = format!("{}%", PLACEHOLDER_PREFIX.replace('_', "\\_"));

        self.db.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT a.identifier, a.reason, a.numeric_value, a.rank
                 FROM scan_attempts a
                 WHERE a.session_id = ?1
                   AND a.outcome IN ('failed', 'enrichment_failed')
                   AND a.identifier NOT LIKE ?2 ESCAPE '\\'
                   AND a.attempt_number = (
                       SELECT MAX(b.attempt_number) FROM scan_attempts b
                       WHERE b.session_id = a.session_id
                         AND b.identifier = a.identifier
                         AND b.outcome IN ('success', 'failed', 'recovered', 'enrichment_failed'))
                 ORDER BY a.id",
            )?;

            let rows = stmt.query_map(params![session_id, pattern], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                ))
            })?;

            let mut failed = Vec::new();
            for row in rows {
                let (identifier, reason, value, rank) = row?;
                failed.push(FailedEntry {
                    identifier,
                    reason: reason.unwrap_or_else(|| "unknown".to_string()),
                    numeric_value: value.map(|v| to_u64(v, "numeric_value")).transpose()?,
                    rank: rank.map(|r| to_u64(r, "rank").map(|r| r as u32)).transpose()?,
                });
            }
            Ok(failed)
        })
    }

    /// Value and rank from the identifier's most recent successful attempt.
    pub fn last_success_value(
        &self,
        session_id: &str,
        identifier: &str,
    ) -> Result<Option<(u64, Option<u32>)>> {
        let session_id = session_id.to_string();
        let identifier = identifier.to_string();

        self.db.execute(move |conn| {
            let row: Option<(Option<i64>, Option<i64>)> = conn
                .query_row(
                    "SELECT numeric_value, rank FROM scan_attempts
                     WHERE session_id = ?1 AND identifier = ?2 AND outcome = 'success'
                     ORDER BY attempt_number DESC LIMIT 1",
                    params![session_id, identifier],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match row {
                Some((Some(value), rank)) => Ok(Some((
                    to_u64(value, "numeric_value")?,
                    rank.map(|r| to_u64(r, "rank").map(|r| r as u32)).transpose()?,
                ))),
                _ => Ok(None),
            }
        })
    }

    pub fn session(&self, session_id: &str) -> Result<Option<ScanSession>> {
        let session_id = session_id.to_string();
        self.db.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM scan_sessions WHERE id = ?1"
            ))?;
            let mut rows = stmt.query(params![session_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_session(row)?)),
                None => Ok(None),
            }
        })
    }

    #[cfg(test)]
    pub fn attempts(&self, session_id: &str) -> Result<Vec<AttemptRecord>> {
        let session_id = session_id.to_string();
        self.db.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, identifier, attempt_number, outcome, reason, numeric_value, rank, recorded_at
                 FROM scan_attempts WHERE session_id = ?1 ORDER BY id",
            )?;
            let mut rows = stmt.query(params![session_id])?;
            let mut attempts = Vec::new();
            while let Some(row) = rows.next()? {
                attempts.push(row_to_attempt(row)?);
            }
            Ok(attempts)
        })
    }

    pub fn last_session_id(&self) -> Result<Option<String>> {
        self.db.execute(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id FROM scan_sessions ORDER BY started_at DESC, rowid DESC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    pub fn recent_sessions(&self, limit: u32) -> Result<Vec<ScanSession>> {
        self.db.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM scan_sessions
                 ORDER BY started_at DESC, rowid DESC LIMIT ?1"
            ))?;
            let mut rows = stmt.query(params![limit])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }
            Ok(sessions)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> ScanProgressLedger {
        ScanProgressLedger::new(Database::open_in_memory().unwrap())
    }

    fn options() -> SessionOptions {
        SessionOptions {
            strategy: "markers".to_string(),
            use_lookup: false,
            notes: None,
        }
    }

    #[test]
    fn test_start_session_is_running() {
        let ledger = ledger();
        let id = ledger.start_session(100, &options()).unwrap();
        assert!(id.starts_with("scan_"));

        let session = ledger.session(&id).unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Running);
        assert_eq!(session.target_count, 100);
        assert_eq!(session.counts, SessionCounts::default());
        assert!(session.finished_at.is_none());
    }

    #[test]
    fn test_attempt_numbers_increase_per_identifier() {
        let ledger = ledger();
        let id = ledger.start_session(10, &options()).unwrap();
        let pos = AttemptPosition::new(Some(1), 1, 0);

        let first = ledger
            .record_attempt(&id, Some("123456789"), AttemptOutcome::Failed, Some(FailureReason::LookupFailed), Some(5000), pos)
            .unwrap();
        let second = ledger
            .record_attempt(&id, Some("123456789"), AttemptOutcome::Success, None, Some(5000), pos)
            .unwrap();
        let third = ledger
            .record_attempt(&id, Some("123456789"), AttemptOutcome::Duplicate, Some(FailureReason::DuplicateInSession), None, pos)
            .unwrap();
        let other = ledger
            .record_attempt(&id, Some("987654321"), AttemptOutcome::Success, None, Some(4000), pos)
            .unwrap();

        assert_eq!((first, second, third), (1, 2, 3));
        assert_eq!(other, 1);
    }

    #[test]
    fn test_unknown_identifiers_use_distinct_placeholders() {
        let ledger = ledger();
        let id = ledger.start_session(10, &options()).unwrap();

        let a = ledger
            .record_attempt(&id, None, AttemptOutcome::Failed, Some(FailureReason::InvalidValue), None, AttemptPosition::new(Some(4), 1, 3))
            .unwrap();
        let b = ledger
            .record_attempt(&id, Some("  "), AttemptOutcome::Failed, Some(FailureReason::InvalidValue), None, AttemptPosition::new(Some(5), 1, 4))
            .unwrap();
        assert_eq!((a, b), (1, 1));

        let attempts = ledger.attempts(&id).unwrap();
        assert_eq!(attempts[0].identifier, "unknown_rank_4_page_1_row_3");
        assert_eq!(attempts[1].identifier, "unknown_rank_5_page_1_row_4");
    }

    #[test]
    fn test_counters_follow_outcomes() {
        let ledger = ledger();
        let id = ledger.start_session(10, &options()).unwrap();
        let pos = AttemptPosition::default();

        ledger.record_attempt(&id, Some("a"), AttemptOutcome::Success, None, Some(1), pos).unwrap();
        ledger.record_attempt(&id, Some("b"), AttemptOutcome::Success, None, Some(1), pos).unwrap();
        ledger.record_attempt(&id, None, AttemptOutcome::Failed, Some(FailureReason::InvalidValue), None, pos).unwrap();
        ledger.record_attempt(&id, Some("a"), AttemptOutcome::Duplicate, Some(FailureReason::DuplicateInSession), None, pos).unwrap();

        let counts = ledger.session(&id).unwrap().unwrap().counts;
        assert_eq!(
            counts,
            SessionCounts {
                attempted: 3,
                succeeded: 2,
                failed: 1,
                skipped: 1
            }
        );
    }

    #[test]
    fn test_enrichment_failure_keeps_counts() {
        let ledger = ledger();
        let id = ledger.start_session(10, &options()).unwrap();
        let pos = AttemptPosition::new(Some(1), 1, 1);

        ledger.record_attempt(&id, Some("444444444"), AttemptOutcome::Success, None, Some(7000), pos).unwrap();
        ledger
            .record_attempt(&id, Some("444444444"), AttemptOutcome::EnrichmentFailed, Some(FailureReason::StoreFailed), Some(7000), pos)
            .unwrap();

        let counts = ledger.session(&id).unwrap().unwrap().counts;
        assert_eq!(
            counts,
            SessionCounts {
                attempted: 1,
                succeeded: 1,
                failed: 0,
                skipped: 0
            }
        );
        let failed = ledger.list_failed(&id).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].failure_reason(), Some(FailureReason::StoreFailed));
    }

    #[test]
    fn test_record_attempt_for_unknown_session_fails() {
        let ledger = ledger();
        let result = ledger.record_attempt(
            "scan_missing",
            Some("a"),
            AttemptOutcome::Success,
            None,
            None,
            AttemptPosition::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_finalize_is_idempotent_for_same_status() {
        let ledger = ledger();
        let id = ledger.start_session(10, &options()).unwrap();

        ledger.finalize(&id, SessionStatus::Interrupted).unwrap();
        let first = ledger.session(&id).unwrap().unwrap();
        ledger.finalize(&id, SessionStatus::Interrupted).unwrap();
        let second = ledger.session(&id).unwrap().unwrap();

        assert_eq!(second.status, SessionStatus::Interrupted);
        assert_eq!(first.finished_at, second.finished_at);
    }

    #[test]
    fn test_finalize_rejects_conflicting_status() {
        let ledger = ledger();
        let id = ledger.start_session(10, &options()).unwrap();

        ledger.finalize(&id, SessionStatus::Completed).unwrap();
        assert!(ledger.finalize(&id, SessionStatus::Failed).is_err());
        assert!(ledger.finalize(&id, SessionStatus::Running).is_err());
        assert_eq!(
            ledger.session(&id).unwrap().unwrap().status,
            SessionStatus::Completed
        );
    }

    #[test]
    fn test_list_failed_uses_latest_attempt() {
        let ledger = ledger();
        let id = ledger.start_session(10, &options()).unwrap();
        let pos = AttemptPosition::new(Some(3), 1, 2);

        // success followed by an enrichment failure: retryable
        ledger.record_attempt(&id, Some("111111111"), AttemptOutcome::Success, None, Some(9000), pos).unwrap();
        ledger.record_attempt(&id, Some("111111111"), AttemptOutcome::EnrichmentFailed, Some(FailureReason::LookupFailed), Some(9000), pos).unwrap();

        // failed then recovered: not listed
        ledger.record_attempt(&id, Some("222222222"), AttemptOutcome::Failed, Some(FailureReason::StoreFailed), Some(8000), pos).unwrap();
        ledger.record_attempt(&id, Some("222222222"), AttemptOutcome::Recovered, None, Some(8000), pos).unwrap();

        // placeholder failures are never listed
        ledger.record_attempt(&id, None, AttemptOutcome::Failed, Some(FailureReason::InvalidValue), None, pos).unwrap();

        let failed = ledger.list_failed(&id).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].identifier, "111111111");
        assert_eq!(failed[0].failure_reason(), Some(FailureReason::LookupFailed));
        assert_eq!(failed[0].numeric_value, Some(9000));
        assert_eq!(failed[0].rank, Some(3));
    }

    #[test]
    fn test_last_success_value() {
        let ledger = ledger();
        let id = ledger.start_session(10, &options()).unwrap();
        let pos = AttemptPosition::new(Some(7), 2, 1);
        ledger.record_attempt(&id, Some("333333333"), AttemptOutcome::Success, None, Some(12345), pos).unwrap();

        assert_eq!(
            ledger.last_success_value(&id, "333333333").unwrap(),
            Some((12345, Some(7)))
        );
        assert_eq!(ledger.last_success_value(&id, "nobody").unwrap(), None);
    }

    #[test]
    fn test_recent_sessions_newest_first() {
        let ledger = ledger();
        let first = ledger.start_session(1, &options()).unwrap();
        let second = ledger.start_session(2, &options()).unwrap();

        let sessions = ledger.recent_sessions(10).unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].id, second);
        assert_eq!(sessions[1].id, first);
        assert_eq!(ledger.last_session_id().unwrap(), Some(second));
    }
}
