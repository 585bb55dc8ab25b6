//! Background enrichment: identity lookup and persistence of committed entries.
//!
//! Workers share one receiver and one rate limiter (inside the lookup). Closing
//! the pool is a join barrier: every dispatched task is either enriched or
//! recorded as abandoned before `close` returns.

use anyhow::{anyhow, Result};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use super::lookup::{IdentityLookup, IdentityProfile, LookupResult};
use super::queue::{create_task_queue, EnrichmentTask};
use super::store::{EntityStore, EntityUpdate};
use crate::ledger::{AttemptOutcome, FailureReason, ScanProgressLedger};
use crate::retry::{attempt_with_retry, RetryPolicy, Step};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub workers: usize,
    /// Tasks allowed to wait before `dispatch` blocks
    pub queue_capacity: usize,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 16,
        }
    }
}

/// Everything one enrichment needs besides the task itself.
#[derive(Clone)]
pub struct EnrichmentContext {
    pub store: Arc<dyn EntityStore>,
    /// `None` when remote lookups are disabled
    pub lookup: Option<Arc<dyn IdentityLookup>>,
    pub retry: RetryPolicy,
    /// Look up identifiers that are already stored, not only new ones
    pub use_lookup: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichmentOutcome {
    Created,
    Updated,
    /// Lookup says the identifier does not exist; nothing was stored.
    Rejected,
    /// New identifier could not be verified; nothing was stored.
    LookupFailed,
    StoreFailed,
}

impl EnrichmentOutcome {
    /// Ledger entry to append for this outcome, if any.
    pub fn ledger_entry(&self) -> Option<(AttemptOutcome, FailureReason)> {
        match self {
            EnrichmentOutcome::Created | EnrichmentOutcome::Updated => None,
            EnrichmentOutcome::Rejected => Some((AttemptOutcome::Skipped, FailureReason::IdentityRejected)),
            EnrichmentOutcome::LookupFailed => Some((AttemptOutcome::EnrichmentFailed, FailureReason::LookupFailed)),
            EnrichmentOutcome::StoreFailed => Some((AttemptOutcome::EnrichmentFailed, FailureReason::StoreFailed)),
        }
    }
}

/// Looks up and persists one entry.
///
/// New identifiers are always verified when a lookup is available. Stored
/// identifiers are looked up when `use_lookup` is set or when their region id
/// is missing.
pub fn enrich_entry(ctx: &EnrichmentContext, task: &EnrichmentTask) -> EnrichmentOutcome {
    let id = task.identifier.as_str();

    let existing = match ctx.store.find_entity(id) {
        Ok(existing) => existing,
        Err(e) => {
            error!("Store read failed for {}: {:#}", id, e);
            return EnrichmentOutcome::StoreFailed;
        }
    };
    let is_new = existing.is_none();
    let missing_region = existing.as_ref().is_some_and(|e| e.region_id.is_none());

    let mut profile: Option<IdentityProfile> = None;
    if let Some(lookup) = &ctx.lookup {
        if is_new || ctx.use_lookup || missing_region {
            if missing_region && !ctx.use_lookup {
                info!("Healing missing region id for {}", id);
            }

            let result = attempt_with_retry(&ctx.retry, "identity lookup", |_| match lookup.fetch(id) {
                Some(result) => Step::Ok(result),
                None => Step::Skip(FailureReason::LookupFailed),
            });

            match result {
                Step::Ok(LookupResult::Found(found)) => profile = Some(found),
                Step::Ok(LookupResult::NotFound) if is_new => {
                    warn!("Identifier {} rejected by lookup, not saving", id);
                    return EnrichmentOutcome::Rejected;
                }
                Step::Ok(LookupResult::NotFound) => {
                    warn!("Stored identifier {} not found remotely, keeping scan data", id);
                }
                _ if is_new => {
                    warn!("Could not verify new identifier {}, not saving", id);
                    return EnrichmentOutcome::LookupFailed;
                }
                _ => warn!("Lookup failed for {}, saving scan data only", id),
            }
        }
    }

    let profile = profile.unwrap_or_default();
    let update = EntityUpdate {
        identifier: id.to_string(),
        display_name: profile.display_name,
        group_name: task.group_name.clone(),
        avatar_url: profile.avatar_url,
        region_id: profile.region_id,
        level: profile.level,
        level_label: profile.level_label,
        value: Some(task.value),
        rank: task.rank(),
    };

    let stored = ctx
        .store
        .upsert_entity(&update, task.observed_at)
        .and_then(|_| {
            ctx.store
                .insert_history_point(id, task.value, task.rank(), task.observed_at)
        });
    if let Err(e) = stored {
        error!("Store write failed for {}: {:#}", id, e);
        return EnrichmentOutcome::StoreFailed;
    }

    let outcome = if is_new {
        EnrichmentOutcome::Created
    } else {
        EnrichmentOutcome::Updated
    };
    info!(
        "[BG] {:?} {} ({})",
        outcome,
        id,
        update.display_name.as_deref().unwrap_or("N/A")
    );
    outcome
}

/// Counters reported once the pool has shut down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnrichmentSummary {
    pub dispatched: u64,
    pub created: u64,
    pub updated: u64,
    pub rejected: u64,
    pub lookup_failed: u64,
    pub store_failed: u64,
    pub abandoned: u64,
}

#[derive(Debug, Default)]
struct PoolStats {
    dispatched: AtomicU64,
    created: AtomicU64,
    updated: AtomicU64,
    rejected: AtomicU64,
    lookup_failed: AtomicU64,
    store_failed: AtomicU64,
    abandoned: AtomicU64,
}

impl PoolStats {
    fn count(&self, outcome: EnrichmentOutcome) {
        let counter = match outcome {
            EnrichmentOutcome::Created => &self.created,
            EnrichmentOutcome::Updated => &self.updated,
            EnrichmentOutcome::Rejected => &self.rejected,
            EnrichmentOutcome::LookupFailed => &self.lookup_failed,
            EnrichmentOutcome::StoreFailed => &self.store_failed,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn snapshot(&self) -> EnrichmentSummary {
        EnrichmentSummary {
            dispatched: self.dispatched.load(Ordering::SeqCst),
            created: self.created.load(Ordering::SeqCst),
            updated: self.updated.load(Ordering::SeqCst),
            rejected: self.rejected.load(Ordering::SeqCst),
            lookup_failed: self.lookup_failed.load(Ordering::SeqCst),
            store_failed: self.store_failed.load(Ordering::SeqCst),
            abandoned: self.abandoned.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Finish every queued task.
    Drain,
    /// Let in-flight tasks finish; record the rest as abandoned.
    Abandon,
}

/// Where the scan loop hands committed entries.
pub trait EnrichmentSink {
    fn dispatch(&mut self, task: EnrichmentTask) -> Result<()>;

    /// Stops accepting tasks and waits for the workers. Later calls return
    /// the same summary.
    fn close(&mut self, mode: CloseMode) -> EnrichmentSummary;
}

pub struct EnrichmentPool {
    sender: Option<SyncSender<EnrichmentTask>>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<PoolStats>,
    abandon: Arc<AtomicBool>,
}

fn record(ledger: &ScanProgressLedger, task: &EnrichmentTask, outcome: AttemptOutcome, reason: FailureReason) {
    if let Err(e) = ledger.record_attempt(
        &task.session_id,
        Some(&task.identifier),
        outcome,
        Some(reason),
        Some(task.value),
        task.position,
    ) {
        error!("Failed to record {} for {}: {:#}", reason, task.identifier, e);
    }
}

fn run_worker(
    worker_id: usize,
    receiver: Arc<Mutex<Receiver<EnrichmentTask>>>,
    ctx: EnrichmentContext,
    ledger: ScanProgressLedger,
    stats: Arc<PoolStats>,
    abandon: Arc<AtomicBool>,
) {
    info!("Enrichment worker {} started", worker_id);

    loop {
        // Hold the lock only while waiting, not while enriching.
        let next = {
            let receiver = match receiver.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            receiver.recv()
        };
        let Ok(task) = next else {
            break;
        };

        if abandon.load(Ordering::SeqCst) {
            warn!("Abandoning enrichment of {}", task.identifier);
            stats.abandoned.fetch_add(1, Ordering::SeqCst);
            record(&ledger, &task, AttemptOutcome::EnrichmentFailed, FailureReason::EnrichmentAbandoned);
            continue;
        }

        let outcome = enrich_entry(&ctx, &task);
        stats.count(outcome);
        if let Some((attempt, reason)) = outcome.ledger_entry() {
            record(&ledger, &task, attempt, reason);
        }
    }

    info!("Enrichment worker {} finished", worker_id);
}

impl EnrichmentPool {
    pub fn start(config: &EnrichmentConfig, ctx: EnrichmentContext, ledger: ScanProgressLedger) -> Self {
        let (sender, receiver) = create_task_queue(config.queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let stats = Arc::new(PoolStats::default());
        let abandon = Arc::new(AtomicBool::new(false));

        let workers = (1..=config.workers.max(1))
            .map(|worker_id| {
                let receiver = Arc::clone(&receiver);
                let ctx = ctx.clone();
                let ledger = ledger.clone();
                let stats = Arc::clone(&stats);
                let abandon = Arc::clone(&abandon);
                thread::spawn(move || run_worker(worker_id, receiver, ctx, ledger, stats, abandon))
            })
            .collect();

        Self {
            sender: Some(sender),
            workers,
            stats,
            abandon,
        }
    }
}

impl EnrichmentSink for EnrichmentPool {
    fn dispatch(&mut self, task: EnrichmentTask) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow!("enrichment pool is closed"))?;
        sender
            .send(task)
            .map_err(|e| anyhow!("enrichment workers are gone ({})", e.0.identifier))?;
        self.stats.dispatched.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self, mode: CloseMode) -> EnrichmentSummary {
        if mode == CloseMode::Abandon {
            self.abandon.store(true, Ordering::SeqCst);
        }
        // Dropping the sender ends each worker's loop once the queue is empty.
        if self.sender.take().is_some() {
            info!("Waiting for enrichment workers ({:?})...", mode);
        }
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.join() {
                error!("Enrichment worker panicked: {:?}", e);
            }
        }
        self.stats.snapshot()
    }
}

impl Drop for EnrichmentPool {
    fn drop(&mut self) {
        self.close(CloseMode::Drain);
    }
}
