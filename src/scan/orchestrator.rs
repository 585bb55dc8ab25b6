//! The scan loop.
//!
//! `ScanOrchestrator` owns every collaborator for one session and advances a
//! `ScanState` one step at a time. Each row goes decode → open detail →
//! identify → back → commit. Enrichment runs off the loop through an
//! `EnrichmentSink`. The ledger is finalized exactly once, whatever way the
//! loop ends.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use std::collections::{HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::config::ScanConfig;
use super::report::{render_report, write_report, DriftStats, EntryLog, EntryRow, ScanSummary};
use super::state::ScanState;
use crate::device::{Device, Frame, Point};
use crate::enrich::{CloseMode, EnrichmentSink, EnrichmentTask};
use crate::ledger::{
    AttemptOutcome, AttemptPosition, FailureReason, ScanProgressLedger, SessionOptions,
    SessionStatus,
};
use crate::ocr::{DetailReader, FieldDecoder};
use crate::retry::{attempt_with_retry, Step};
use crate::vision::{default_grid, RowLocator, RowPosition, ShiftEstimator};

/// Collaborators of one scan.
pub struct ScanParts {
    pub device: Box<dyn Device>,
    pub locator: Box<dyn RowLocator>,
    pub decoder: Box<dyn FieldDecoder>,
    pub detail: Box<dyn DetailReader>,
    pub enrichment: Box<dyn EnrichmentSink>,
    pub ledger: ScanProgressLedger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowOutcome {
    Committed,
    Duplicate,
}

fn settle(ms: u64) {
    if ms > 0 {
        thread::sleep(Duration::from_millis(ms));
    }
}

pub struct ScanOrchestrator {
    device: Box<dyn Device>,
    locator: Box<dyn RowLocator>,
    decoder: Box<dyn FieldDecoder>,
    detail: Box<dyn DetailReader>,
    enrichment: Box<dyn EnrichmentSink>,
    ledger: ScanProgressLedger,
    shift: ShiftEstimator,

    config: ScanConfig,
    options: SessionOptions,
    abort: Arc<AtomicBool>,
    entry_log_dir: Option<PathBuf>,
    entry_log: Option<EntryLog>,
    reports_dir: Option<PathBuf>,

    pub state: ScanState,
    session_id: Option<String>,
    started_at: DateTime<Local>,
    finalized: bool,

    frame: Option<Arc<Frame>>,
    pending: VecDeque<RowPosition>,
    seen: HashSet<String>,
    page: u32,
    scrolls: u32,
    row_slot: u32,
    committed: u32,
    /// Highest list index committed so far
    last_processed: u32,
    /// Highest index placed on any earlier page
    prev_pages_max: u32,
    page_max: u32,
    page_progress: u32,
    /// Rows on the current page come from the default grid, not the locator
    page_fallback: bool,
    zero_progress_streak: u32,
    drift: Vec<i32>,
}

impl ScanOrchestrator {
    pub fn new(parts: ScanParts, config: ScanConfig, options: SessionOptions, abort: Arc<AtomicBool>) -> Self {
        Self {
            device: parts.device,
            locator: parts.locator,
            decoder: parts.decoder,
            detail: parts.detail,
            enrichment: parts.enrichment,
            ledger: parts.ledger,
            shift: ShiftEstimator::new(config.shift),
            config,
            options,
            abort,
            entry_log_dir: None,
            entry_log: None,
            reports_dir: None,
            state: ScanState::Init,
            session_id: None,
            started_at: Local::now(),
            finalized: false,
            frame: None,
            pending: VecDeque::new(),
            seen: HashSet::new(),
            page: 0,
            scrolls: 0,
            row_slot: 0,
            committed: 0,
            last_processed: 0,
            prev_pages_max: 0,
            page_max: 0,
            page_progress: 0,
            page_fallback: false,
            zero_progress_streak: 0,
            drift: Vec::new(),
        }
    }

    /// Writes `<session>_entries.csv` and the final report into `dir`.
    pub fn with_output_dir(mut self, dir: PathBuf) -> Self {
        self.entry_log_dir = Some(dir.clone());
        self.reports_dir = Some(dir);
        self
    }

    #[cfg(test)]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// One-line progress summary for the log.
    pub fn progress_string(&self) -> String {
        format!(
            "[{}/{}] page {} - {}",
            self.committed, self.config.target_count, self.page, self.state
        )
    }

    /// Executes one state transition.
    ///
    /// Returns `Ok(true)` while the loop should keep going. `Err` means the
    /// device or the ledger is unusable.
    pub fn step(&mut self) -> Result<bool> {
        if self.state.is_terminal() {
            return Ok(false);
        }
        if self.abort.load(Ordering::SeqCst) {
            info!("Abort requested, stopping scan");
            self.state = ScanState::Aborted;
            return Ok(false);
        }

        match self.state {
            ScanState::Init => self.start()?,
            ScanState::ScanningPage => self.scan_page(),
            ScanState::ProcessingRow => self.next_row(),
            ScanState::Scrolling => self.scroll()?,
            ScanState::Done | ScanState::Aborted | ScanState::Failed(_) => {}
        }

        Ok(!self.state.is_terminal())
    }

    fn start(&mut self) -> Result<()> {
        let session_id = self
            .ledger
            .start_session(self.config.target_count, &self.options)
            .context("Failed to open scan session")?;
        info!(
            "Session {} started: target {} entries, strategy {}",
            session_id,
            self.config.target_count,
            self.locator.name()
        );

        if let Some(dir) = &self.entry_log_dir {
            match EntryLog::open(dir, &session_id) {
                Ok(log) => {
                    info!("Entries CSV: {}", log.path().display());
                    self.entry_log = Some(log);
                }
                Err(e) => warn!("Entries CSV disabled: {:#}", e),
            }
        }
        self.session_id = Some(session_id);
        self.page = 1;

        match self.capture(FailureReason::PageCaptureFailed) {
            Step::Ok(frame) => {
                self.frame = Some(Arc::new(frame));
                self.state = ScanState::ScanningPage;
            }
            Step::Skip(reason) => {
                self.record(None, AttemptOutcome::Failed, Some(reason), None, AttemptPosition::new(None, 1, 0));
                self.state = ScanState::Failed("could not capture the first page".to_string());
            }
            Step::Fatal(msg) => self.state = ScanState::Failed(msg),
        }
        Ok(())
    }

    fn scan_page(&mut self) {
        let Some(frame) = self.frame.clone() else {
            self.state = ScanState::Scrolling;
            return;
        };

        let mut rows = self.locator.locate(&frame);
        self.page_fallback = rows.is_empty();
        if self.page_fallback {
            let first = self.last_processed + 1;
            warn!("No rows placed on page {}, using the default grid from #{}", self.page, first);
            rows = default_grid(&self.config.geometry, first);
        }

        let placed = rows.len();
        let last = self.last_processed;
        self.pending = rows.into_iter().filter(|r| r.index > last).collect();
        info!(
            "Page {}: {} rows placed by {}, {} to process",
            self.page,
            placed,
            self.locator.name(),
            self.pending.len()
        );

        self.row_slot = 0;
        self.page_max = 0;
        self.page_progress = 0;
        self.state = ScanState::ProcessingRow;
    }

    fn next_row(&mut self) {
        if self.committed >= self.config.target_count {
            info!("Reached target of {} entries", self.config.target_count);
            self.state = ScanState::Done;
            return;
        }

        let Some(row) = self.pending.pop_front() else {
            self.finish_page();
            return;
        };

        self.row_slot += 1;
        let new_index = row.index > self.prev_pages_max;

        // Default-grid rows are guesses: only a committed one proves the page
        // reached new entries.
        match self.process_row(&row) {
            Step::Ok(RowOutcome::Duplicate) => {
                if !self.page_fallback {
                    self.page_max = self.page_max.max(row.index);
                }
            }
            Step::Ok(RowOutcome::Committed) => {
                self.page_max = self.page_max.max(row.index);
                self.page_progress += 1;
            }
            Step::Skip(_) => {
                if !self.page_fallback {
                    self.page_max = self.page_max.max(row.index);
                    if new_index {
                        self.page_progress += 1;
                    }
                }
            }
            Step::Fatal(msg) => {
                error!("Row {} failed fatally: {}", row, msg);
                self.state = ScanState::Failed(msg);
            }
        }
    }

    /// Progress bookkeeping once the page has no rows left.
    fn finish_page(&mut self) {
        self.prev_pages_max = self.prev_pages_max.max(self.page_max);

        if self.page_progress == 0 {
            self.zero_progress_streak += 1;
            info!(
                "Page {} brought no new rows ({} in a row)",
                self.page, self.zero_progress_streak
            );
        } else {
            self.zero_progress_streak = 0;
        }

        if self.zero_progress_streak >= self.config.zero_progress_pages.max(1) {
            info!("End of list reached");
            self.state = ScanState::Done;
        } else if self.scrolls >= self.config.max_scrolls {
            info!("Reached the limit of {} scrolls", self.config.max_scrolls);
            self.state = ScanState::Done;
        } else {
            self.state = ScanState::Scrolling;
        }
    }

    fn scroll(&mut self) -> Result<()> {
        let nav = &self.config.navigation;
        self.device
            .scroll(nav.scroll_from, nav.scroll_to, Duration::from_millis(nav.scroll_duration_ms))
            .context("Scroll failed")?;
        settle(nav.scroll_settle_ms);
        self.scrolls += 1;
        self.page += 1;

        match self.capture(FailureReason::PageCaptureFailed) {
            Step::Ok(frame) => {
                if let Some(previous) = self.frame.clone() {
                    self.measure_drift(&previous.image, &frame.image);
                }
                self.frame = Some(Arc::new(frame));
                self.state = ScanState::ScanningPage;
            }
            Step::Skip(reason) => {
                warn!("Page {} could not be captured, moving on", self.page);
                self.record(None, AttemptOutcome::Failed, Some(reason), None, AttemptPosition::new(None, self.page, 0));
                self.frame = None;
                self.page_max = 0;
                self.page_progress = 0;
                self.page_fallback = false;
                self.finish_page();
            }
            Step::Fatal(msg) => self.state = ScanState::Failed(msg),
        }
        Ok(())
    }

    fn measure_drift(&mut self, before: &image::RgbaImage, after: &image::RgbaImage) {
        let expected = self.shift.config().expected_offset;
        match self.shift.estimate_default(before, after) {
            Some(measured) => {
                let drift = measured.offset_px - expected;
                self.drift.push(drift);
                info!(
                    "[DRIFT] scrolled {}px (expected {}), drift {:+}px, residual {:.1}",
                    measured.offset_px, expected, drift, measured.residual
                );
            }
            None => debug!("Scroll distance could not be measured"),
        }
    }

    /// Captures with the configured retry policy. Misses become `Skip(reason)`.
    fn capture(&mut self, reason: FailureReason) -> Step<Frame> {
        let policy = self.config.capture_retry.clone();
        let device = &mut self.device;
        attempt_with_retry(&policy, reason.as_str(), |attempt| match device.capture() {
            Ok(Some(frame)) => Step::Ok(frame),
            Ok(None) => {
                debug!("Capture {} returned no frame", attempt);
                Step::Skip(reason)
            }
            Err(e) => Step::Fatal(format!("device lost: {:#}", e)),
        })
    }

    fn go_back(&mut self) -> Result<()> {
        let nav = &self.config.navigation;
        self.device.tap(nav.back_button).context("Back tap failed")?;
        settle(nav.back_settle_ms);
        Ok(())
    }

    /// Ledger failures are logged; they never stop the scan.
    fn record(
        &self,
        identifier: Option<&str>,
        outcome: AttemptOutcome,
        reason: Option<FailureReason>,
        value: Option<u64>,
        position: AttemptPosition,
    ) {
        let Some(session_id) = &self.session_id else {
            return;
        };
        if let Err(e) = self
            .ledger
            .record_attempt(session_id, identifier, outcome, reason, value, position)
        {
            error!("Failed to record {} attempt: {:#}", outcome, e);
        }
    }

    fn process_row(&mut self, row: &RowPosition) -> Step<RowOutcome> {
        let Some(frame) = self.frame.clone() else {
            return Step::Skip(FailureReason::PageCaptureFailed);
        };
        let position = AttemptPosition::new(Some(row.index), self.page, self.row_slot);
        info!("{} Row {}", self.progress_string(), row);

        let reading = self.decoder.decode(&frame, row.y);
        let value = match reading.value() {
            Some(v) if v >= self.config.min_value => v,
            _ => {
                warn!(
                    "Row #{}: no usable value (chosen {:?}, {} candidates), skipping",
                    row.index,
                    reading.chosen,
                    reading.raw_candidates.len()
                );
                self.record(None, AttemptOutcome::Failed, Some(FailureReason::InvalidValue), None, position);
                return Step::Skip(FailureReason::InvalidValue);
            }
        };
        debug!("Row #{}: value {} ({} votes)", row.index, value, reading.votes);

        let nav = self.config.navigation.clone();
        let tap_y = (row.y + self.config.geometry.row_height / 2.0).round() as i32;
        if let Err(e) = self.device.tap(Point::new(nav.row_tap_x, tap_y)) {
            return Step::Fatal(format!("tap failed: {:#}", e));
        }
        settle(nav.detail_settle_ms);

        let detail_frame = match self.capture(FailureReason::ProfileCaptureFailed) {
            Step::Ok(frame) => frame,
            Step::Skip(reason) => {
                warn!("Row #{}: detail view could not be captured", row.index);
                self.record(None, AttemptOutcome::Failed, Some(reason), Some(value), position);
                if let Err(e) = self.go_back() {
                    return Step::Fatal(format!("{:#}", e));
                }
                return Step::Skip(reason);
            }
            Step::Fatal(msg) => return Step::Fatal(msg),
        };

        let detail = self.detail.read(&detail_frame);
        let Some(identifier) = detail.identifier else {
            if self.detail.is_list_visible(&detail_frame) {
                warn!("Row #{}: detail view did not open, staying on the list", row.index);
            } else {
                warn!("Row #{}: identifier unreadable", row.index);
                if let Err(e) = self.go_back() {
                    return Step::Fatal(format!("{:#}", e));
                }
            }
            self.record(None, AttemptOutcome::Failed, Some(FailureReason::ProfileOcrFailed), Some(value), position);
            return Step::Skip(FailureReason::ProfileOcrFailed);
        };

        if let Err(e) = self.go_back() {
            return Step::Fatal(format!("{:#}", e));
        }

        if self.seen.contains(&identifier) {
            info!("Row #{}: {} already seen this session", row.index, identifier);
            self.record(
                Some(&identifier),
                AttemptOutcome::Duplicate,
                Some(FailureReason::DuplicateInSession),
                Some(value),
                position,
            );
            return Step::Ok(RowOutcome::Duplicate);
        }

        self.record(Some(&identifier), AttemptOutcome::Success, None, Some(value), position);
        self.seen.insert(identifier.clone());
        self.committed += 1;
        self.last_processed = self.last_processed.max(row.index);
        self.locator.commit(&frame, row);
        info!("Row #{}: {} = {}", row.index, identifier, value);

        if let Some(log) = &self.entry_log {
            let entry = EntryRow {
                rank: row.index,
                identifier: &identifier,
                value,
                group_name: detail.group_name.as_deref(),
                observed_at: frame.captured_at,
            };
            if let Err(e) = log.append(&entry) {
                warn!("Failed to append {} to the entries CSV: {:#}", identifier, e);
            }
        }

        let session_id = self.session_id.clone().unwrap_or_default();
        let mut task = EnrichmentTask::new(&session_id, &identifier, value, position);
        task.group_name = detail.group_name;
        task.observed_at = frame.captured_at;
        if let Err(e) = self.enrichment.dispatch(task) {
            error!("Could not queue {} for enrichment: {:#}", identifier, e);
        }

        Step::Ok(RowOutcome::Committed)
    }

    /// Runs the loop to a terminal state and finalizes the session.
    ///
    /// Errors and panics inside the loop end the session as failed.
    pub fn run(&mut self) -> ScanSummary {
        self.started_at = Local::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<()> {
            while self.step()? {}
            Ok(())
        }));

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Scan error: {:#}", e);
                self.state = ScanState::Failed(format!("{:#}", e));
            }
            Err(_) => {
                error!("Scan loop panicked");
                self.state = ScanState::Failed("scan loop panicked".to_string());
            }
        }
        info!("Scan stopped: {}", self.state);

        self.finish()
    }

    fn finalize(&mut self, status: SessionStatus) {
        if self.finalized {
            return;
        }
        let Some(session_id) = &self.session_id else {
            return;
        };
        self.finalized = true;
        if let Err(e) = self.ledger.finalize(session_id, status) {
            error!("Failed to finalize session {}: {:#}", session_id, e);
        }
    }

    fn finish(&mut self) -> ScanSummary {
        let status = self.state.session_status();
        let mode = if status == SessionStatus::Interrupted {
            CloseMode::Abandon
        } else {
            CloseMode::Drain
        };
        let enrichment = self.enrichment.close(mode);
        self.finalize(status);

        let session_id = self.session_id.clone().unwrap_or_default();
        let counts = match self.ledger.session(&session_id) {
            Ok(Some(session)) => session.counts,
            Ok(None) => Default::default(),
            Err(e) => {
                warn!("Could not read session counts: {:#}", e);
                Default::default()
            }
        };
        let retryable = self.ledger.list_failed(&session_id).unwrap_or_else(|e| {
            warn!("Could not list failed identifiers: {:#}", e);
            Vec::new()
        });

        let summary = ScanSummary {
            session_id,
            status,
            started_at: self.started_at,
            finished_at: Local::now(),
            counts,
            pages: self.page,
            scrolls: self.scrolls,
            drift: DriftStats::from_samples(&self.drift),
            enrichment,
            retryable,
        };

        for line in render_report(&summary).lines() {
            info!("{}", line);
        }
        if let Some(dir) = &self.reports_dir {
            match write_report(dir, &summary) {
                Ok(path) => info!("Report saved to {}", path.display()),
                Err(e) => warn!("Failed to save report: {:#}", e),
            }
        }
        summary
    }
}

impl Drop for ScanOrchestrator {
    fn drop(&mut self) {
        if self.session_id.is_some() && !self.finalized {
            warn!("Scan dropped before finishing, marking session failed");
            self.enrichment.close(CloseMode::Abandon);
            self.finalize(SessionStatus::Failed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::device::{FrameSource, InputInjector};
    use crate::enrich::store::{EntityRecord, EntityStore, EntityUpdate};
    use crate::enrich::{EnrichmentConfig, EnrichmentContext, EnrichmentPool};
    use crate::ocr::consensus::FieldReading;
    use crate::ocr::detail::DetailReading;
    use crate::ocr::engine::{OcrWord, PageMode, TextRecognizer};
    use crate::retry::RetryPolicy;
    use crate::scan::config::LocatorStrategy;
    use crate::vision::anchor::{TemplateRowLocator, VisualAnchorMatcher};
    use crate::vision::{ListGeometry, RowGridReconstructor};
    use image::{GrayImage, RgbaImage};
    use std::sync::atomic::AtomicU64;
    use std::sync::Mutex;

    #[derive(Clone, Copy)]
    struct Entry {
        index: u32,
        identifier: &'static str,
        value: u64,
    }

    fn entry(index: u32, identifier: &'static str) -> Entry {
        Entry {
            index,
            identifier,
            value: 10_000_000 - index as u64 * 1000,
        }
    }

    #[derive(Clone, Copy)]
    enum Failure {
        Error,
        Panic,
    }

    /// A scripted list: `pages[n]` is what page n+1 shows, top to bottom.
    struct World {
        pages: Vec<Vec<Entry>>,
        page: usize,
        detail: Option<&'static str>,
        geometry: ListGeometry,
        back: Point,
        captures: usize,
        fail_capture: Option<(usize, Failure)>,
        abort_on_scroll: Option<Arc<AtomicBool>>,
        /// Page (0-based) whose index markers cannot be read
        blind_markers: Option<usize>,
    }

    impl World {
        fn current(&self) -> Vec<(f32, Entry)> {
            self.pages
                .get(self.page)
                .map(|entries| {
                    entries
                        .iter()
                        .enumerate()
                        .map(|(slot, e)| (self.geometry.first_row_y + self.geometry.row_height * slot as f32, *e))
                        .collect()
                })
                .unwrap_or_default()
        }
    }

    type Shared = Arc<Mutex<World>>;

    struct FakeDevice(Shared);

    impl FrameSource for FakeDevice {
        fn capture(&mut self) -> Result<Option<Frame>> {
            let failure = {
                let mut world = self.0.lock().unwrap();
                world.captures += 1;
                match world.fail_capture {
                    Some((n, failure)) if n == world.captures => Some(failure),
                    _ => None,
                }
            };
            match failure {
                Some(Failure::Error) => Err(anyhow::anyhow!("device offline")),
                Some(Failure::Panic) => panic!("capture exploded"),
                None => Ok(Some(Frame::new(RgbaImage::new(1080, 2400)))),
            }
        }
    }

    impl InputInjector for FakeDevice {
        fn tap(&mut self, at: Point) -> Result<()> {
            let mut world = self.0.lock().unwrap();
            if at == world.back {
                world.detail = None;
                return Ok(());
            }
            if world.detail.is_some() {
                return Ok(());
            }
            let height = world.geometry.row_height;
            let hit = world
                .current()
                .into_iter()
                .find(|(y, _)| (at.y as f32) >= *y && (at.y as f32) < y + height);
            if let Some((_, e)) = hit {
                world.detail = Some(e.identifier);
            }
            Ok(())
        }

        fn scroll(&mut self, _from: Point, _to: Point, _duration: Duration) -> Result<()> {
            let mut world = self.0.lock().unwrap();
            world.page += 1;
            if let Some(flag) = &world.abort_on_scroll {
                flag.store(true, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    /// Reports the current page's index markers; the first row is the most confident.
    struct FakeMarkers(Shared);

    impl TextRecognizer for FakeMarkers {
        fn recognize(&self, _: &GrayImage, _: Option<&str>, _: PageMode) -> String {
            String::new()
        }

        fn recognize_words(&self, _: &GrayImage, _: Option<&str>, _: PageMode) -> Vec<OcrWord> {
            let world = self.0.lock().unwrap();
            if world.blind_markers == Some(world.page) {
                return Vec::new();
            }
            world
                .current()
                .into_iter()
                .enumerate()
                .map(|(slot, (y, e))| OcrWord {
                    text: e.index.to_string(),
                    confidence: if slot == 0 { 90.0 } else { 80.0 },
                    left: 20,
                    top: (y + 35.0).floor() as u32,
                    width: 40,
                    height: 40,
                })
                .collect()
        }
    }

    struct FakeDecoder(Shared);

    impl FieldDecoder for FakeDecoder {
        fn decode(&self, _frame: &Frame, row_y: f32) -> FieldReading {
            let world = self.0.lock().unwrap();
            let candidates = world
                .current()
                .into_iter()
                .filter(|(y, _)| (y - row_y).abs() < 1.0)
                .map(|(_, e)| e.value.to_string())
                .collect();
            FieldReading::from_candidates(candidates, 2)
        }
    }

    struct FakeDetail(Shared);

    impl DetailReader for FakeDetail {
        fn read(&self, _frame: &Frame) -> DetailReading {
            let world = self.0.lock().unwrap();
            DetailReading {
                identifier: world.detail.map(str::to_string),
                group_name: world.detail.map(|_| "[ABC] Wolves".to_string()),
            }
        }

        fn is_list_visible(&self, _frame: &Frame) -> bool {
            self.0.lock().unwrap().detail.is_none()
        }
    }

    struct CountingStore {
        db: Database,
        upserts: AtomicU64,
        /// Every write fails while set
        broken: AtomicBool,
    }

    impl EntityStore for CountingStore {
        fn find_entity(&self, identifier: &str) -> Result<Option<EntityRecord>> {
            self.db.find_entity(identifier)
        }

        fn upsert_entity(&self, update: &EntityUpdate, seen_at: DateTime<Local>) -> Result<()> {
            self.upserts.fetch_add(1, Ordering::SeqCst);
            if self.broken.load(Ordering::SeqCst) {
                return Err(anyhow::anyhow!("database is locked"));
            }
            self.db.upsert_entity(update, seen_at)
        }

        fn insert_history_point(&self, identifier: &str, value: u64, rank: Option<u32>, observed_at: DateTime<Local>) -> Result<bool> {
            self.db.insert_history_point(identifier, value, rank, observed_at)
        }
    }

    struct Harness {
        world: Shared,
        ledger: ScanProgressLedger,
        store: Arc<CountingStore>,
        abort: Arc<AtomicBool>,
        config: ScanConfig,
    }

    impl Harness {
        fn new(pages: Vec<Vec<Entry>>) -> Self {
            let mut config = ScanConfig::default();
            config.navigation.scroll_duration_ms = 0;
            config.navigation.scroll_settle_ms = 0;
            config.navigation.detail_settle_ms = 0;
            config.navigation.back_settle_ms = 0;
            config.markers.scale = 1;
            config.shift.strip_x2 = config.shift.strip_x1 + 16;
            config.capture_retry = RetryPolicy::new(2, 0, 1.0);
            config.max_scrolls = 10;

            let world = Arc::new(Mutex::new(World {
                pages,
                page: 0,
                detail: None,
                geometry: config.geometry,
                back: config.navigation.back_button,
                captures: 0,
                fail_capture: None,
                abort_on_scroll: None,
                blind_markers: None,
            }));
            let db = Database::open_in_memory().unwrap();
            Self {
                world,
                ledger: ScanProgressLedger::new(db.clone()),
                store: Arc::new(CountingStore {
                    db,
                    upserts: AtomicU64::new(0),
                    broken: AtomicBool::new(false),
                }),
                abort: Arc::new(AtomicBool::new(false)),
                config,
            }
        }

        fn orchestrator(&self) -> ScanOrchestrator {
            let locator: Box<dyn RowLocator> = match self.config.strategy {
                LocatorStrategy::Markers => Box::new(RowGridReconstructor::new(
                    Arc::new(FakeMarkers(self.world.clone())),
                    self.config.markers,
                    self.config.geometry,
                )),
                LocatorStrategy::Template => Box::new(TemplateRowLocator::new(
                    VisualAnchorMatcher::new(self.config.anchor),
                    self.config.geometry,
                )),
            };
            let ctx = EnrichmentContext {
                store: self.store.clone(),
                lookup: None,
                retry: RetryPolicy::once(),
                use_lookup: false,
            };
            let enrichment = EnrichmentPool::start(
                &EnrichmentConfig {
                    workers: 1,
                    queue_capacity: 4,
                },
                ctx,
                self.ledger.clone(),
            );
            let parts = ScanParts {
                device: Box::new(FakeDevice(self.world.clone())),
                locator,
                decoder: Box::new(FakeDecoder(self.world.clone())),
                detail: Box::new(FakeDetail(self.world.clone())),
                enrichment: Box::new(enrichment),
                ledger: self.ledger.clone(),
            };
            let options = SessionOptions {
                strategy: self.config.strategy.as_str().to_string(),
                use_lookup: false,
                notes: None,
            };
            ScanOrchestrator::new(parts, self.config.clone(), options, self.abort.clone())
        }

        fn outcomes(&self, session_id: &str, outcome: AttemptOutcome) -> Vec<String> {
            self.ledger
                .attempts(session_id)
                .unwrap()
                .into_iter()
                .filter(|a| a.outcome == outcome)
                .map(|a| a.identifier)
                .collect()
        }
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_scan_walks_pages_until_list_ends() {
        let harness = Harness::new(vec![
            vec![entry(1, "100000001"), entry(2, "100000002"), entry(3, "100000003")],
            vec![entry(4, "100000004"), entry(5, "100000005"), entry(6, "100000006")],
        ]);
        let mut scan = harness.orchestrator();
        let summary = scan.run();

        assert_eq!(summary.status, SessionStatus::Completed);
        assert_eq!(scan.state, ScanState::Done);
        assert_eq!(
            harness.outcomes(&summary.session_id, AttemptOutcome::Success),
            ids(&["100000001", "100000002", "100000003", "100000004", "100000005", "100000006"])
        );
        assert_eq!(summary.counts.succeeded, 6);
        // Two empty pages after the last entry end the scan.
        assert_eq!(summary.scrolls, 3);
        assert_eq!(summary.enrichment.dispatched, 6);
        assert_eq!(summary.enrichment.created, 6);
        assert_eq!(harness.store.upserts.load(Ordering::SeqCst), 6);

        let session = harness.ledger.session(&summary.session_id).unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.finished_at.is_some());
        let entity = harness.store.db.find_entity("100000004").unwrap().unwrap();
        assert_eq!(entity.latest_rank, Some(4));
        assert_eq!(entity.group_name.as_deref(), Some("[ABC] Wolves"));
    }

    #[test]
    fn test_unreadable_markers_use_default_grid_mid_scan() {
        let harness = Harness::new(vec![
            vec![entry(1, "100000001"), entry(2, "100000002"), entry(3, "100000003")],
            vec![entry(4, "100000004"), entry(5, "100000005"), entry(6, "100000006")],
            vec![entry(7, "100000007"), entry(8, "100000008"), entry(9, "100000009")],
        ]);
        harness.world.lock().unwrap().blind_markers = Some(1);
        let mut scan = harness.orchestrator();
        let summary = scan.run();

        assert_eq!(summary.status, SessionStatus::Completed);
        assert_eq!(
            harness.outcomes(&summary.session_id, AttemptOutcome::Success),
            ids(&[
                "100000001", "100000002", "100000003", "100000004", "100000005", "100000006",
                "100000007", "100000008", "100000009",
            ])
        );
        assert_eq!(summary.counts.succeeded, 9);
        // Two empty pages after the last entry still end the scan.
        assert_eq!(summary.scrolls, 4);
    }

    #[test]
    fn test_duplicate_identifier_committed_once() {
        let harness = Harness::new(vec![vec![entry(1, "111111111"), entry(2, "111111111")]]);
        let mut scan = harness.orchestrator();
        let summary = scan.run();

        assert_eq!(summary.status, SessionStatus::Completed);
        assert_eq!(harness.outcomes(&summary.session_id, AttemptOutcome::Success), ids(&["111111111"]));
        assert_eq!(harness.outcomes(&summary.session_id, AttemptOutcome::Duplicate), ids(&["111111111"]));
        assert_eq!(harness.store.upserts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_store_failure_leaves_counts_alone() {
        let harness = Harness::new(vec![vec![entry(1, "100000001"), entry(2, "100000002")]]);
        harness.store.broken.store(true, Ordering::SeqCst);
        let mut scan = harness.orchestrator();
        let summary = scan.run();

        assert_eq!(summary.status, SessionStatus::Completed);
        assert_eq!(summary.enrichment.store_failed, 2);
        assert_eq!(summary.counts.succeeded, 2);
        // Only rows the scan loop itself failed count as failures.
        let loop_failures = harness.outcomes(&summary.session_id, AttemptOutcome::Failed);
        assert!(!loop_failures.iter().any(|id| id.starts_with("1000000")));
        assert_eq!(summary.counts.failed, loop_failures.len() as u64);
        assert_eq!(summary.counts.attempted, summary.counts.succeeded + summary.counts.failed);

        assert_eq!(
            harness.outcomes(&summary.session_id, AttemptOutcome::EnrichmentFailed),
            ids(&["100000001", "100000002"])
        );
        let retryable: Vec<_> = summary.retryable.iter().map(|f| f.identifier.as_str()).collect();
        assert_eq!(retryable, vec!["100000001", "100000002"]);
        assert!(summary
            .retryable
            .iter()
            .all(|f| f.failure_reason() == Some(FailureReason::StoreFailed)));
    }

    #[test]
    fn test_target_count_stops_scan() {
        let mut harness = Harness::new(vec![vec![entry(1, "100000001"), entry(2, "100000002"), entry(3, "100000003")]]);
        harness.config.target_count = 2;
        let mut scan = harness.orchestrator();
        let summary = scan.run();

        assert_eq!(summary.status, SessionStatus::Completed);
        assert_eq!(summary.counts.succeeded, 2);
        assert_eq!(summary.scrolls, 0);
    }

    #[test]
    fn test_device_error_fails_session() {
        let harness = Harness::new(vec![vec![entry(1, "100000001")]]);
        // Capture 1 is the first page, capture 2 the first detail view.
        harness.world.lock().unwrap().fail_capture = Some((2, Failure::Error));
        let mut scan = harness.orchestrator();
        let summary = scan.run();

        assert_eq!(summary.status, SessionStatus::Failed);
        assert!(matches!(scan.state, ScanState::Failed(ref msg) if msg.contains("device offline")));
        let session = harness.ledger.session(&summary.session_id).unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert!(session.finished_at.is_some());
    }

    #[test]
    fn test_panic_in_loop_fails_session() {
        let harness = Harness::new(vec![vec![entry(1, "100000001")]]);
        harness.world.lock().unwrap().fail_capture = Some((2, Failure::Panic));
        let mut scan = harness.orchestrator();
        let summary = scan.run();

        assert_eq!(summary.status, SessionStatus::Failed);
        let session = harness.ledger.session(&summary.session_id).unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
    }

    #[test]
    fn test_abort_interrupts_session() {
        let harness = Harness::new(vec![
            vec![entry(1, "100000001")],
            vec![entry(2, "100000002")],
        ]);
        harness.world.lock().unwrap().abort_on_scroll = Some(harness.abort.clone());
        let mut scan = harness.orchestrator();
        let summary = scan.run();

        assert_eq!(summary.status, SessionStatus::Interrupted);
        assert_eq!(scan.state, ScanState::Aborted);
        assert_eq!(harness.outcomes(&summary.session_id, AttemptOutcome::Success), ids(&["100000001"]));
        let session = harness.ledger.session(&summary.session_id).unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Interrupted);
    }

    #[test]
    fn test_dropped_scan_is_finalized_as_failed() {
        let harness = Harness::new(vec![vec![entry(1, "100000001")]]);
        let session_id = {
            let mut scan = harness.orchestrator();
            assert!(scan.step().unwrap());
            assert_eq!(scan.state, ScanState::ScanningPage);
            scan.session_id().unwrap().to_string()
        };
        let session = harness.ledger.session(&session_id).unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
    }

    #[test]
    fn test_template_strategy_follows_committed_rows() {
        let mut harness = Harness::new(vec![
            vec![entry(1, "100000001"), entry(2, "100000002"), entry(3, "100000003")],
            vec![entry(4, "100000004"), entry(5, "100000005"), entry(6, "100000006")],
        ]);
        harness.config.strategy = LocatorStrategy::Template;
        let mut scan = harness.orchestrator();
        let summary = scan.run();

        assert_eq!(summary.status, SessionStatus::Completed);
        assert_eq!(summary.counts.succeeded, 6);
    }

    #[test]
    fn test_entries_csv_and_report_written() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Harness::new(vec![vec![entry(1, "100000001"), entry(2, "100000002")]]);
        let mut scan = harness.orchestrator().with_output_dir(dir.path().to_path_buf());
        let summary = scan.run();

        let csv = std::fs::read_to_string(dir.path().join(format!("{}_entries.csv", summary.session_id))).unwrap();
        assert_eq!(csv.lines().count(), 3);
        assert!(csv.lines().nth(1).unwrap().starts_with("1,100000001,9999000,[ABC] Wolves,"));

        let reports = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("scan_report_"))
            .count();
        assert_eq!(reports, 1);
    }
}
