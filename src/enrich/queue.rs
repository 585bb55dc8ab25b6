//! Work items passed from the scan loop to the enrichment workers.
//!
//! The channel is bounded: once `capacity` tasks are waiting, `dispatch` blocks
//! the scan loop until a worker catches up.

use chrono::{DateTime, Local};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};

use crate::ledger::AttemptPosition;

/// One committed entry waiting for lookup and persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichmentTask {
    pub session_id: String,
    pub identifier: String,
    pub value: u64,
    pub group_name: Option<String>,
    pub position: AttemptPosition,
    /// Capture time of the frame the value was read from
    pub observed_at: DateTime<Local>,
}

impl EnrichmentTask {
    pub fn new(session_id: &str, identifier: &str, value: u64, position: AttemptPosition) -> Self {
        Self {
            session_id: session_id.to_string(),
            identifier: identifier.to_string(),
            value,
            group_name: None,
            position,
            observed_at: Local::now(),
        }
    }

    pub fn rank(&self) -> Option<u32> {
        self.position.rank
    }
}

pub fn create_task_queue(capacity: usize) -> (SyncSender<EnrichmentTask>, Receiver<EnrichmentTask>) {
    sync_channel(capacity.max(1))
}
