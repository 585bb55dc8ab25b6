//! Scan state machine states.
//!
//! Init → ScanningPage → ProcessingRow → Scrolling → ScanningPage … → Done.
//! Every step first checks the abort flag.

use std::fmt;

use crate::ledger::SessionStatus;

#[derive(Debug, Clone, PartialEq)]
pub enum ScanState {
    /// Open the session and capture the first frame
    Init,
    /// Place the rows on the current frame
    ScanningPage,
    /// Work through the placed rows one at a time
    ProcessingRow,
    /// Move to the next page and capture it
    Scrolling,
    /// Target reached, scroll limit reached, or end of list
    Done,
    /// Stopped by an external interrupt
    Aborted,
    /// Device lost or another unrecoverable error
    Failed(String),
}

impl ScanState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanState::Done | ScanState::Aborted | ScanState::Failed(_))
    }

    /// Session status to finalize with once the loop has stopped in this state.
    pub fn session_status(&self) -> SessionStatus {
        match self {
            ScanState::Done => SessionStatus::Completed,
            ScanState::Aborted => SessionStatus::Interrupted,
            _ => SessionStatus::Failed,
        }
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanState::Init => write!(f, "Init"),
            ScanState::ScanningPage => write!(f, "Scanning page"),
            ScanState::ProcessingRow => write!(f, "Processing row"),
            ScanState::Scrolling => write!(f, "Scrolling"),
            ScanState::Done => write!(f, "Done"),
            ScanState::Aborted => write!(f, "Aborted"),
            ScanState::Failed(msg) => write!(f, "Failed: {}", msg),
        }
    }
}
