//! The scan session: configuration, state machine, wiring and reporting.

pub mod config;
pub mod orchestrator;
pub mod report;
pub mod runner;
pub mod state;
