//! Shared retry primitive and tagged step outcomes.
//!
//! Page capture, detail-view capture and identity lookup all retry through
//! `attempt_with_retry`, so each call site only declares its `RetryPolicy`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::ledger::FailureReason;

/// Result of one unit of scan work.
#[derive(Debug, Clone, PartialEq)]
pub enum Step<T> {
    /// The operation produced a value.
    Ok(T),
    /// Recoverable miss; the caller records the reason and moves on.
    Skip(FailureReason),
    /// Unrecoverable; the scan must stop.
    Fatal(String),
}

impl<T> fmt::Display for Step<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Ok(_) => write!(f, "ok"),
            Step::Skip(reason) => write!(f, "skip ({})", reason),
            Step::Fatal(msg) => write!(f, "fatal: {}", msg),
        }
    }
}

/// Declarative retry policy: how many tries and how long to wait between them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of tries, including the first one. Zero behaves like one.
    pub max_attempts: u32,
    /// Delay before the second try (milliseconds)
    pub backoff_ms: u64,
    /// Factor applied to the delay after every failed try
    #[serde(default = "default_multiplier")]
    pub multiplier: f32,
}

fn default_multiplier() -> f32 {
    1.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff_ms: 500,
            multiplier: 1.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[cfg(test)]
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 0,
            multiplier: 1.0,
        }
    }

    pub fn new(max_attempts: u32, backoff_ms: u64, multiplier: f32) -> Self {
        Self {
            max_attempts,
            backoff_ms,
            multiplier,
        }
    }

    /// Delay to wait after the given failed try (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(0.0).powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis((self.backoff_ms as f64 * factor as f64) as u64)
    }
}

/// Runs `op` until it returns `Ok` or `Fatal`, or the policy runs out of tries.
///
/// `op` receives the 1-based try number. Only `Skip` outcomes are retried; the
/// last `Skip` is returned when every try missed.
pub fn attempt_with_retry<T>(
    policy: &RetryPolicy,
    label: &str,
    mut op: impl FnMut(u32) -> Step<T>,
) -> Step<T> {
    attempt_with_retry_and_sleep(policy, label, &mut op, std::thread::sleep)
}

fn attempt_with_retry_and_sleep<T>(
    policy: &RetryPolicy,
    label: &str,
    op: &mut impl FnMut(u32) -> Step<T>,
    mut sleep: impl FnMut(Duration),
) -> Step<T> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt) {
            Step::Skip(reason) if attempt < max_attempts => {
                let delay = policy.delay_after(attempt);
                log::warn!(
                    "{}: attempt {}/{} missed ({}), retrying in {}ms",
                    label,
                    attempt,
                    max_attempts,
                    reason,
                    delay.as_millis()
                );
                sleep(delay);
                attempt += 1;
            }
            other => return other,
        }
    }
}
