//! Retry policy for connection failures and coordination timeouts.
//!
//! The default policy is [`RetryPolicy::fatal`]: every failure aborts,
//! which is how the uploader has always behaved. [`RetryPolicy::hardened`]
//! retries a silent device with exponential backoff and tolerates a few
//! consecutive lock or transfer timeouts before giving up.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConnectFailure, StillsError};

// ── Backoff ──────────────────────────────────────────────────────

/// Exponential backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    /// Delay before the first retry, in milliseconds.
    pub initial_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    pub max_ms: u64,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Retries allowed before giving up (0 = never retry).
    pub max_retries: u32,
}

impl Backoff {
    /// A schedule that never retries.
    pub const fn none() -> Self {
        Self {
            initial_ms: 0,
            max_ms: 0,
            multiplier: 1.0,
            max_retries: 0,
        }
    }

    /// Delay before retry number `retry` (1-based), or `None` once the
    /// retry budget is spent.
    pub fn delay(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || retry > self.max_retries {
            return None;
        }
        let factor = self.multiplier.max(1.0).powi(retry as i32 - 1);
        let ms = (self.initial_ms as f64 * factor).min(self.max_ms as f64);
        Some(Duration::from_millis(ms as u64))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::none()
    }
}

// ── Decision ─────────────────────────────────────────────────────

/// What to do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Try again after the given pause.
    Retry(Duration),
    /// Give up; the error is fatal.
    Abort,
}

// ── RetryPolicy ──────────────────────────────────────────────────

/// Per-failure-class retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Consecutive lock timeouts tolerated.
    pub lock_timeout_retries: u32,
    /// Consecutive transfer timeouts tolerated.
    pub transfer_timeout_retries: u32,
    /// Pause before the attempt that follows a tolerated timeout.
    pub timeout_retry_delay_ms: u64,
    /// Backoff for `NoResponse` connect failures.
    pub connect: Backoff,
}

impl RetryPolicy {
    /// Abort on the first failure of any kind.
    pub fn fatal() -> Self {
        Self {
            connect: Backoff::none(),
            lock_timeout_retries: 0,
            transfer_timeout_retries: 0,
            timeout_retry_delay_ms: 0,
        }
    }

    /// Backoff on silent devices, bounded retries on timeouts.
    pub fn hardened() -> Self {
        Self {
            connect: Backoff {
                initial_ms: 250,
                max_ms: 8_000,
                multiplier: 2.0,
                max_retries: 6,
            },
            lock_timeout_retries: 3,
            transfer_timeout_retries: 2,
            timeout_retry_delay_ms: 500,
        }
    }

    /// Decide how to react to `error`, which is the `consecutive`-th
    /// failure of its kind in a row (1-based).
    pub fn decide(&self, error: &StillsError, consecutive: u32) -> Decision {
        let timeout_delay = Duration::from_millis(self.timeout_retry_delay_ms);
        match error {
            StillsError::Connect(ConnectFailure::NoResponse) => self
                .connect
                .delay(consecutive)
                .map_or(Decision::Abort, Decision::Retry),
            StillsError::LockTimeout(_) if consecutive <= self.lock_timeout_retries => {
                Decision::Retry(timeout_delay)
            }
            StillsError::TransferTimeout { .. }
                if consecutive <= self.transfer_timeout_retries =>
            {
                Decision::Retry(timeout_delay)
            }
            _ => Decision::Abort,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fatal()
    }
}
