//! Reconnect backoff with exponential growth, a cap and jitter.
//!
//! `delay(n) = clamp(base * 2^n, base, max)`, then +/-10% uniform jitter,
//! then floored at `base`. Each call to [`Backoff::next_delay`] advances the
//! attempt counter; [`Backoff::reset`] is called once per established
//! connection.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Fraction of the nominal delay used as the jitter half-width.
pub const JITTER_FRACTION: f64 = 0.1;

/// Backoff bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Smallest delay and the delay of the first retry (default: 1 second).
    pub base_ms: u64,
    /// Largest nominal delay (default: 30 seconds).
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 30_000,
        }
    }
}

/// Per-endpoint backoff state.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    /// Creates a backoff with attempt count zero.
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_ms),
            max: Duration::from_millis(config.max_ms.max(config.base_ms)),
            attempt: 0,
        }
    }

    /// Current attempt count.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Jitter-free delay for `attempt`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as f64;
        let max_ms = self.max.as_millis() as f64;
        let exp = 2f64.powi(attempt.min(63) as i32);
        let ms = (base_ms * exp).clamp(base_ms, max_ms);
        Duration::from_millis(ms as u64)
    }

    /// Returns the delay before the next attempt and advances the counter.
    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.nominal_delay(self.attempt).as_millis() as f64;
        let jitter = if nominal > 0.0 {
            let span = nominal * JITTER_FRACTION;
            rand::thread_rng().gen_range(-span..=span)
        } else {
            0.0
        };
        let base_ms = self.base.as_millis() as f64;
        let ms = (nominal + jitter).max(base_ms);
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(ms.round() as u64)
    }

    /// Zeroes the attempt counter.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
