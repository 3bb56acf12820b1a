//! Exponential-backoff reconnection schedule (§4.4 Reconnection Supervisor).

use std::time::Duration;
use tracing::debug;

/// Base delay before the first retry.
pub const BASE_DELAY: Duration = Duration::from_secs(5);
/// Delay ceiling; the schedule never waits longer than this.
pub const MAX_DELAY: Duration = Duration::from_secs(60);
/// Maximum retry attempts per disconnect episode (§4.4).
pub const MAX_ATTEMPTS: u32 = 10;

/// Tracks the retry counter and computes the next backoff delay for a
/// single disconnect episode. The counter resets to 0 on successful
/// reconnect (`reset`), matching the invariant in §3.
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self { attempt: 0 }
    }

    /// Reset after a successful reconnect.
    pub fn reset(&mut self) {
        debug!("resetting reconnection backoff");
        self.attempt = 0;
    }

    /// Current attempt count within this episode.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record a failed attempt and return the delay to wait before the
    /// next one, or `None` once the retry ceiling is reached.
    ///
    /// Delay schedule: `min(5 * 2^i, 60)` seconds for attempt `i` (0-indexed).
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= MAX_ATTEMPTS {
            return None;
        }

        let exponent = self.attempt;
        self.attempt += 1;

        let scaled = BASE_DELAY.as_secs_f64() * 2f64.powi(exponent as i32);
        let delay = Duration::from_secs_f64(scaled).min(MAX_DELAY);

        debug!(attempt = self.attempt, delay_secs = delay.as_secs(), "scheduling reconnect");
        Some(delay)
    }

    /// Whether the retry ceiling has been reached.
    pub fn exhausted(&self) -> bool {
        self.attempt >= MAX_ATTEMPTS
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
