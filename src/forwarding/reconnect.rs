//! Reconnect backoff curve for forwarding-backend stripes.
//!
//! spec.md §9 leaves the exact curve an open question and asks for "a
//! reasonable default": 100 ms base, doubling to a 5 s cap, +/-25% jitter.
//! Grounded in the teacher's `channel::webrtc` / `relay::connection`
//! reconnect-loop shape; jitter via `rand`, already a teacher dependency.

use std::time::Duration;

use rand::Rng;

pub const BASE_DELAY: Duration = Duration::from_millis(100);
pub const MAX_DELAY: Duration = Duration::from_secs(5);
pub const JITTER_FRACTION: f64 = 0.25;

/// Exponential backoff with jitter, grounded in the teacher's reconnect
/// loops: doubles the delay on every failed attempt, capped at `MAX_DELAY`,
/// then perturbs by up to +/-`JITTER_FRACTION`.
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self { attempt: 0 }
    }

    /// The delay to wait before the next attempt; also advances the
    /// internal attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(16);
        self.attempt += 1;

        let base_millis = BASE_DELAY.as_millis() as u64;
        let capped_millis = base_millis.saturating_mul(1u64 << exp).min(MAX_DELAY.as_millis() as u64);

        let jitter_range = (capped_millis as f64 * JITTER_FRACTION) as i64;
        let jitter = if jitter_range > 0 {
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0
        };

        let jittered = (capped_millis as i64 + jitter).max(0) as u64;
        Duration::from_millis(jittered)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
