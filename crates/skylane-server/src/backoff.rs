//! Exponential backoff with jitter for terrain tile retries.
//!
//! The delay before retry `n` (zero-based) is `base * 2^n`, capped at `max`,
//! plus up to 20% jitter so concurrent waiters don't retry in lockstep.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempts: u32,
    jitter_ratio: f64,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let base = base.max(Duration::from_millis(1));
        let max = max.max(base);
        Self {
            base,
            max,
            attempts: 0,
            jitter_ratio: 0.2,
        }
    }

    /// Delays handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failure and return how long to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempts).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.max);
        self.attempts = self.attempts.saturating_add(1);
        add_jitter(delay, self.jitter_ratio)
    }
}

fn add_jitter(delay: Duration, ratio: f64) -> Duration {
    if !(0.0..=1.0).contains(&ratio) {
        return delay;
    }

    let delay_ms = delay.as_millis();
    if delay_ms == 0 {
        return delay;
    }

    let jitter_ms_max = ((delay_ms as f64) * ratio) as u128;
    if jitter_ms_max == 0 {
        return delay;
    }

    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    let jitter_ms = (now_nanos as u128) % (jitter_ms_max + 1);
    delay + Duration::from_millis(jitter_ms as u64)
}
