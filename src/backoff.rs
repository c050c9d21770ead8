use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

/// Time source for everything the pool manager schedules. Factored out so
/// sweepers and retry timing are deterministic under test.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Exponential backoff with jitter for create retries. Attempt `n` (1-based)
/// sleeps `base * 2^(n-1)` capped at `cap`, scaled by a jitter factor in
/// [0.8, 1.2]. `None` once the retry budget is spent.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub budget: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, budget: u32) -> Self {
        Backoff { base, cap, budget }
    }

    pub fn delay(&self, attempt: u32, rng: &mut impl Rng) -> Option<Duration> {
        if attempt == 0 || attempt >= self.budget {
            return None;
        }
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.cap);
        let jitter: f64 = rng.random_range(0.8..=1.2);
        Some(capped.mul_f64(jitter))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(Duration::from_secs(10), Duration::from_secs(300), 5)
    }
}
