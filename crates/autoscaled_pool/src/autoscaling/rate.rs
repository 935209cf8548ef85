//! Ceiling on how many task invocations may start per minute.

use std::time::{Duration, Instant};

/// Token bucket holding at most one start, refilled at `max_tasks_per_minute / 60`
/// per second, so starts are spread evenly instead of bursting at the top of a minute.
#[derive(Debug)]
pub(crate) struct StartBudget {
    bucket: Option<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    per_second: f64,
    tokens: f64,
    last: Instant,
}

const BURST: f64 = 1.0;

/// Longest single wait handed out. Rates too low to refill within it are re-asked
/// after it elapses.
pub(crate) const MAX_WAIT: Duration = Duration::from_secs(60 * 60);

impl StartBudget {
    pub(crate) fn new(max_tasks_per_minute: Option<f64>, now: Instant) -> Self {
        let bucket = max_tasks_per_minute.map(|per_minute| Bucket {
            per_second: per_minute / 60.0,
            tokens: BURST,
            last: now,
        });
        Self { bucket }
    }

    /// Takes one start from the budget, or returns how long until one is available.
    pub(crate) fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        let Some(bucket) = self.bucket.as_mut() else {
            return Ok(());
        };

        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        if elapsed > 0.0 {
            bucket.tokens = (bucket.tokens + elapsed * bucket.per_second).min(BURST);
            bucket.last = now;
        }

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }

        let missing = 1.0 - bucket.tokens;
        let wait = Duration::try_from_secs_f64(missing / bucket.per_second).unwrap_or(MAX_WAIT);
        Err(wait.min(MAX_WAIT))
    }
}
