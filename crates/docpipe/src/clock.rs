//! Injected time source.
//!
//! Retry backoff and job deadlines never call `std::thread::sleep` or
//! `Utc::now()` directly; they go through a [`Clock`] handed to the
//! constructor. Production uses [`SystemClock`]; tests use [`ManualClock`]
//! to make backoff schedules observable without real delays.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Exponential backoff delay for a 1-based attempt number:
/// `base × 2^(attempt-1)`, capped.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.checked_mul(1u32 << exponent).unwrap_or(cap).min(cap)
}

/// Time source for scheduling decisions.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Blocks the calling worker for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Real wall clock. Sleeps block the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Deterministic clock for tests. `sleep` advances the reported time
/// instead of blocking, and every requested duration is recorded so tests
/// can assert on the backoff schedule.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    /// Moves the reported time forward without recording a sleep.
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
    }

    /// Durations passed to `sleep`, in call order.
    pub fn recorded_sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::starting_at(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
        self.advance(duration);
    }
}
