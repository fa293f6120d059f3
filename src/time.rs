//! Time sources.
//!
//! Every timestamp the registry and cache record (discovery time, last
//! verification, cache expiry) is read from a `Clock`, so TTL behaviour can be
//! tested deterministically with `ManualClock`.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// Source of the current time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock backed by `Utc::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
///
/// # Examples
///
/// ```
/// use kyro_assoc::time::{Clock, ManualClock};
/// use chrono::Duration;
///
/// let clock = ManualClock::default();
/// let t0 = clock.now();
/// clock.advance(Duration::milliseconds(5));
/// assert_eq!(clock.now() - t0, Duration::milliseconds(5));
/// ```
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Creates a clock frozen at `at`.
    #[must_use]
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(at) }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *now += by;
    }

    /// Sets the clock to an absolute time.
    pub fn set(&self, at: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *now = at;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Upper bound for durations converted from `std::time::Duration`.
const MAX_CHRONO_DAYS: i64 = 365 * 1000;

/// Converts a std duration to a chrono duration, saturating on overflow.
pub(crate) fn to_chrono(d: std::time::Duration) -> Duration {
    Duration::from_std(d)
        .ok()
        .filter(|v| *v <= Duration::days(MAX_CHRONO_DAYS))
        .unwrap_or_else(|| Duration::days(MAX_CHRONO_DAYS))
}
