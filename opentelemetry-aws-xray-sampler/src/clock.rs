use std::fmt::Debug;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall-clock abstraction shared by the rate limiters, the rule cache and
/// the pollers. Injecting a manual implementation makes every time-based
/// decision in the crate deterministic under test.
pub(crate) trait Clock: Debug + Send + Sync {
    fn now(&self) -> SystemTime;

    /// Converts an epoch timestamp in (possibly fractional) seconds, as sent
    /// by the sampling service, into a [`SystemTime`].
    fn from_timestamp(&self, secs: f64) -> SystemTime {
        if secs.is_finite() && secs > 0.0 {
            UNIX_EPOCH + Duration::from_secs_f64(secs)
        } else {
            UNIX_EPOCH
        }
    }

    fn delta(&self, secs: f64) -> Duration {
        if secs.is_finite() && secs > 0.0 {
            Duration::from_secs_f64(secs)
        } else {
            Duration::ZERO
        }
    }
}

/// Epoch seconds for a [`SystemTime`], clamped to zero for pre-epoch times.
pub(crate) fn epoch_secs(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Debug, Default)]
pub(crate) struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}
