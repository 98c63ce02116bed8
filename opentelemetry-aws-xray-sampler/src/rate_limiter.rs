use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::clock::Clock;

const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// Tokens per second assumed while borrowing, regardless of the real quota.
///
/// Borrowing keeps a sparse trickle of samples (and therefore statistics)
/// flowing when a rule has no usable quota, e.g. before the first targets
/// response or after a granted quota's TTL has passed.
const BORROW_QUOTA: f64 = 1.0;

/// Token bucket with a fixed refill rate and a capped balance.
///
/// The wallet is stored as a floor timestamp in integer nanoseconds: the
/// balance is the capped distance between now and the floor, and spending
/// advances the floor. Working on scaled integers instead of subtracting
/// wall-clock seconds as floats keeps the arithmetic drift-free over long
/// uptimes, and makes the limiter fully deterministic under an injected
/// clock.
#[derive(Debug)]
pub(crate) struct RateLimiter {
    quota: f64,
    max_balance_nanos: u128,
    clock: Arc<dyn Clock>,
    wallet_floor_nanos: Mutex<u128>,
}

impl RateLimiter {
    pub(crate) fn new(max_balance_seconds: u64, quota: f64, clock: Arc<dyn Clock>) -> Self {
        let floor = nanos_since_epoch(clock.now());
        RateLimiter {
            quota,
            max_balance_nanos: u128::from(max_balance_seconds) * NANOS_PER_SECOND,
            clock,
            wallet_floor_nanos: Mutex::new(floor),
        }
    }

    pub(crate) fn quota(&self) -> f64 {
        self.quota
    }

    /// Attempts to spend `cost` tokens, returning whether they were granted.
    ///
    /// With `borrow` set the cost is priced against [`BORROW_QUOTA`] instead
    /// of the real quota. State is only mutated on success.
    pub(crate) fn try_spend(&self, cost: f64, borrow: bool) -> bool {
        let quota = if borrow { BORROW_QUOTA } else { self.quota };
        if quota <= 0.0 {
            return false;
        }

        let cost_nanos = (cost * NANOS_PER_SECOND as f64 / quota) as u128;
        let ceiling = nanos_since_epoch(self.clock.now());

        let mut floor = self.wallet_floor_nanos.lock().unwrap();
        let balance = ceiling.saturating_sub(*floor).min(self.max_balance_nanos);
        if balance >= cost_nanos {
            *floor = ceiling - (balance - cost_nanos);
            true
        } else {
            false
        }
    }
}

fn nanos_since_epoch(time: SystemTime) -> u128 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}
