//! Monitor Clock
//!
//! Monotonic time source for cooldown bookkeeping.
//! Wall-clock timestamps on alerts and audit events use chrono instead;
//! they may jump, this clock may not.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

/// Nanoseconds on a monotonic timeline with an arbitrary origin.
pub type Nanos = i64;

pub const NANOS_PER_MILLI: i64 = 1_000_000;
pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Source of monotonic time shared by the threshold worker and tests.
pub trait MonotonicClock: Send + Sync + fmt::Debug {
    fn now(&self) -> Nanos;
}

/// Convert a std duration to nanoseconds, saturating at `Nanos::MAX`.
#[inline]
pub fn duration_to_nanos(d: Duration) -> Nanos {
    i64::try_from(d.as_nanos()).unwrap_or(Nanos::MAX)
}

/// Process-local monotonic clock backed by `Instant`.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for SystemClock {
    #[inline]
    fn now(&self) -> Nanos {
        duration_to_nanos(self.origin.elapsed())
    }
}

/// Hand-driven clock for deterministic cooldown tests.
///
/// # Contract
/// - `advance_by()` / `advance_to()` only move forward, panic on backward movement
/// - Shared by reference; interior atomics make it usable behind `Arc<dyn MonotonicClock>`
#[derive(Debug, Default)]
pub struct ManualClock {
    current: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Nanos) -> Self {
        Self {
            current: AtomicI64::new(start),
        }
    }

    pub fn advance_by(&self, delta: Duration) {
        let delta = duration_to_nanos(delta);
        self.current.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn advance_to(&self, target: Nanos) {
        let prev = self.current.fetch_max(target, Ordering::SeqCst);
        assert!(
            target >= prev,
            "ManualClock cannot move backward: {} -> {}",
            prev,
            target
        );
    }
}

impl MonotonicClock for ManualClock {
    #[inline]
    fn now(&self) -> Nanos {
        self.current.load(Ordering::SeqCst)
    }
}
