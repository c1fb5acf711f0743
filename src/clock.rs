//! Monotonic time source used to stamp and expire cache items.

use clocksource::precise::{Duration, Instant};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Longest TTL a cache accepts; longer values are clamped (~100 years).
pub const MAX_TTL: std::time::Duration = std::time::Duration::from_secs(100 * 365 * 24 * 3600);

/// Source of the current monotonic time.
///
/// The cache only ever compares instants produced by the same clock, so any
/// monotonic source works.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
}

/// The system monotonic clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
///
/// Useful for deterministic expiration behavior, e.g.:
///
/// ```
/// use meta_cache::{ManualClock, MetaCache};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let clock = Arc::new(ManualClock::new());
/// let cache = MetaCache::builder()
///     .ttl(Duration::from_secs(5))
///     .clock(clock.clone())
///     .build()
///     .unwrap();
///
/// cache.add(b"dir page").unwrap();
/// clock.advance(Duration::from_secs(5));
/// assert_eq!(cache.expire_sweep(), 1);
/// ```
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    elapsed_ns: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed_ns: AtomicU64::new(0),
        }
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: std::time::Duration) {
        self.elapsed_ns.fetch_add(to_nanos(by), Ordering::Relaxed);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + Duration::from_nanos(self.elapsed_ns.load(Ordering::Relaxed))
    }
}

fn to_nanos(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Convert a TTL into the clock's duration type, clamping to [`MAX_TTL`].
pub(crate) fn ttl_duration(ttl: std::time::Duration) -> Duration {
    Duration::from_nanos(to_nanos(ttl.min(MAX_TTL)))
}
