//! Clock abstractions used by the limiter state and the executors.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Clock abstraction so timing can be faked in tests.
///
/// Observations made for one key must be non-decreasing; the limiter treats a
/// regression as "window still open" rather than failing.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> SystemTime;
}

/// Wall clock backed by `SystemTime::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Monotonic clock anchored at the wall time it was created.
///
/// Elapsed time is measured with `tokio::time::Instant`, so a paused tokio runtime
/// (`start_paused = true`) advances this clock together with its timers.
///
/// Notes: resets when the process restarts; use [`SystemClock`] if timestamps must be
/// comparable across restarts.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    anchor: SystemTime,
    start: tokio::time::Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { anchor: SystemTime::now(), start: tokio::time::Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> SystemTime {
        self.anchor + self.start.elapsed()
    }
}

/// Hand-driven clock for deterministic tests. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    /// Start the clock at `start`. Times before the unix epoch clamp to the epoch.
    pub fn new(start: SystemTime) -> Self {
        Self { nanos: Arc::new(AtomicU64::new(to_nanos(start))) }
    }

    /// Start the clock at the unix epoch plus `offset`.
    pub fn at(offset: Duration) -> Self {
        Self::new(UNIX_EPOCH + offset)
    }

    pub fn advance(&self, by: Duration) {
        let by = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.fetch_add(by, Ordering::SeqCst);
    }

    /// Jump to an absolute time; may move backwards.
    pub fn set(&self, to: SystemTime) {
        self.nanos.store(to_nanos(to), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

fn to_nanos(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_and_shares_time() {
        let clock = ManualClock::at(Duration::from_secs(100));
        let other = clock.clone();

        clock.advance(Duration::from_millis(1500));

        assert_eq!(other.now(), UNIX_EPOCH + Duration::from_millis(101_500));
    }

    #[test]
    fn manual_clock_can_move_backwards() {
        let clock = ManualClock::at(Duration::from_secs(10));
        clock.set(UNIX_EPOCH + Duration::from_secs(3));
        assert_eq!(clock.now(), UNIX_EPOCH + Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn monotonic_clock_follows_paused_tokio_time() {
        let clock = MonotonicClock::default();
        let before = clock.now();

        tokio::time::advance(Duration::from_secs(7)).await;

        let elapsed = clock.now().duration_since(before).unwrap();
        assert_eq!(elapsed, Duration::from_secs(7));
    }
}
