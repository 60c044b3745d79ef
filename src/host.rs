//! Boundary to the host environment that runs rate-limited work.
//!
//! A durable workflow host owns the notion of "now", schedules wake-ups that survive
//! restarts, and knows whether the current step is a replay of already-completed history.
//! The executor consumes those capabilities only through [`Clock`], [`Sleeper`] and
//! [`ReplayDetector`]; [`HostClock`] and [`TimerSleeper`] adapt a [`HostContext`] to the
//! first two. Deciding whether something is a replay is always left to the host.

use crate::clock::{Clock, MonotonicClock};
use crate::sleeper::Sleeper;
use futures::future::BoxFuture;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Reports whether the caller is replaying history, so observers can skip side effects.
pub trait ReplayDetector: Send + Sync + std::fmt::Debug {
    fn is_replaying(&self) -> bool;
}

/// Detector for hosts without replay; every call is live.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverReplaying;

impl ReplayDetector for NeverReplaying {
    fn is_replaying(&self) -> bool {
        false
    }
}

/// Capabilities a workflow host provides to the limiter.
pub trait HostContext: ReplayDetector {
    /// Replay-safe current time.
    fn current_time(&self) -> SystemTime;

    /// Resolve no earlier than `fire_at`. Durable hosts persist the timer so the step can be
    /// resumed after a restart.
    fn create_timer(&self, fire_at: SystemTime) -> BoxFuture<'static, ()>;
}

/// [`Clock`] reading the host's replay-safe time.
#[derive(Debug)]
pub struct HostClock<H> {
    host: Arc<H>,
}

impl<H> HostClock<H> {
    pub fn new(host: Arc<H>) -> Self {
        Self { host }
    }
}

impl<H: HostContext> Clock for HostClock<H> {
    fn now(&self) -> SystemTime {
        self.host.current_time()
    }
}

/// [`Sleeper`] that suspends through a host timer scheduled at `current_time + duration`.
#[derive(Debug)]
pub struct TimerSleeper<H> {
    host: Arc<H>,
}

impl<H> TimerSleeper<H> {
    pub fn new(host: Arc<H>) -> Self {
        Self { host }
    }
}

impl<H: HostContext> Sleeper for TimerSleeper<H> {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        match self.host.current_time().checked_add(duration) {
            Some(fire_at) => self.host.create_timer(fire_at),
            // no representable fire time: the timer never fires
            None => Box::pin(futures::future::pending::<()>()),
        }
    }
}

/// In-memory host: monotonic time, tokio timers, and a replay flag the embedding runtime
/// can toggle. Timers do not survive a restart.
#[derive(Debug, Default)]
pub struct LiveHost {
    clock: MonotonicClock,
    replaying: AtomicBool,
}

impl LiveHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark subsequent calls as replayed (or live again).
    pub fn set_replaying(&self, replaying: bool) {
        self.replaying.store(replaying, Ordering::SeqCst);
    }
}

impl ReplayDetector for LiveHost {
    fn is_replaying(&self) -> bool {
        self.replaying.load(Ordering::SeqCst)
    }
}

impl HostContext for LiveHost {
    fn current_time(&self) -> SystemTime {
        self.clock.now()
    }

    fn create_timer(&self, fire_at: SystemTime) -> BoxFuture<'static, ()> {
        let wait = fire_at.duration_since(self.clock.now()).unwrap_or(Duration::ZERO);
        Box::pin(tokio::time::sleep(wait))
    }
}
