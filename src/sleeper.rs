//! Abstraction for sleeping/waiting
//!
//! A deferred contender is suspended through one of these. [`Sleeper`] serves async callers,
//! [`BlockingSleeper`] serves the synchronous executor. Test doubles implement both.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Abstraction for sleeping/waiting
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Thread-blocking counterpart of [`Sleeper`].
pub trait BlockingSleeper: Send + Sync + std::fmt::Debug {
    fn sleep_blocking(&self, duration: Duration);
}

/// Production sleeper using tokio runtime
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Production sleeper parking the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl BlockingSleeper for ThreadSleeper {
    fn sleep_blocking(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Test sleeper that doesn't actually sleep
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async {})
    }
}

impl BlockingSleeper for InstantSleeper {
    fn sleep_blocking(&self, _duration: Duration) {}
}

/// Test sleeper that tracks all sleep calls
#[derive(Debug, Clone)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self { calls: Arc::new(Mutex::new(Vec::new())) }
    }

    /// Requested durations in call order.
    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn push(&self, duration: Duration) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(duration);
    }
}

impl Default for TrackingSleeper {
    fn default() -> Self {
        Self::new()
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.push(duration);
        Box::pin(async {})
    }
}

impl BlockingSleeper for TrackingSleeper {
    fn sleep_blocking(&self, duration: Duration) {
        self.push(duration);
    }
}
