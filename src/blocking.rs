//! Synchronous in-process shape.
//!
//! Same decision sequence as [`crate::RateLimitedExecutor`], for callers without an async
//! runtime: one `std::sync::Mutex` per key, and suspension by parking the calling thread.
//! The action always runs after the key's mutex is released.

use crate::clock::{Clock, SystemClock};
use crate::error::PacingError;
use crate::limit::LimitTable;
use crate::sleeper::{BlockingSleeper, ThreadSleeper};
use crate::state::RateLimiterState;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

type Slot = Arc<Mutex<RateLimiterState>>;

/// Blocking rate-limited executor. Clones share the same per-key state.
#[derive(Debug, Clone)]
pub struct BlockingExecutor {
    limits: Arc<LimitTable>,
    slots: Arc<RwLock<HashMap<String, Slot>>>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn BlockingSleeper>,
}

impl BlockingExecutor {
    /// Wall clock and thread sleeps.
    pub fn new(limits: impl Into<LimitTable>) -> Self {
        Self {
            limits: Arc::new(limits.into()),
            slots: Arc::new(RwLock::new(HashMap::new())),
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Override how the calling thread is suspended.
    pub fn with_sleeper<S: BlockingSleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Run `action` once `key` admits it, blocking the thread while deferred.
    pub fn execute<T, E, Op>(&self, key: &str, action: Op) -> Result<T, PacingError<E>>
    where
        Op: FnOnce() -> Result<T, E>,
    {
        let slot = self.slot(key);
        {
            let mut state = lock(&slot);
            let delay = state.compute_delay(self.clock.now());
            if !delay.is_zero() {
                tracing::debug!(
                    target: "pacegate::blocking",
                    key,
                    delay_ms = delay.as_secs_f64() * 1000.0,
                    "delay required"
                );
                self.sleeper.sleep_blocking(delay);
            }
            state.record_request(self.clock.now());
        }
        action().map_err(PacingError::Inner)
    }

    /// Run `action` only if `key` admits it now; otherwise report how long to wait.
    pub fn try_execute<T, E, Op>(&self, key: &str, action: Op) -> Result<T, PacingError<E>>
    where
        Op: FnOnce() -> Result<T, E>,
    {
        match self.admit(key) {
            Some(retry_after) => Err(PacingError::Deferred { retry_after }),
            None => action().map_err(PacingError::Inner),
        }
    }

    /// Run `action` if admitted now, else hand the wait to `retry_in` and return `None`.
    pub fn execute_or_retry<T, Op, R>(&self, key: &str, action: Op, retry_in: R) -> Option<T>
    where
        Op: FnOnce() -> T,
        R: FnOnce(Duration),
    {
        match self.admit(key) {
            Some(retry_after) => {
                retry_in(retry_after);
                None
            }
            None => Some(action()),
        }
    }

    /// Copy of the key's current state.
    pub fn snapshot(&self, key: &str) -> Option<RateLimiterState> {
        let slot = self.slots.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()?;
        let state = lock(&slot).clone();
        Some(state)
    }

    /// Decide and record under the key's mutex. `Some(delay)` means deferred.
    fn admit(&self, key: &str) -> Option<Duration> {
        let slot = self.slot(key);
        let mut state = lock(&slot);
        let delay = state.compute_delay(self.clock.now());
        if !delay.is_zero() {
            return Some(delay);
        }
        state.record_request(self.clock.now());
        None
    }

    fn slot(&self, key: &str) -> Slot {
        if let Some(slot) = self.slots.read().unwrap_or_else(PoisonError::into_inner).get(key) {
            return slot.clone();
        }
        let mut map = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(RateLimiterState::new(self.limits.limit_for(key))))
            })
            .clone()
    }
}

// A panic inside the critical section cannot leave the state half-updated.
fn lock(slot: &Slot) -> MutexGuard<'_, RateLimiterState> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}
