//! Rate-limited execution of async actions.
//!
//! Semantics:
//! - `execute(key, action)` acquires the gate for `key`, asks the state how long to wait,
//!   suspends for that long if needed, records the request, releases the gate and then (by
//!   default) runs the action.
//! - `try_execute(key, action)` runs the identical decide/record sequence but returns
//!   [`PacingError::Deferred`] instead of suspending.
//! - The action's result or failure is returned unchanged (`Inner`). A failed action still
//!   consumed its slot.
//!
//! Invariants:
//! - Decide, suspend and record never interleave across contenders for the same key.
//! - A contender cancelled while suspended releases the gate and records nothing.
//! - No hidden retries: deferral is visible to the caller.
//!
//! Example
//! ```rust
//! use pacegate::{KeyedGate, Limit, RateLimitedExecutor};
//! use std::time::Duration;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let gate = KeyedGate::new(Limit::new(5, Duration::from_secs(1)).unwrap());
//! let executor = RateLimitedExecutor::builder(gate).build();
//! let value = executor
//!     .execute("search-api", || async { Ok::<_, std::io::Error>(42) })
//!     .await
//!     .unwrap();
//! assert_eq!(value, 42);
//! # });
//! ```

use crate::clock::{Clock, MonotonicClock};
use crate::error::PacingError;
use crate::gate::{LimiterSession, SerializationGate};
use crate::host::{HostClock, HostContext, NeverReplaying, ReplayDetector, TimerSleeper};
use crate::sleeper::{Sleeper, TokioSleeper};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Whether the action runs after the gate is released or while it is still held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActionScope {
    /// Release after recording, then run the action. At most `max_requests` recorded starts
    /// per window; slow actions never hold up other contenders.
    #[default]
    AfterRelease,
    /// Run the action before releasing. Contenders for the key are fully serialized.
    WithinGate,
}

/// Executes actions through a [`SerializationGate`], deferring those over the limit.
///
/// Clones share the same gate.
pub struct RateLimitedExecutor<G> {
    gate: Arc<G>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    replay: Arc<dyn ReplayDetector>,
    scope: ActionScope,
}

impl<G> Clone for RateLimitedExecutor<G> {
    fn clone(&self) -> Self {
        Self {
            gate: self.gate.clone(),
            clock: self.clock.clone(),
            sleeper: self.sleeper.clone(),
            replay: self.replay.clone(),
            scope: self.scope,
        }
    }
}

impl<G> std::fmt::Debug for RateLimitedExecutor<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedExecutor")
            .field("clock", &self.clock)
            .field("sleeper", &self.sleeper)
            .field("replay", &self.replay)
            .field("scope", &self.scope)
            .finish()
    }
}

impl<G: SerializationGate> RateLimitedExecutor<G> {
    /// Construct a new builder with defaults.
    pub fn builder(gate: G) -> ExecutorBuilder<G> {
        ExecutorBuilder::new(gate)
    }

    /// The underlying gate.
    pub fn gate(&self) -> &G {
        &self.gate
    }

    /// Run `action` once `key` admits it, suspending first if the window is full.
    pub async fn execute<T, E, Fut, Op>(&self, key: &str, action: Op) -> Result<T, PacingError<E>>
    where
        T: Send,
        E: Send,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let mut session = self.gate.acquire(key).await?;

        let delay = session.compute_delay(self.clock.now()).await?;
        if !delay.is_zero() {
            self.observe_deferral(key, delay);
            self.sleeper.sleep(delay).await;
        }
        session.record_request(self.clock.now()).await?;

        self.finish(session, action).await
    }

    /// Run `action` only if `key` admits it now; otherwise report how long to wait.
    ///
    /// A deferral still counts as a computed delay, so repeated deferrals within one window
    /// receive growing `retry_after` values.
    pub async fn try_execute<T, E, Fut, Op>(
        &self,
        key: &str,
        action: Op,
    ) -> Result<T, PacingError<E>>
    where
        T: Send,
        E: Send,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let mut session = self.gate.acquire(key).await?;

        let delay = session.compute_delay(self.clock.now()).await?;
        if !delay.is_zero() {
            drop(session);
            self.observe_deferral(key, delay);
            return Err(PacingError::Deferred { retry_after: delay });
        }
        session.record_request(self.clock.now()).await?;

        self.finish(session, action).await
    }

    async fn finish<T, E, Fut, Op>(
        &self,
        session: G::Session,
        action: Op,
    ) -> Result<T, PacingError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
    {
        match self.scope {
            ActionScope::AfterRelease => {
                drop(session);
                action().await.map_err(PacingError::Inner)
            }
            ActionScope::WithinGate => {
                let result = action().await;
                drop(session);
                result.map_err(PacingError::Inner)
            }
        }
    }

    fn observe_deferral(&self, key: &str, delay: Duration) {
        if self.replay.is_replaying() {
            return;
        }
        debug!(
            target: "pacegate::executor",
            key,
            delay_ms = delay.as_secs_f64() * 1000.0,
            "delay required"
        );
    }
}

/// Builder for `RateLimitedExecutor`.
pub struct ExecutorBuilder<G> {
    gate: G,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    replay: Arc<dyn ReplayDetector>,
    scope: ActionScope,
}

impl<G: SerializationGate> ExecutorBuilder<G> {
    /// Monotonic clock, tokio timers, no replay, action after release.
    pub fn new(gate: G) -> Self {
        Self {
            gate,
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
            replay: Arc::new(NeverReplaying),
            scope: ActionScope::default(),
        }
    }

    /// Provide a custom clock implementation.
    pub fn clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Provide a custom sleeper implementation.
    pub fn sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Source of replay detection for diagnostics.
    pub fn replay_detector<R>(mut self, replay: R) -> Self
    where
        R: ReplayDetector + 'static,
    {
        self.replay = Arc::new(replay);
        self
    }

    /// Take time, suspension and replay detection from a workflow host.
    pub fn hosted_by<H>(mut self, host: Arc<H>) -> Self
    where
        H: HostContext + 'static,
    {
        self.clock = Arc::new(HostClock::new(host.clone()));
        self.sleeper = Arc::new(TimerSleeper::new(host.clone()));
        self.replay = host;
        self
    }

    /// Choose whether the action runs inside the gate.
    pub fn action_scope(mut self, scope: ActionScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn build(self) -> RateLimitedExecutor<G> {
        RateLimitedExecutor {
            gate: Arc::new(self.gate),
            clock: self.clock,
            sleeper: self.sleeper,
            replay: self.replay,
            scope: self.scope,
        }
    }
}
