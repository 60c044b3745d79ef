//! Per-key serialization of limiter decisions.
//!
//! A [`SerializationGate`] hands out at most one [`LimiterSession`] per key at a time. The
//! session is the only way to reach the key's [`RateLimiterState`], and dropping it releases
//! the gate, so release happens on every exit path including cancellation.
//!
//! [`KeyedGate`] is the in-process realization: one `tokio::sync::Mutex` per key, created
//! lazily in a registry and never shared between keys. The actor-based realization lives in
//! [`crate::durable`].

use crate::error::GateError;
use crate::limit::LimitTable;
use crate::state::RateLimiterState;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Exclusive access to one key's limiter state for the lifetime of the value.
///
/// Implementations release the gate on drop.
#[async_trait]
pub trait LimiterSession: Send {
    /// Delay a contender arriving at `now` must wait. See [`RateLimiterState::compute_delay`].
    async fn compute_delay(&mut self, now: SystemTime) -> Result<Duration, GateError>;
    /// Record a request starting at `now`. See [`RateLimiterState::record_request`].
    async fn record_request(&mut self, now: SystemTime) -> Result<(), GateError>;
}

/// Single-flight access to limiter state, keyed by limiter name.
#[async_trait]
pub trait SerializationGate: Send + Sync + 'static {
    type Session: LimiterSession + 'static;

    /// Wait until no other contender holds `key`, then take it.
    async fn acquire(&self, key: &str) -> Result<Self::Session, GateError>;
}

/// Session over an in-process mutex guard.
#[derive(Debug)]
pub struct LocalSession {
    guard: OwnedMutexGuard<RateLimiterState>,
}

impl LocalSession {
    /// Read-only view of the guarded state.
    pub fn state(&self) -> &RateLimiterState {
        &self.guard
    }
}

#[async_trait]
impl LimiterSession for LocalSession {
    async fn compute_delay(&mut self, now: SystemTime) -> Result<Duration, GateError> {
        Ok(self.guard.compute_delay(now))
    }

    async fn record_request(&mut self, now: SystemTime) -> Result<(), GateError> {
        self.guard.record_request(now);
        Ok(())
    }
}

type Slot = Arc<Mutex<RateLimiterState>>;

/// In-process gate: a registry of one async mutex per key.
///
/// Clones share the same registry.
#[derive(Debug, Clone)]
pub struct KeyedGate {
    limits: Arc<LimitTable>,
    slots: Arc<RwLock<HashMap<String, Slot>>>,
}

impl KeyedGate {
    pub fn new(limits: impl Into<LimitTable>) -> Self {
        Self { limits: Arc::new(limits.into()), slots: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Limits used when a key is first seen.
    pub fn limits(&self) -> &LimitTable {
        &self.limits
    }

    /// Copy of the key's current state, waiting for any in-flight contender to finish.
    pub async fn snapshot(&self, key: &str) -> Option<RateLimiterState> {
        let slot = self.slots.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()?;
        let state = slot.lock().await;
        Some(state.clone())
    }

    /// Number of keys seen so far.
    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, key: &str) -> Slot {
        if let Some(slot) = self.slots.read().unwrap_or_else(PoisonError::into_inner).get(key) {
            return slot.clone();
        }
        let mut map = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(key.to_string())
            .or_insert_with(|| {
                let limit = self.limits.limit_for(key);
                tracing::debug!(
                    target: "pacegate::gate",
                    key,
                    max_requests = limit.max_requests(),
                    window_ms = u64::try_from(limit.window().as_millis()).unwrap_or(u64::MAX),
                    "created limiter state"
                );
                Arc::new(Mutex::new(RateLimiterState::new(limit)))
            })
            .clone()
    }
}

#[async_trait]
impl SerializationGate for KeyedGate {
    type Session = LocalSession;

    async fn acquire(&self, key: &str) -> Result<LocalSession, GateError> {
        let guard = self.slot(key).lock_owned().await;
        Ok(LocalSession { guard })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limit::Limit;
    use std::time::UNIX_EPOCH;

    fn gate(max: u32, window: Duration) -> KeyedGate {
        KeyedGate::new(Limit::new(max, window).unwrap())
    }

    #[tokio::test]
    async fn creates_state_lazily_per_key() {
        let gate = gate(1, Duration::from_secs(1));
        assert!(gate.is_empty());
        assert!(gate.snapshot("a").await.is_none());

        drop(gate.acquire("a").await.unwrap());
        drop(gate.acquire("b").await.unwrap());
        drop(gate.acquire("a").await.unwrap());

        assert_eq!(gate.len(), 2);
    }

    #[tokio::test]
    async fn overrides_apply_on_first_use() {
        let default = Limit::new(5, Duration::from_secs(1)).unwrap();
        let strict = Limit::new(1, Duration::from_secs(9)).unwrap();
        let gate = KeyedGate::new(LimitTable::new(default).with_override("strict", strict));

        drop(gate.acquire("strict").await.unwrap());

        assert_eq!(gate.snapshot("strict").await.unwrap().limit(), strict);
    }

    #[tokio::test]
    async fn session_mutates_shared_state() {
        let gate = gate(1, Duration::from_secs(10));
        let now = UNIX_EPOCH + Duration::from_secs(50);

        let mut session = gate.acquire("k").await.unwrap();
        assert_eq!(session.compute_delay(now).await.unwrap(), Duration::ZERO);
        session.record_request(now).await.unwrap();
        assert_eq!(session.state().request_count(), 1);
        drop(session);

        let mut session = gate.acquire("k").await.unwrap();
        assert_eq!(session.compute_delay(now).await.unwrap(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn same_key_waits_for_release() {
        let gate = gate(1, Duration::from_secs(1));
        let held = gate.acquire("k").await.unwrap();

        let contender = gate.clone();
        let waiter = tokio::spawn(async move { contender.acquire("k").await.map(|_| ()) });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished(), "second contender must wait for the gate");

        drop(held);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn different_keys_do_not_block_each_other() {
        let gate = gate(1, Duration::from_secs(1));
        let _held = gate.acquire("a").await.unwrap();

        let other = tokio::time::timeout(Duration::from_millis(100), gate.acquire("b")).await;
        assert!(other.is_ok(), "unrelated key should not wait");
    }
}
