use super::store::EntityStore;
use crate::error::GateError;
use crate::gate::{LimiterSession, SerializationGate};
use crate::limit::LimitTable;
use crate::state::RateLimiterState;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

type LeaseId = u64;
type Ops = mpsc::UnboundedSender<EntityOp>;
type Reply<T> = oneshot::Sender<Result<T, GateError>>;

/// Messages understood by an entity worker. Processed strictly one at a time.
#[derive(Debug)]
enum EntityOp {
    Lock { reply: Reply<LeaseId> },
    Unlock { lease: LeaseId },
    ComputeDelay { lease: LeaseId, now: SystemTime, reply: Reply<Duration> },
    RecordRequest { lease: LeaseId, now: SystemTime, reply: Reply<()> },
    Snapshot { reply: Reply<RateLimiterState> },
}

impl EntityOp {
    /// Answer the op with `err` instead of running it.
    fn fail(self, err: GateError) {
        match self {
            EntityOp::Lock { reply } => {
                let _ = reply.send(Err(err));
            }
            EntityOp::ComputeDelay { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            EntityOp::RecordRequest { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            EntityOp::Snapshot { reply } => {
                let _ = reply.send(Err(err));
            }
            EntityOp::Unlock { .. } => {}
        }
    }
}

/// Single-threaded owner of one key's state.
struct Entity<S> {
    key: String,
    state: RateLimiterState,
    store: Arc<S>,
    holder: Option<LeaseId>,
    waiting: VecDeque<Reply<LeaseId>>,
    next_lease: LeaseId,
}

impl<S: EntityStore> Entity<S> {
    /// Restore from the store, then serve ops. Ops sent meanwhile wait in the channel.
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EntityOp>) {
        match self.store.load(&self.key).await {
            Ok(restored) => {
                let was_restored = restored.is_some();
                if let Some(state) = restored {
                    self.state = state;
                }
                debug!(
                    target: "pacegate::durable",
                    key = %self.key,
                    restored = was_restored,
                    request_count = self.state.request_count(),
                    "limiter entity started"
                );
            }
            Err(e) => {
                warn!(
                    target: "pacegate::durable",
                    key = %self.key,
                    error = %e,
                    "failed to restore limiter state"
                );
                let err = store_error(&self.key, e);
                // closing makes the hub spawn a fresh worker on the next acquire
                rx.close();
                while let Some(op) = rx.recv().await {
                    op.fail(err.clone());
                }
                return;
            }
        }

        while let Some(op) = rx.recv().await {
            match op {
                EntityOp::Lock { reply } => {
                    if self.holder.is_some() {
                        self.waiting.push_back(reply);
                    } else {
                        self.grant(reply);
                    }
                }
                EntityOp::Unlock { lease } => self.unlock(lease),
                EntityOp::ComputeDelay { lease, now, reply } => {
                    let result = match self.check_lease(lease) {
                        Ok(()) => self.compute_delay(now).await,
                        Err(e) => Err(e),
                    };
                    let _ = reply.send(result);
                }
                EntityOp::RecordRequest { lease, now, reply } => {
                    let result = match self.check_lease(lease) {
                        Ok(()) => self.record_request(now).await,
                        Err(e) => Err(e),
                    };
                    let _ = reply.send(result);
                }
                EntityOp::Snapshot { reply } => {
                    let _ = reply.send(Ok(self.state.clone()));
                }
            }
        }
        debug!(target: "pacegate::durable", key = %self.key, "entity stopped");
    }

    /// Hand the lock to `reply`; a contender that gave up is skipped.
    fn grant(&mut self, reply: Reply<LeaseId>) -> bool {
        let lease = self.next_lease;
        self.next_lease = self.next_lease.wrapping_add(1);
        if reply.send(Ok(lease)).is_ok() {
            self.holder = Some(lease);
            true
        } else {
            false
        }
    }

    fn unlock(&mut self, lease: LeaseId) {
        if self.holder != Some(lease) {
            warn!(
                target: "pacegate::durable",
                key = %self.key,
                lease,
                "unlock with stale lease ignored"
            );
            return;
        }
        self.holder = None;
        while let Some(reply) = self.waiting.pop_front() {
            if self.grant(reply) {
                break;
            }
        }
    }

    fn check_lease(&self, lease: LeaseId) -> Result<(), GateError> {
        if self.holder == Some(lease) {
            Ok(())
        } else {
            Err(GateError::LeaseNotHeld { key: self.key.clone(), lease })
        }
    }

    async fn compute_delay(&mut self, now: SystemTime) -> Result<Duration, GateError> {
        let mut next = self.state.clone();
        let delay = next.compute_delay(now);
        self.commit(next).await?;
        Ok(delay)
    }

    async fn record_request(&mut self, now: SystemTime) -> Result<(), GateError> {
        let mut next = self.state.clone();
        next.record_request(now);
        self.commit(next).await
    }

    async fn commit(&mut self, next: RateLimiterState) -> Result<(), GateError> {
        if next == self.state {
            return Ok(());
        }
        if let Err(e) = self.store.save(&self.key, &next).await {
            warn!(
                target: "pacegate::durable",
                key = %self.key,
                error = %e,
                "failed to persist limiter state"
            );
            return Err(store_error(&self.key, e));
        }
        self.state = next;
        Ok(())
    }
}

/// Lock on one entity. Dropping it unlocks the entity.
#[derive(Debug)]
pub struct EntityLease {
    key: String,
    lease: LeaseId,
    ops: Ops,
}

impl EntityLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    fn closed(&self) -> GateError {
        GateError::EntityClosed { key: self.key.clone() }
    }
}

impl Drop for EntityLease {
    fn drop(&mut self) {
        let _ = self.ops.send(EntityOp::Unlock { lease: self.lease });
    }
}

#[async_trait]
impl LimiterSession for EntityLease {
    async fn compute_delay(&mut self, now: SystemTime) -> Result<Duration, GateError> {
        let (reply, rx) = oneshot::channel();
        self.ops
            .send(EntityOp::ComputeDelay { lease: self.lease, now, reply })
            .map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())?
    }

    async fn record_request(&mut self, now: SystemTime) -> Result<(), GateError> {
        let (reply, rx) = oneshot::channel();
        self.ops
            .send(EntityOp::RecordRequest { lease: self.lease, now, reply })
            .map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())?
    }
}

/// Lock request in flight. If the requester is cancelled after the entity granted the lock,
/// the grant is handed straight back.
struct PendingLease {
    rx: oneshot::Receiver<Result<LeaseId, GateError>>,
    ops: Ops,
}

impl Drop for PendingLease {
    fn drop(&mut self) {
        self.rx.close();
        if let Ok(Ok(lease)) = self.rx.try_recv() {
            let _ = self.ops.send(EntityOp::Unlock { lease });
        }
    }
}

/// Registry of entity workers, one per key, spawned on first use.
///
/// Each worker owns its key's [`RateLimiterState`] and processes messages one at a time.
/// A worker restores its state from the [`EntityStore`] before serving its first message;
/// configured limits only apply to keys with no saved state. The registry lock is never
/// held across I/O. Clones share the same workers.
pub struct EntityHub<S> {
    limits: Arc<LimitTable>,
    store: Arc<S>,
    entities: Arc<Mutex<HashMap<String, Ops>>>,
}

impl<S> Clone for EntityHub<S> {
    fn clone(&self) -> Self {
        Self {
            limits: self.limits.clone(),
            store: self.store.clone(),
            entities: self.entities.clone(),
        }
    }
}

impl<S> std::fmt::Debug for EntityHub<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityHub")
            .field("limits", &self.limits)
            .field("store", &"<store>")
            .finish()
    }
}

impl<S: EntityStore> EntityHub<S> {
    pub fn new(limits: impl Into<LimitTable>, store: S) -> Self {
        Self {
            limits: Arc::new(limits.into()),
            store: Arc::new(store),
            entities: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Current state for `key`: from its running worker, else from the store.
    pub async fn snapshot(&self, key: &str) -> Result<Option<RateLimiterState>, GateError> {
        let ops = self
            .entities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .filter(|ops| !ops.is_closed())
            .cloned();
        match ops {
            Some(ops) => {
                let (reply, rx) = oneshot::channel();
                let closed = || GateError::EntityClosed { key: key.to_string() };
                ops.send(EntityOp::Snapshot { reply }).map_err(|_| closed())?;
                rx.await.map_err(|_| closed())?.map(Some)
            }
            None => self.store.load(key).await.map_err(|e| store_error(key, e)),
        }
    }

    /// Sender for the key's worker, spawning one if none is running.
    fn entity(&self, key: &str) -> Ops {
        let mut entities = self.entities.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(ops) = entities.get(key) {
            if !ops.is_closed() {
                return ops.clone();
            }
        }

        let (ops, rx) = mpsc::unbounded_channel();
        let entity = Entity {
            key: key.to_string(),
            state: RateLimiterState::new(self.limits.limit_for(key)),
            store: self.store.clone(),
            holder: None,
            waiting: VecDeque::new(),
            next_lease: 0,
        };
        tokio::spawn(entity.run(rx));
        entities.insert(key.to_string(), ops.clone());
        ops
    }
}

fn store_error<E: std::fmt::Display>(key: &str, e: E) -> GateError {
    GateError::Store { key: key.to_string(), reason: e.to_string() }
}

#[async_trait]
impl<S: EntityStore> SerializationGate for EntityHub<S> {
    type Session = EntityLease;

    async fn acquire(&self, key: &str) -> Result<EntityLease, GateError> {
        let closed = || GateError::EntityClosed { key: key.to_string() };
        let ops = self.entity(key);
        let (reply, rx) = oneshot::channel();
        ops.send(EntityOp::Lock { reply }).map_err(|_| closed())?;

        let mut pending = PendingLease { rx, ops: ops.clone() };
        let lease = (&mut pending.rx).await.map_err(|_| closed())??;
        Ok(EntityLease { key: key.to_string(), lease, ops })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::InMemoryEntityStore;
    use crate::limit::Limit;
    use std::time::UNIX_EPOCH;

    fn hub(max: u32, window: Duration) -> EntityHub<InMemoryEntityStore> {
        EntityHub::new(Limit::new(max, window).unwrap(), InMemoryEntityStore::new())
    }

    fn t(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn lease_drives_decisions() {
        let hub = hub(1, Duration::from_secs(10));

        let mut lease = hub.acquire("k").await.unwrap();
        assert_eq!(lease.compute_delay(t(100)).await.unwrap(), Duration::ZERO);
        lease.record_request(t(100)).await.unwrap();
        assert_eq!(lease.compute_delay(t(104)).await.unwrap(), Duration::from_secs(6));
        drop(lease);

        let state = hub.snapshot("k").await.unwrap().unwrap();
        assert_eq!(state.request_count(), 1);
        assert_eq!(state.last_computed_delay(), Some(Duration::from_secs(6)));
    }

    #[tokio::test(start_paused = true)]
    async fn lock_is_exclusive_and_fifo() {
        let hub = hub(1, Duration::from_secs(1));
        let first = hub.acquire("k").await.unwrap();

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let hub = hub.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _lease = hub.acquire("k").await.unwrap();
                order.lock().unwrap().push(i);
            }));
            // let each contender enqueue before the next one
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert!(order.lock().unwrap().is_empty(), "nobody may enter while the lock is held");
        drop(first);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_waiter_does_not_wedge_the_lock() {
        let hub = hub(1, Duration::from_secs(1));
        let first = hub.acquire("k").await.unwrap();

        let gave_up = tokio::time::timeout(Duration::from_millis(5), hub.acquire("k")).await;
        assert!(gave_up.is_err());

        drop(first);
        let next = tokio::time::timeout(Duration::from_millis(50), hub.acquire("k")).await;
        assert!(next.is_ok(), "lock should pass over the cancelled waiter");
    }

    #[tokio::test]
    async fn stale_lease_is_rejected() {
        let hub = hub(1, Duration::from_secs(1));
        let ops = hub.entity("k");
        let mut forged = EntityLease { key: "k".into(), lease: 99, ops };

        let err = forged.record_request(t(1)).await.unwrap_err();

        assert_eq!(err, GateError::LeaseNotHeld { key: "k".into(), lease: 99 });
    }

    #[tokio::test]
    async fn state_is_restored_from_store_on_respawn() {
        let store = InMemoryEntityStore::new();
        let limit = Limit::new(1, Duration::from_secs(30)).unwrap();
        {
            let hub = EntityHub::new(limit, store.clone());
            let mut lease = hub.acquire("k").await.unwrap();
            lease.record_request(t(10)).await.unwrap();
        }

        let looser = Limit::new(100, Duration::from_secs(1)).unwrap();
        let hub = EntityHub::new(looser, store);
        let mut lease = hub.acquire("k").await.unwrap();

        assert_eq!(lease.compute_delay(t(20)).await.unwrap(), Duration::from_secs(20));
    }

    #[derive(Debug, Clone, Default)]
    struct FailingStore;

    #[derive(Debug)]
    struct Unavailable;

    impl std::fmt::Display for Unavailable {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "store unavailable")
        }
    }

    impl std::error::Error for Unavailable {}

    #[async_trait]
    impl EntityStore for FailingStore {
        type Error = Unavailable;

        async fn load(&self, _key: &str) -> Result<Option<RateLimiterState>, Unavailable> {
            Ok(None)
        }

        async fn save(&self, _key: &str, _state: &RateLimiterState) -> Result<(), Unavailable> {
            Err(Unavailable)
        }
    }

    #[tokio::test]
    async fn failed_save_leaves_state_untouched() {
        let hub = EntityHub::new(Limit::new(1, Duration::from_secs(1)).unwrap(), FailingStore);
        let mut lease = hub.acquire("k").await.unwrap();

        let err = lease.record_request(t(1)).await.unwrap_err();
        drop(lease);

        assert!(matches!(
            err,
            GateError::Store { ref reason, .. } if reason == "store unavailable"
        ));
        assert_eq!(hub.snapshot("k").await.unwrap().unwrap().request_count(), 0);
    }

    /// Store whose loads for `slow` take a long time.
    #[derive(Debug, Clone, Default)]
    struct SlowStore {
        inner: InMemoryEntityStore,
    }

    #[async_trait]
    impl EntityStore for SlowStore {
        type Error = std::convert::Infallible;

        async fn load(&self, key: &str) -> Result<Option<RateLimiterState>, Self::Error> {
            if key == "slow" {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            self.inner.load(key).await
        }

        async fn save(&self, key: &str, state: &RateLimiterState) -> Result<(), Self::Error> {
            self.inner.save(key, state).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_restore_does_not_block_other_keys() {
        let limit = Limit::new(1, Duration::from_secs(1)).unwrap();
        let hub = EntityHub::new(limit, SlowStore::default());
        let slow = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.acquire("slow").await.map(|_| ()) })
        };
        tokio::task::yield_now().await;

        let fast = tokio::time::timeout(Duration::from_secs(1), hub.acquire("fast")).await;
        assert!(matches!(fast, Ok(Ok(_))), "unrelated key must not wait for a slow restore");

        slow.await.unwrap().unwrap();
    }

    #[derive(Debug, Clone, Default)]
    struct BrokenLoads;

    #[async_trait]
    impl EntityStore for BrokenLoads {
        type Error = Unavailable;

        async fn load(&self, _key: &str) -> Result<Option<RateLimiterState>, Unavailable> {
            Err(Unavailable)
        }

        async fn save(&self, _key: &str, _state: &RateLimiterState) -> Result<(), Unavailable> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_restore_surfaces_store_error() {
        let hub = EntityHub::new(Limit::new(1, Duration::from_secs(1)).unwrap(), BrokenLoads);

        let err = hub.acquire("k").await.unwrap_err();

        assert!(matches!(
            err,
            GateError::Store { ref reason, .. } if reason == "store unavailable"
        ));
    }
}
