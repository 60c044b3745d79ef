use crate::state::RateLimiterState;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Abstract storage for entity snapshots.
///
/// Backends decide the on-disk or on-wire format. The entity saves after every mutation and
/// only commits the mutation once `save` succeeds.
#[async_trait]
pub trait EntityStore: Send + Sync + 'static {
    /// Error type for storage operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fetch the last saved state for a key.
    async fn load(&self, key: &str) -> Result<Option<RateLimiterState>, Self::Error>;

    /// Overwrite the saved state for a key.
    async fn save(&self, key: &str, state: &RateLimiterState) -> Result<(), Self::Error>;
}

/// Simple in-memory snapshot store. Clones share the same data.
#[derive(Default, Clone, Debug)]
pub struct InMemoryEntityStore {
    data: Arc<Mutex<HashMap<String, RateLimiterState>>>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    type Error = std::convert::Infallible;

    async fn load(&self, key: &str) -> Result<Option<RateLimiterState>, Self::Error> {
        let guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.get(key).cloned())
    }

    async fn save(&self, key: &str, state: &RateLimiterState) -> Result<(), Self::Error> {
        let mut guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        guard.insert(key.to_string(), state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limit::Limit;
    use std::time::{Duration, UNIX_EPOCH};

    #[tokio::test]
    async fn saves_and_loads_per_key() {
        let store = InMemoryEntityStore::new();
        let mut state = RateLimiterState::new(Limit::new(2, Duration::from_secs(1)).unwrap());
        state.record_request(UNIX_EPOCH + Duration::from_secs(1));

        store.save("a", &state).await.unwrap();

        assert_eq!(store.load("a").await.unwrap(), Some(state));
        assert_eq!(store.load("b").await.unwrap(), None);
    }
}
