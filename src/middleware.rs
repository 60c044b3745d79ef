//! Tower middleware that paces calls per key.
//!
//! Each request is mapped to a key; the inner service is called as the action of
//! [`RateLimitedExecutor::execute`] (or `try_execute` when deferrals should be rejected).

use crate::error::PacingError;
use crate::executor::RateLimitedExecutor;
use crate::gate::SerializationGate;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// What to do with a request whose key is over its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnDeferral {
    /// Suspend the request until it is admitted.
    #[default]
    Wait,
    /// Fail fast with [`PacingError::Deferred`].
    Reject,
}

/// A layer that paces requests through a [`RateLimitedExecutor`].
pub struct PacingLayer<G, K> {
    executor: RateLimitedExecutor<G>,
    key_fn: Arc<K>,
    on_deferral: OnDeferral,
}

impl<G, K> PacingLayer<G, K> {
    /// `key_fn` picks the limiter key for each request.
    pub fn new(executor: RateLimitedExecutor<G>, key_fn: K) -> Self {
        Self { executor, key_fn: Arc::new(key_fn), on_deferral: OnDeferral::Wait }
    }

    /// Reject deferred requests instead of waiting.
    pub fn on_deferral(mut self, on_deferral: OnDeferral) -> Self {
        self.on_deferral = on_deferral;
        self
    }
}

impl<G, K> Clone for PacingLayer<G, K> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            key_fn: self.key_fn.clone(),
            on_deferral: self.on_deferral,
        }
    }
}

impl<S, G, K> Layer<S> for PacingLayer<G, K> {
    type Service = PacingService<S, G, K>;

    fn layer(&self, service: S) -> Self::Service {
        PacingService {
            inner: service,
            executor: self.executor.clone(),
            key_fn: self.key_fn.clone(),
            on_deferral: self.on_deferral,
        }
    }
}

/// Middleware service produced by [`PacingLayer`].
pub struct PacingService<S, G, K> {
    inner: S,
    executor: RateLimitedExecutor<G>,
    key_fn: Arc<K>,
    on_deferral: OnDeferral,
}

impl<S: Clone, G, K> Clone for PacingService<S, G, K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            executor: self.executor.clone(),
            key_fn: self.key_fn.clone(),
            on_deferral: self.on_deferral,
        }
    }
}

impl<S, G, K, Req> Service<Req> for PacingService<S, G, K>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Response: Send,
    S::Error: Send,
    S::Future: Send + 'static,
    G: SerializationGate,
    K: Fn(&Req) -> String + Send + Sync + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = PacingError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(PacingError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let key = (self.key_fn)(&req);
        let executor = self.executor.clone();
        // The clone may not be ready; swap so the driven instance is the one that was polled.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let on_deferral = self.on_deferral;

        Box::pin(async move {
            let action = move || inner.call(req);
            match on_deferral {
                OnDeferral::Wait => executor.execute(&key, action).await,
                OnDeferral::Reject => executor.try_execute(&key, action).await,
            }
        })
    }
}
