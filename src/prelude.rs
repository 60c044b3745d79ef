//! Convenient re-exports for common pacegate types.
pub use crate::{
    executor::{ActionScope, ExecutorBuilder, RateLimitedExecutor},
    gate::{KeyedGate, LimiterSession, SerializationGate},
    limit::{Limit, LimitError, LimitTable},
    middleware::{OnDeferral, PacingLayer},
    BlockingExecutor, EntityHub, GateError, PacingError,
};
