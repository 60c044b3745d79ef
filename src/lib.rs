#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # pacegate
//!
//! Fixed-window admission control for outbound calls: at most `max_requests` starts per
//! `window` for each key, with contenders over the limit deferred rather than rejected.
//!
//! ## Features
//!
//! - **Carry-over deferral**: successive contenders in a full window are pushed back by
//!   growing amounts instead of waking together at the window boundary
//! - **Serialized decisions** per key through a [`SerializationGate`]
//! - **Two shapes**: an in-process [`KeyedGate`] and a durable [`EntityHub`] whose state
//!   survives restarts through an [`EntityStore`]
//! - **Host-aware timing**: time, timers and replay detection can come from a workflow host
//! - **Blocking executor** for callers without an async runtime
//! - **Tower middleware** pacing requests by an extracted key
//!
//! ## Quick Start
//!
//! ```rust
//! use pacegate::{KeyedGate, Limit, RateLimitedExecutor};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let limit = Limit::new(2, Duration::from_secs(1)).unwrap();
//!     let executor = RateLimitedExecutor::builder(KeyedGate::new(limit)).build();
//!
//!     let result = executor
//!         .execute("geocoder", || async {
//!             // Your async call here
//!             Ok::<_, std::io::Error>(())
//!         })
//!         .await;
//!     assert!(result.is_ok());
//! }
//! ```

pub mod blocking;
pub mod clock;
pub mod durable;
pub mod error;
pub mod executor;
pub mod gate;
pub mod host;
pub mod limit;
pub mod middleware;
pub mod prelude;
pub mod request_log;
pub mod sleeper;
pub mod state;

// Re-exports
pub use blocking::BlockingExecutor;
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use durable::{EntityHub, EntityLease, EntityStore, InMemoryEntityStore};
pub use error::{GateError, PacingError};
pub use executor::{ActionScope, ExecutorBuilder, RateLimitedExecutor};
pub use gate::{KeyedGate, LimiterSession, LocalSession, SerializationGate};
pub use host::{HostClock, HostContext, LiveHost, NeverReplaying, ReplayDetector, TimerSleeper};
pub use limit::{Limit, LimitError, LimitTable};
pub use middleware::{OnDeferral, PacingLayer, PacingService};
pub use request_log::RequestLog;
pub use sleeper::{
    BlockingSleeper, InstantSleeper, Sleeper, ThreadSleeper, TokioSleeper, TrackingSleeper,
};
pub use state::{RateLimiterState, CARRY_OVER_WARN_WINDOWS};
