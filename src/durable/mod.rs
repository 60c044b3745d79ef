//! Durable shape: limiter state owned by one serialized worker per key.
//!
//! Contenders talk to the worker by message passing. Acquiring the gate means asking the
//! worker for its lock; the worker grants leases in arrival order and evaluates
//! `compute_delay`/`record_request` only for the current holder. Every mutation is saved
//! through an [`EntityStore`] before it is committed, so a restarted worker resumes from the
//! last saved state.
//!
//! Pair [`EntityHub`] with [`crate::host::TimerSleeper`] to suspend through the host's
//! replay-safe timers.

mod entity;
mod store;

pub use entity::{EntityHub, EntityLease};
pub use store::{EntityStore, InMemoryEntityStore};
