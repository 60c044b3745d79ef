//! Fixed-window decision state for one key.
//!
//! Semantics:
//! - A window opens with the first recorded request and stays open while
//!   `now - window_start <= window`; strictly greater expires it.
//! - Once `max_requests` starts are recorded, [`RateLimiterState::compute_delay`] returns the
//!   time left until the window clears, stacked on top of the delay handed to the previous
//!   deferred contender (carry-over). Successive deferrals therefore wake one after another
//!   instead of all at the end of the window.
//! - Expiry is a reset (no window, zero count, no carry-over), never an error.
//!
//! Invariants:
//! - `request_count == 0` iff `window_start` is `None`.
//! - The carry-over is only cleared by a reset.
//!
//! The state performs no I/O and holds no locks; callers serialize access to it.

use crate::limit::Limit;
use std::time::{Duration, SystemTime};

/// Stacked delays beyond this many windows are logged as suspicious growth.
pub const CARRY_OVER_WARN_WINDOWS: u32 = 32;

/// Mutable limiter state owned by exactly one logical key.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RateLimiterState {
    limit: Limit,
    window_start: Option<SystemTime>,
    request_count: u32,
    last_computed_delay: Option<Duration>,
}

impl RateLimiterState {
    /// Fresh state with no active window.
    pub fn new(limit: Limit) -> Self {
        Self { limit, window_start: None, request_count: 0, last_computed_delay: None }
    }

    /// Rebuild state from persisted parts, e.g. a host snapshot.
    ///
    /// A missing `window_start` forces the count to zero to keep the state consistent.
    pub fn from_parts(
        limit: Limit,
        window_start: Option<SystemTime>,
        request_count: u32,
        last_computed_delay: Option<Duration>,
    ) -> Self {
        let request_count = if window_start.is_some() { request_count } else { 0 };
        Self { limit, window_start, request_count, last_computed_delay }
    }

    pub fn limit(&self) -> Limit {
        self.limit
    }

    /// Start of the current window, if any.
    pub fn window_start(&self) -> Option<SystemTime> {
        self.window_start
    }

    /// Requests recorded since `window_start`.
    pub fn request_count(&self) -> u32 {
        self.request_count
    }

    /// Delay handed to the most recent deferred contender.
    pub fn last_computed_delay(&self) -> Option<Duration> {
        self.last_computed_delay
    }

    /// Whether a request may start at `now` without waiting.
    ///
    /// Resets the state when the window has expired.
    pub fn is_permitted(&mut self, now: SystemTime) -> bool {
        let Some(start) = self.window_start else {
            return true;
        };
        if self.request_count < self.limit.max_requests() {
            return true;
        }
        if self.window_open(start, now) {
            return false;
        }
        self.reset();
        true
    }

    /// How long a contender arriving at `now` must wait before it may start.
    ///
    /// A non-zero result is remembered as the carry-over for the next deferred contender.
    pub fn compute_delay(&mut self, now: SystemTime) -> Duration {
        let Some(start) = self.window_start else {
            return Duration::ZERO;
        };
        if self.request_count < self.limit.max_requests() {
            return Duration::ZERO;
        }
        if !self.window_open(start, now) {
            tracing::trace!(target: "pacegate::state", "window expired; resetting");
            self.reset();
            return Duration::ZERO;
        }

        // a regressed clock yields more than a full window here
        let base = match start.checked_add(self.limit.window()) {
            Some(window_end) => window_end.duration_since(now).unwrap_or(Duration::ZERO),
            // window end not representable: it never clears
            None => Duration::MAX,
        };
        let delay = match self.last_computed_delay {
            Some(carried) => carried.saturating_add(base),
            None => base,
        };

        let warn_at = self.limit.window().saturating_mul(CARRY_OVER_WARN_WINDOWS);
        if delay > warn_at {
            tracing::warn!(
                target: "pacegate::state",
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                window_ms = u64::try_from(self.limit.window().as_millis()).unwrap_or(u64::MAX),
                "carried-over delay exceeds {} windows",
                CARRY_OVER_WARN_WINDOWS
            );
        }

        self.last_computed_delay = Some(delay);
        delay
    }

    /// Record a request starting at `now`.
    ///
    /// Opens a window if none is active. A window whose full span has elapsed by `now` is
    /// replaced by a new one starting at `now`, so a contender that waited out the window
    /// never counts against it.
    pub fn record_request(&mut self, now: SystemTime) {
        if let Some(start) = self.window_start {
            let elapsed = now.duration_since(start).unwrap_or(Duration::ZERO);
            if elapsed >= self.limit.window() {
                self.reset();
            }
        }
        if self.window_start.is_none() {
            self.window_start = Some(now);
        }
        self.request_count = self.request_count.saturating_add(1);
    }

    fn window_open(&self, start: SystemTime, now: SystemTime) -> bool {
        match now.duration_since(start) {
            Ok(diff) => diff <= self.limit.window(),
            // clock went backwards: keep limiting
            Err(_) => true,
        }
    }

    fn reset(&mut self) {
        self.window_start = None;
        self.request_count = 0;
        self.last_computed_delay = None;
    }
}
