//! Admission policy values.
//!
//! A [`Limit`] is validated once at construction and never changes afterwards. A
//! [`LimitTable`] resolves the limit for a key the first time that key is seen.

use std::collections::HashMap;
use std::time::Duration;

/// Errors produced when validating a limit.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LimitError {
    /// `max_requests` must be > 0.
    #[error("max_requests must be > 0 (got {provided})")]
    InvalidMaxRequests {
        /// Value provided by caller.
        provided: u32,
    },
    /// `window` must be > 0.
    #[error("window must be > 0 (got {0:?})")]
    InvalidWindow(Duration),
}

/// At most `max_requests` starts within any `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "LimitRepr", into = "LimitRepr"))]
pub struct Limit {
    max_requests: u32,
    window: Duration,
}

impl Limit {
    /// Create a limit. Fails fast instead of clamping invalid values.
    ///
    /// # Examples
    /// ```
    /// use pacegate::Limit;
    /// use std::time::Duration;
    /// let limit = Limit::new(10, Duration::from_secs(1)).unwrap();
    /// assert_eq!(limit.max_requests(), 10);
    /// assert!(Limit::new(0, Duration::from_secs(1)).is_err());
    /// ```
    pub fn new(max_requests: u32, window: Duration) -> Result<Self, LimitError> {
        if max_requests == 0 {
            return Err(LimitError::InvalidMaxRequests { provided: max_requests });
        }
        if window.is_zero() {
            return Err(LimitError::InvalidWindow(window));
        }
        Ok(Self { max_requests, window })
    }

    /// Maximum starts per window.
    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }
}

#[cfg(feature = "serde")]
#[derive(serde::Serialize, serde::Deserialize)]
struct LimitRepr {
    max_requests: u32,
    window: Duration,
}

#[cfg(feature = "serde")]
impl TryFrom<LimitRepr> for Limit {
    type Error = LimitError;

    fn try_from(repr: LimitRepr) -> Result<Self, Self::Error> {
        Limit::new(repr.max_requests, repr.window)
    }
}

#[cfg(feature = "serde")]
impl From<Limit> for LimitRepr {
    fn from(limit: Limit) -> Self {
        Self { max_requests: limit.max_requests, window: limit.window }
    }
}

/// Default limit plus per-key overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LimitTable {
    default: Limit,
    #[cfg_attr(feature = "serde", serde(default))]
    overrides: HashMap<String, Limit>,
}

impl LimitTable {
    /// Every key uses `default` unless overridden.
    pub fn new(default: Limit) -> Self {
        Self { default, overrides: HashMap::new() }
    }

    /// Use `limit` for `key` instead of the default.
    pub fn with_override(mut self, key: impl Into<String>, limit: Limit) -> Self {
        self.overrides.insert(key.into(), limit);
        self
    }

    /// Resolve the limit for `key`.
    pub fn limit_for(&self, key: &str) -> Limit {
        self.overrides.get(key).copied().unwrap_or(self.default)
    }

    pub fn default_limit(&self) -> Limit {
        self.default
    }
}

impl From<Limit> for LimitTable {
    fn from(limit: Limit) -> Self {
        Self::new(limit)
    }
}
