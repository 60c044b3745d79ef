//! Error types for the admission gate
use std::fmt;
use std::time::Duration;

/// Failures of the gate itself (acquisition, entity messaging, persistence).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    /// The worker owning the key's state has stopped.
    #[error("limiter entity '{key}' is not running")]
    EntityClosed {
        /// Key whose entity could not be reached.
        key: String,
    },
    /// An operation was sent with a lease that does not hold the entity lock.
    #[error("lease {lease} does not hold the lock for '{key}'")]
    LeaseNotHeld {
        /// Key of the entity.
        key: String,
        /// Lease identifier presented by the caller.
        lease: u64,
    },
    /// Persisting or restoring the key's state failed.
    #[error("state store failed for '{key}': {reason}")]
    Store {
        /// Key whose state could not be persisted.
        key: String,
        /// Backend error message.
        reason: String,
    },
}

/// Unified error type for rate-limited execution.
#[derive(Debug, Clone)]
pub enum PacingError<E> {
    /// Not admitted now; the caller may retry after `retry_after`.
    Deferred { retry_after: Duration },
    /// The gate could not evaluate the request.
    Gate(GateError),
    /// The wrapped action failed. The request was already recorded.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for PacingError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deferred { retry_after } => {
                write!(f, "request deferred; retry after {:?}", retry_after)
            }
            Self::Gate(e) => write!(f, "rate limiter unavailable: {}", e),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for PacingError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Gate(e) => Some(e),
            Self::Deferred { .. } => None,
        }
    }
}

impl<E> From<GateError> for PacingError<E> {
    fn from(e: GateError) -> Self {
        Self::Gate(e)
    }
}

impl<E> PacingError<E> {
    /// Check if the request was deferred rather than executed.
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred { .. })
    }
    /// Check if the gate itself failed.
    pub fn is_gate(&self) -> bool {
        matches!(self, Self::Gate(_))
    }
    /// Check if this error wraps an action failure.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }
    /// Suggested wait for a deferred request.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Deferred { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::io;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct DummyError(&'static str);
    impl fmt::Display for DummyError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }
    impl std::error::Error for DummyError {}

    #[test]
    fn deferred_display_and_accessors() {
        let err: PacingError<io::Error> =
            PacingError::Deferred { retry_after: Duration::from_millis(1500) };
        let msg = format!("{}", err);
        assert!(msg.contains("deferred"));
        assert!(msg.contains("1.5"));
        assert!(err.is_deferred());
        assert_eq!(err.retry_after(), Some(Duration::from_millis(1500)));
        assert!(err.source().is_none());
    }

    #[test]
    fn gate_error_is_source() {
        let err: PacingError<DummyError> =
            GateError::EntityClosed { key: "orders".into() }.into();
        assert!(err.is_gate());
        assert!(err.to_string().contains("orders"));
        assert!(err.source().unwrap().to_string().contains("not running"));
    }

    #[test]
    fn inner_passes_through_unchanged() {
        let err = PacingError::Inner(DummyError("boom"));
        assert_eq!(err.to_string(), "boom");
        assert_eq!(err.as_inner(), Some(&DummyError("boom")));
        assert!(err.retry_after().is_none());
        assert_eq!(err.into_inner(), Some(DummyError("boom")));
    }

    #[test]
    fn store_error_mentions_reason() {
        let err = GateError::Store { key: "k".into(), reason: "disk full".into() };
        assert!(err.to_string().contains("disk full"));
    }
}
