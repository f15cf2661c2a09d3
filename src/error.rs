//! Error types for the limiter, its store and the middleware.
use crate::lifecycle::{ConnectionEvent, ConnectionState};
use crate::rate_limit::Denial;
use std::time::Duration;

/// Failure of a single store round-trip.
///
/// None of these reach the request path: the engine logs them and carries on
/// as if the read found nothing or the write never happened.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The backing store is not connected (or was closed).
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The call did not complete within the configured bound.
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    /// The stored record could not be decoded into a bucket.
    #[error("malformed bucket record: {0}")]
    Malformed(String),
    /// Any other backend error.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// True when the error says the connection itself is gone, as opposed to
    /// one bad call or one bad record.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// A lifecycle event that is not legal in the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("connection event {event:?} is not valid in state {from:?}")]
    InvalidTransition {
        /// State the manager was in.
        from: ConnectionState,
        /// Event that was rejected.
        event: ConnectionEvent,
    },
    /// The lifecycle was shut down; only `Error` and `End` are accepted.
    #[error("connection event {event:?} arrived after shutdown")]
    ShutDown {
        /// Event that was rejected.
        event: ConnectionEvent,
    },
}

/// Error returned by [`RateLimitService`](crate::RateLimitService).
#[derive(Debug, Clone, thiserror::Error)]
pub enum RateLimitError<E> {
    /// The request was refused; the denial carries the 429 payload.
    #[error("rate limited: retry after {}s", .0.retry_after_secs)]
    Denied(Denial),
    /// The inner service failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> RateLimitError<E> {
    /// Check if this error is a rate-limit denial.
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied(_))
    }

    /// Borrow the denial if present.
    pub fn denial(&self) -> Option<&Denial> {
        match self {
            Self::Denied(d) => Some(d),
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
}
