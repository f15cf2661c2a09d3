use crate::lifecycle::ConnectionState;
use std::fmt;

/// Events emitted by the admission engine and the connection lifecycle.
///
/// Events describe what the limiter decided and why, so they can be logged,
/// counted, or forwarded to an external system through a
/// [`TelemetrySink`](super::TelemetrySink).
#[derive(Debug, Clone, PartialEq)]
pub enum LimiterEvent {
    /// A metered request was admitted.
    Admitted {
        /// Client identity.
        identity: String,
        /// Tokens left after the debit.
        remaining: f64,
    },
    /// A metered request was refused.
    Denied {
        /// Client identity.
        identity: String,
        /// Tokens available at decision time.
        available: f64,
        /// Seconds until the cost is covered again.
        retry_after_secs: u64,
    },
    /// A request was admitted without metering.
    FailOpen {
        /// Why metering was skipped.
        cause: FailOpenCause,
    },
    /// A single store call failed; the engine carried on without it.
    StoreFault {
        /// Which call failed.
        op: StoreOp,
        /// Error text.
        error: String,
    },
    /// The store connection changed state.
    Connection {
        /// Previous state.
        from: ConnectionState,
        /// New state.
        to: ConnectionState,
    },
}

/// Reasons a request bypassed the bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOpenCause {
    /// Neither a forwarding header nor a peer address was present.
    Unidentified,
    /// The store connection is not `Ready`.
    StoreUnavailable,
}

/// Store call kinds, for fault reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Get,
    Set,
}

impl fmt::Display for LimiterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimiterEvent::Admitted { identity, remaining } => {
                write!(f, "Admitted({}, remaining={:.2})", identity, remaining)
            }
            LimiterEvent::Denied { identity, available, retry_after_secs } => write!(
                f,
                "Denied({}, available={:.2}, retry_after={}s)",
                identity, available, retry_after_secs
            ),
            LimiterEvent::FailOpen { cause } => write!(f, "FailOpen({})", cause),
            LimiterEvent::StoreFault { op, error } => write!(f, "StoreFault({}: {})", op, error),
            LimiterEvent::Connection { from, to } => write!(f, "Connection({} -> {})", from, to),
        }
    }
}

impl fmt::Display for FailOpenCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailOpenCause::Unidentified => f.write_str("unidentified"),
            FailOpenCause::StoreUnavailable => f.write_str("store_unavailable"),
        }
    }
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreOp::Get => f.write_str("get"),
            StoreOp::Set => f.write_str("set"),
        }
    }
}
