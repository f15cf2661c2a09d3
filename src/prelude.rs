//! Convenience re-exports for hosts wiring the limiter into a service stack.
pub use crate::{
    AdmissionEngine, BucketStore, ConnectionEvent, ConnectionLifecycle, ConnectionState,
    Decision, Denial, ForwardedForResolver, LimiterConfig, PeerAddr, RateLimitError,
    RateLimitLayer,
};
