#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # tollgate
//!
//! Distributed token-bucket admission control for async Rust services.
//!
//! Every client identity owns a bucket that refills continuously up to a
//! ceiling; each admitted request debits a fixed cost. Buckets live in a
//! shared key-value store with per-key expiry, so any number of stateless
//! instances enforce one limit. When the store is unreachable the limiter
//! fails open: requests are admitted unmetered rather than refused.
//!
//! ## Features
//!
//! - **Token bucket arithmetic** as pure, clock-injected functions
//! - **Pluggable stores** behind [`BucketStore`]; an in-process double ships here,
//!   Redis lives in the `tollgate-redis` companion crate
//! - **Connection lifecycle** state machine gating store access
//! - **Tower middleware** answering denials with a structured 429 payload
//! - **Telemetry** events through `tower::Service` sinks
//!
//! ## Quick Start
//!
//! ```rust
//! use tollgate::{AdmissionEngine, ConnectionLifecycle, ConnectionState, InMemoryBucketStore, LimiterConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = LimiterConfig::new(1.0, 10.0, 10.0, 3600).unwrap();
//!     let lifecycle = ConnectionLifecycle::starting_in(ConnectionState::Ready);
//!     let engine = AdmissionEngine::new(config, InMemoryBucketStore::default(), lifecycle);
//!
//!     assert!(engine.check(Some("203.0.113.7")).await.is_allowed());
//!     assert!(!engine.check(Some("203.0.113.7")).await.is_allowed());
//! }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod prelude;
pub mod rate_limit;
pub mod telemetry;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, LimiterConfig, LimiterConfigBuilder};
pub use error::{LifecycleError, RateLimitError, StoreError};
pub use lifecycle::{ConnectionEvent, ConnectionLifecycle, ConnectionState};
pub use rate_limit::bucket::{compute_available, retry_after_secs, Bucket};
pub use rate_limit::store::{BucketStore, InMemoryBucketStore};
pub use rate_limit::{
    AdmissionEngine, AllowReason, BucketStats, Decision, Denial, ForwardedForResolver,
    IdentityResolver, PeerAddr, RateLimitLayer, RateLimitService,
};
pub use telemetry::{LimiterEvent, LogSink, MemorySink, NullSink, TelemetrySink};
