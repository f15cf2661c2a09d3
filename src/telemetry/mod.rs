//! Telemetry for the limiter.
//!
//! The engine and the connection lifecycle emit [`LimiterEvent`]s through a
//! `TelemetrySink`, which is a `tower::Service<LimiterEvent>` so sinks compose
//! like any other service. Emission is best-effort: a failing sink never
//! affects an admission decision.

pub mod events;
pub mod sinks;

pub use events::{FailOpenCause, LimiterEvent, StoreOp};
pub use sinks::{emit_best_effort, LogSink, MemorySink, NullSink, TelemetrySink};
