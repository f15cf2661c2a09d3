use super::events::{FailOpenCause, LimiterEvent};
use crate::lifecycle::ConnectionState;
use futures::future::{ready, Ready};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tower::Service;

/// Where the engine and the lifecycle send [`LimiterEvent`]s.
///
/// Any cloneable `tower::Service<LimiterEvent>` qualifies, so sinks can be
/// wrapped in tower middleware (buffering, timeouts) like any other service.
pub trait TelemetrySink:
    tower::Service<LimiterEvent, Response = (), Error = Self::SinkError>
    + Clone
    + Send
    + Sync
    + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Deliver `event` to `sink`, ignoring a sink that is not ready or fails.
///
/// Admission never waits on telemetry beyond the sink's own readiness.
pub async fn emit_best_effort<S>(sink: S, event: LimiterEvent)
where
    S: tower::Service<LimiterEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Discards every event. The default for engines and lifecycles.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl Service<LimiterEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: LimiterEvent) -> Self::Future {
        ready(Ok(()))
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Writes each event as a structured `tracing` record under the
/// `tollgate::events` target.
///
/// Admissions go out at `debug` since there is one per request; denials and
/// reconnects at `info`; anything that turns metering off (fail-open, store
/// faults, losing the connection) at `warn`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl Service<LimiterEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimiterEvent) -> Self::Future {
        match event {
            LimiterEvent::Admitted { identity, remaining } => {
                tracing::debug!(target: "tollgate::events", %identity, remaining, "admitted");
            }
            LimiterEvent::Denied { identity, available, retry_after_secs } => {
                tracing::info!(
                    target: "tollgate::events",
                    %identity,
                    available,
                    retry_after_secs,
                    "denied"
                );
            }
            LimiterEvent::FailOpen { cause } => {
                tracing::warn!(target: "tollgate::events", %cause, "admitted unmetered");
            }
            LimiterEvent::StoreFault { op, error } => {
                tracing::warn!(target: "tollgate::events", %op, %error, "store call failed");
            }
            LimiterEvent::Connection { from, to: ConnectionState::Disconnected } => {
                tracing::warn!(target: "tollgate::events", %from, "store connection lost");
            }
            LimiterEvent::Connection { from, to } => {
                tracing::info!(target: "tollgate::events", %from, %to, "store connection changed");
            }
        }
        ready(Ok(()))
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Keeps the most recent events in memory, dropping the oldest past
/// `capacity`. Handy in tests and for exposing recent decisions on a
/// debug endpoint.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<LimiterEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1_024)))),
            capacity,
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<LimiterEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the retained events, oldest first.
    pub fn events(&self) -> Vec<LimiterEvent> {
        self.lock().iter().cloned().collect()
    }

    /// Retained denials.
    pub fn denials(&self) -> usize {
        self.lock().iter().filter(|e| matches!(e, LimiterEvent::Denied { .. })).count()
    }

    /// Retained unmetered admissions with the given cause.
    pub fn fail_opens(&self, cause: FailOpenCause) -> usize {
        self.lock()
            .iter()
            .filter(|e| matches!(e, LimiterEvent::FailOpen { cause: c } if *c == cause))
            .count()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events dropped to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<LimiterEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimiterEvent) -> Self::Future {
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            guard.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(event);
        ready(Ok(()))
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}
