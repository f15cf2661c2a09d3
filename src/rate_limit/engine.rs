use crate::clock::{Clock, SystemClock};
use crate::config::LimiterConfig;
use crate::error::StoreError;
use crate::lifecycle::ConnectionLifecycle;
use crate::rate_limit::bucket::{compute_available, retry_after_secs, round2, Bucket};
use crate::rate_limit::identity::{ForwardedForResolver, IdentityResolver};
use crate::rate_limit::store::BucketStore;
use crate::rate_limit::{AllowReason, Decision, Denial, DENIAL_MESSAGE};
use crate::telemetry::{emit_best_effort, FailOpenCause, LimiterEvent, NullSink, StoreOp, TelemetrySink};
use serde::Serialize;
use std::sync::Arc;

/// Read-only view of one client's bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketStats {
    pub identity: String,
    /// Tokens available right now (refill applied, nothing debited).
    pub tokens: f64,
    pub max_tokens: f64,
    pub refill_rate_per_second: f64,
    pub cost_per_request: f64,
    /// Anchor of the stored snapshot, or now for a client with no record.
    pub last_refill_millis: u64,
}

/// Token-bucket admission control over a shared [`BucketStore`].
///
/// Each check is resolve → availability gate → read → refill → decide →
/// write. Every failure on the way degrades to admitting the request; the
/// engine never returns an error to the request path.
///
/// The read-modify-write is **not atomic**. Two concurrent checks for the same
/// identity can read the same snapshot and both debit it, so under contention
/// the limit is soft. Stores that can run the check-and-debit server-side
/// would close the gap; none is required here.
pub struct AdmissionEngine<S, R = ForwardedForResolver, T = NullSink> {
    config: LimiterConfig,
    store: Arc<S>,
    resolver: R,
    lifecycle: ConnectionLifecycle<T>,
    clock: Arc<dyn Clock>,
    sink: T,
}

impl<S, R, T> std::fmt::Debug for AdmissionEngine<S, R, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionEngine")
            .field("config", &self.config)
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}

impl<S> AdmissionEngine<S>
where
    S: BucketStore,
{
    /// Create an engine with the default resolver, wall clock and no telemetry.
    ///
    /// `lifecycle` must be the same handle (or a clone of it) that the store
    /// adapter reports connection events to.
    pub fn new<L>(config: LimiterConfig, store: S, lifecycle: ConnectionLifecycle<L>) -> Self {
        Self {
            config,
            store: Arc::new(store),
            resolver: ForwardedForResolver::default(),
            lifecycle: lifecycle.with_sink(NullSink),
            clock: Arc::new(SystemClock),
            sink: NullSink,
        }
    }
}

impl<S, R, T> AdmissionEngine<S, R, T>
where
    S: BucketStore,
    R: IdentityResolver,
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Use another identity resolver.
    pub fn with_resolver<R2: IdentityResolver>(self, resolver: R2) -> AdmissionEngine<S, R2, T> {
        AdmissionEngine {
            config: self.config,
            store: self.store,
            resolver,
            lifecycle: self.lifecycle,
            clock: self.clock,
            sink: self.sink,
        }
    }

    /// Send decisions, store faults and shutdown transitions to `sink`.
    pub fn with_sink<T2>(self, sink: T2) -> AdmissionEngine<S, R, T2>
    where
        T2: TelemetrySink,
    {
        AdmissionEngine {
            config: self.config,
            store: self.store,
            resolver: self.resolver,
            lifecycle: self.lifecycle.with_sink(sink.clone()),
            clock: self.clock,
            sink,
        }
    }

    /// The policy this engine enforces.
    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// The connection lifecycle gating store access.
    pub fn lifecycle(&self) -> &ConnectionLifecycle<T> {
        &self.lifecycle
    }

    /// The rate-limit identity of `request`, if any.
    pub fn identify<B>(&self, request: &http::Request<B>) -> Option<String> {
        self.resolver.resolve(request)
    }

    /// Resolve the request's identity and [`check`](Self::check) it.
    pub async fn admit<B>(&self, request: &http::Request<B>) -> Decision {
        let identity = self.identify(request);
        self.check(identity.as_deref()).await
    }

    /// Decide whether one request from `identity` may proceed.
    pub async fn check(&self, identity: Option<&str>) -> Decision {
        let Some(identity) = identity else {
            tracing::debug!("no client identity; admitting unmetered");
            self.emit(LimiterEvent::FailOpen { cause: FailOpenCause::Unidentified }).await;
            return Decision::Allowed { remaining: None, reason: AllowReason::Unidentified };
        };

        if !self.lifecycle.is_available() {
            tracing::warn!(
                identity,
                state = %self.lifecycle.state(),
                "rate-limit store unavailable; admitting unmetered"
            );
            self.emit(LimiterEvent::FailOpen { cause: FailOpenCause::StoreUnavailable }).await;
            return Decision::Allowed { remaining: None, reason: AllowReason::StoreUnavailable };
        }

        let key = self.config.key_for(identity);
        let now = self.clock.now_millis();
        let stored = self.read(&key).await;
        let current = compute_available(stored.as_ref(), now, &self.config);
        let cost = self.config.cost_per_request();

        if current.tokens >= cost {
            let remaining = current.tokens - cost;
            self.write(&key, Bucket { tokens: remaining, last_refill_millis: now }).await;
            tracing::debug!(key = %key, remaining, "rate limit check passed");
            self.emit(LimiterEvent::Admitted { identity: identity.to_string(), remaining }).await;
            Decision::Allowed { remaining: Some(remaining), reason: AllowReason::Metered }
        } else {
            // Keep the refilled count but move the anchor, so the next read
            // does not refill the same interval twice.
            self.write(&key, Bucket { tokens: current.tokens, last_refill_millis: now }).await;
            let denial = Denial {
                message: DENIAL_MESSAGE.to_string(),
                retry_after_secs: retry_after_secs(current.tokens, &self.config),
                available_tokens: round2(current.tokens),
                required_tokens: cost,
            };
            tracing::debug!(
                key = %key,
                available = current.tokens,
                retry_after = denial.retry_after_secs,
                "rate limit exceeded"
            );
            self.emit(LimiterEvent::Denied {
                identity: identity.to_string(),
                available: current.tokens,
                retry_after_secs: denial.retry_after_secs,
            })
            .await;
            Decision::Denied(denial)
        }
    }

    /// Current state of `identity`'s bucket, without writing anything.
    ///
    /// `None` when the store is unavailable or the read fails; a client with
    /// no record reports a full bucket.
    pub async fn stats(&self, identity: &str) -> Option<BucketStats> {
        if !self.lifecycle.is_available() {
            return None;
        }
        let key = self.config.key_for(identity);
        let stored = match self.try_read(&key).await {
            Ok(stored) => stored,
            Err(StoreError::Malformed(_)) => None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "bucket stats read failed");
                return None;
            }
        };
        let now = self.clock.now_millis();
        let current = compute_available(stored.as_ref(), now, &self.config);
        Some(BucketStats {
            identity: identity.to_string(),
            tokens: current.tokens,
            max_tokens: self.config.max_tokens(),
            refill_rate_per_second: self.config.refill_rate_per_second(),
            cost_per_request: self.config.cost_per_request(),
            last_refill_millis: current.last_refill_millis,
        })
    }

    /// Close the store connection if it is ready. Safe to call repeatedly.
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        self.lifecycle.shutdown(&*self.store).await
    }

    async fn try_read(&self, key: &str) -> Result<Option<Bucket>, StoreError> {
        let timeout = self.config.store_timeout();
        match tokio::time::timeout(timeout, self.store.get(key)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(timeout)),
        }
    }

    async fn read(&self, key: &str) -> Option<Bucket> {
        match self.try_read(key).await {
            Ok(stored) => stored,
            Err(e) => {
                match &e {
                    StoreError::Malformed(_) => {
                        tracing::warn!(key = %key, error = %e, "discarding malformed bucket record")
                    }
                    _ => tracing::warn!(key = %key, error = %e, "bucket read failed; using fresh bucket"),
                }
                self.emit(LimiterEvent::StoreFault { op: StoreOp::Get, error: e.to_string() }).await;
                None
            }
        }
    }

    async fn write(&self, key: &str, bucket: Bucket) {
        let timeout = self.config.store_timeout();
        let ttl = self.config.record_ttl_secs();
        let result = match tokio::time::timeout(timeout, self.store.set(key, &bucket, ttl)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(timeout)),
        };
        if let Err(e) = result {
            tracing::warn!(key = %key, error = %e, "failed to save bucket state");
            self.emit(LimiterEvent::StoreFault { op: StoreOp::Set, error: e.to_string() }).await;
        }
    }

    async fn emit(&self, event: LimiterEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }
}
