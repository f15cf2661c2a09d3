use crate::error::RateLimitError;
use crate::rate_limit::engine::AdmissionEngine;
use crate::rate_limit::identity::IdentityResolver;
use crate::rate_limit::store::BucketStore;
use crate::rate_limit::Decision;
use crate::telemetry::TelemetrySink;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// A layer that puts an [`AdmissionEngine`] in front of a handler.
///
/// Admitted requests reach the inner service untouched. Denied requests
/// short-circuit with [`RateLimitError::Denied`]; turn that into a 429 with
/// [`Denial::into_response`](crate::Denial::into_response).
pub struct RateLimitLayer<S, R, T> {
    engine: Arc<AdmissionEngine<S, R, T>>,
}

impl<S, R, T> Clone for RateLimitLayer<S, R, T> {
    fn clone(&self) -> Self {
        Self { engine: self.engine.clone() }
    }
}

impl<S, R, T> RateLimitLayer<S, R, T> {
    /// Create a new rate limit layer.
    pub fn new(engine: AdmissionEngine<S, R, T>) -> Self {
        Self { engine: Arc::new(engine) }
    }

    /// Share an engine that is also used elsewhere (stats, shutdown).
    pub fn from_shared(engine: Arc<AdmissionEngine<S, R, T>>) -> Self {
        Self { engine }
    }

    /// The engine behind this layer.
    pub fn engine(&self) -> &Arc<AdmissionEngine<S, R, T>> {
        &self.engine
    }
}

impl<I, S, R, T> Layer<I> for RateLimitLayer<S, R, T> {
    type Service = RateLimitService<I, S, R, T>;

    fn layer(&self, service: I) -> Self::Service {
        RateLimitService { inner: service, engine: self.engine.clone() }
    }
}

/// Middleware service that enforces rate limits.
pub struct RateLimitService<I, S, R, T> {
    inner: I,
    engine: Arc<AdmissionEngine<S, R, T>>,
}

impl<I: Clone, S, R, T> Clone for RateLimitService<I, S, R, T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), engine: self.engine.clone() }
    }
}

impl<I, S, R, T, B> Service<http::Request<B>> for RateLimitService<I, S, R, T>
where
    I: Service<http::Request<B>> + Clone + Send + 'static,
    I::Future: Send + 'static,
    S: BucketStore + 'static,
    R: IdentityResolver + 'static,
    T: TelemetrySink,
    T::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = I::Response;
    type Error = RateLimitError<I::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(RateLimitError::Inner)
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let engine = self.engine.clone();
        // Take the service that was driven to readiness, leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let identity = engine.identify(&req);

        Box::pin(async move {
            match engine.check(identity.as_deref()).await {
                Decision::Allowed { .. } => inner.call(req).await.map_err(RateLimitError::Inner),
                Decision::Denied(denial) => Err(RateLimitError::Denied(denial)),
            }
        })
    }
}
