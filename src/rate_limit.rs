//! Rate limiting primitives.
//!
//! This module provides the building blocks for per-client admission control:
//! - [`AdmissionEngine`]: resolves the client, reads its bucket, decides, writes back.
//! - [`RateLimitLayer`]: Tower middleware that enforces the decision in front of a handler.
//! - [`Decision`]: The result of a check (Allowed/Denied).
//!
//! # Architecture
//!
//! - **Middleware**: `RateLimitLayer` wraps your service. It doesn't know *how* limiting works,
//!   only that it should ask an `AdmissionEngine`.
//! - **Logic**: the `bucket` module holds the token-bucket math as pure functions.
//! - **Identity**: an `IdentityResolver` turns a request into the bucket key.
//! - **Storage**: `BucketStore` (in `store` module) holds the state, enabling
//!   in-memory or distributed backends (e.g., Redis via `tollgate-redis`).

use serde::Serialize;

pub mod bucket;
pub mod engine;
pub mod identity;
pub mod middleware;
pub mod store;

pub use engine::{AdmissionEngine, BucketStats};
pub use identity::{ForwardedForResolver, IdentityResolver, PeerAddr};
pub use middleware::{RateLimitLayer, RateLimitService};

/// Human-readable message carried by every denial.
pub const DENIAL_MESSAGE: &str = "Too many requests, please try again later.";

/// The decision returned by the admission engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The request is allowed to proceed.
    Allowed {
        /// Tokens left after this admission; `None` when the request was not
        /// metered.
        remaining: Option<f64>,
        /// Why the request went through.
        reason: AllowReason,
    },
    /// The request is denied.
    Denied(Denial),
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    /// Borrow the denial, if any.
    pub fn denial(&self) -> Option<&Denial> {
        match self {
            Decision::Denied(d) => Some(d),
            Decision::Allowed { .. } => None,
        }
    }
}

/// Why a request was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowReason {
    /// The bucket covered the cost.
    Metered,
    /// No identity could be derived from the request.
    Unidentified,
    /// The store is not usable; fail-open.
    StoreUnavailable,
}

/// Payload of a "Too Many Requests" answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Denial {
    /// Human-readable explanation.
    pub message: String,
    /// Seconds until the bucket covers the cost again, absent other traffic.
    #[serde(rename = "retryAfterSeconds")]
    pub retry_after_secs: u64,
    /// Tokens available at decision time, rounded to 2 decimals.
    pub available_tokens: f64,
    /// Tokens one request costs.
    pub required_tokens: f64,
}

#[derive(Serialize)]
struct DenialBody<'a> {
    error: &'static str,
    #[serde(flatten)]
    denial: &'a Denial,
}

impl Denial {
    /// JSON body of the 429 response.
    pub fn to_body(&self) -> String {
        let body = DenialBody { error: "Too Many Requests", denial: self };
        // Serializing plain strings and numbers cannot fail.
        serde_json::to_string(&body).unwrap_or_default()
    }

    /// Build the 429 response: `Retry-After` header plus the JSON body.
    pub fn into_response<B>(self) -> http::Response<B>
    where
        B: From<String>,
    {
        let mut response = http::Response::new(B::from(self.to_body()));
        *response.status_mut() = http::StatusCode::TOO_MANY_REQUESTS;
        let headers = response.headers_mut();
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );
        headers.insert(http::header::RETRY_AFTER, http::HeaderValue::from(self.retry_after_secs));
        response
    }
}
