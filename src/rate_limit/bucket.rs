//! Token-bucket arithmetic.
//!
//! Pure functions over a [`Bucket`] snapshot and the current instant. Nothing in
//! here performs I/O or fails; the admission engine owns reading and writing.

use crate::config::LimiterConfig;
use serde::{Deserialize, Serialize};

/// Rate-limit state for one client identity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    /// Available tokens, `0 <= tokens <= max_tokens`.
    pub tokens: f64,
    /// Instant (epoch millis) at which `tokens` was last valid.
    pub last_refill_millis: u64,
}

impl Bucket {
    /// The bucket a never-seen (or expired) client starts with.
    pub fn full(config: &LimiterConfig, now_millis: u64) -> Self {
        Self { tokens: config.max_tokens(), last_refill_millis: now_millis }
    }
}

/// Refill `previous` up to `now_millis`.
///
/// An absent bucket materializes full and anchored at `now_millis`. Otherwise
/// the elapsed time (never negative, so a clock that stepped backwards refills
/// nothing) is converted to tokens and clamped at the ceiling. The anchor is
/// passed through unchanged; only a write moves it.
pub fn compute_available(previous: Option<&Bucket>, now_millis: u64, config: &LimiterConfig) -> Bucket {
    let Some(bucket) = previous else {
        return Bucket::full(config, now_millis);
    };

    let max = config.max_tokens();
    let stored = if bucket.tokens.is_finite() { bucket.tokens.clamp(0.0, max) } else { 0.0 };
    let elapsed_secs = now_millis.saturating_sub(bucket.last_refill_millis) as f64 / 1_000.0;
    let tokens = (stored + elapsed_secs * config.refill_rate_per_second()).min(max);

    Bucket { tokens, last_refill_millis: bucket.last_refill_millis }
}

/// Whole seconds until `tokens` refills to the per-request cost.
///
/// A hint only: another request debiting the same bucket in the meantime
/// invalidates it.
pub fn retry_after_secs(tokens: f64, config: &LimiterConfig) -> u64 {
    let needed = config.cost_per_request() - tokens;
    if needed <= 0.0 {
        return 0;
    }
    (needed / config.refill_rate_per_second()).ceil() as u64
}

/// Round to two decimals for reporting.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
