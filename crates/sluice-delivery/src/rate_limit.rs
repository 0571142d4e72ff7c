//! Per-endpoint token-bucket rate limiting.
//!
//! Buckets are shared mutable state across delivery workers, held behind a
//! single async mutex and updated atomically per decision. A dispatch that
//! would exceed the configured rate is deferred (the worker re-schedules the
//! delivery for when the next token lands), never dropped. The limiter is an
//! explicit handle injected into the engine, not ambient global state.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use sluice_core::{models::RateLimitConfig, time::Clock};
use tokio::sync::Mutex;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// A token was taken; dispatch may proceed.
    Allowed,

    /// Bucket exhausted; defer dispatch for at least this long.
    Deferred(Duration),
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: DateTime<Utc>,
}

/// Token-bucket rate limiter keyed per endpoint (or subscription).
#[derive(Debug)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Creates an empty limiter.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { buckets: Mutex::new(HashMap::new()), clock }
    }

    /// Takes a token for `key`, or reports how long to defer.
    ///
    /// Buckets start full, refill continuously at `count / duration`, and
    /// cap at `count` so an idle endpoint can absorb a burst up to its
    /// configured window.
    pub async fn try_acquire(&self, key: &str, config: &RateLimitConfig) -> RateDecision {
        let now = self.clock.now();
        let capacity = f64::from(config.count);
        let refill_per_sec = capacity / config.duration.as_secs_f64();

        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket { tokens: capacity, last_refill: now });

        let elapsed = (now - bucket.last_refill).to_std().unwrap_or(Duration::ZERO);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * refill_per_sec).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            RateDecision::Allowed
        } else {
            let deficit = 1.0 - bucket.tokens;
            RateDecision::Deferred(Duration::from_secs_f64(deficit / refill_per_sec))
        }
    }
}
