//! Per-client token bucket admission control
//!
//! Each client key owns one bucket holding up to `burst` tokens, refilled at
//! `requests_per_second`. A request is admitted when a whole token is
//! available. Buckets live in a sharded [`DashMap`], so a key's
//! lookup-refill-consume runs under that key's shard lock only.

use dashmap::DashMap;
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::Instant};

use crate::config::RateLimitConfig;

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(burst: f64, now: Instant) -> Self {
        Self {
            tokens: burst,
            last_refill: now,
        }
    }

    /// Token count at `now` without touching the bucket
    fn available(&self, now: Instant, rate: f64, burst: f64) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * rate).min(burst)
    }
}

pub struct RateLimiter {
    buckets: DashMap<String, TokenBucket>,
    rate: f64,
    burst: f64,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_rate(config.requests_per_second, config.burst)
    }

    pub fn with_rate(requests_per_second: f64, burst: u32) -> Self {
        Self {
            buckets: DashMap::new(),
            rate: requests_per_second,
            burst: f64::from(burst),
        }
    }

    /// Admit or reject one request from `key`
    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    fn allow_at(&self, key: &str, now: Instant) -> bool {
        if let Some(mut bucket) = self.buckets.get_mut(key) {
            return self.take(&mut bucket, now);
        }
        let mut bucket = self
            .buckets
            .entry(key.to_owned())
            .or_insert_with(|| TokenBucket::full(self.burst, now));
        self.take(&mut bucket, now)
    }

    fn take(&self, bucket: &mut TokenBucket, now: Instant) -> bool {
        let available = bucket.available(now, self.rate, self.burst);
        if available < 1.0 {
            return false;
        }
        bucket.tokens = available - 1.0;
        bucket.last_refill = now.max(bucket.last_refill);
        true
    }

    /// Time until `key` is next admitted; zero when a token is available
    pub fn retry_after(&self, key: &str) -> Duration {
        let now = Instant::now();
        let available = match self.buckets.get(key) {
            Some(bucket) => bucket.available(now, self.rate, self.burst),
            None => return Duration::ZERO,
        };
        if available >= 1.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64((1.0 - available) / self.rate).unwrap_or(Duration::MAX)
        }
    }

    /// Drop buckets that are full again and were last used more than
    /// `idle_for` ago; returns how many were removed.
    pub fn evict_idle(&self, idle_for: Duration) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            now.saturating_duration_since(bucket.last_refill) < idle_for
                || bucket.available(now, self.rate, self.burst) < self.burst
        });
        before.saturating_sub(self.buckets.len())
    }

    /// Number of tracked client keys
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Periodically evict idle buckets
pub fn spawn_idle_eviction(limiter: Arc<RateLimiter>, idle_for: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(idle_for);
        loop {
            interval.tick().await;
            let removed = limiter.evict_idle(idle_for);
            if removed > 0 {
                tracing::debug!(removed, remaining = limiter.len(), "evicted idle rate limit buckets");
            }
        }
    })
}
