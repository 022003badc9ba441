use std::{collections::HashMap, sync::Arc};

use arbflow_helpers::time::Clock;
use tracing::debug;

/// Configuration for the per-stream token buckets.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// The bucket capacity; new streams start full.
    pub max_tokens: u64,
    /// The period over which a full bucket's worth of tokens
    /// is replenished.
    pub refill_period_ms: u64,
    /// The number of tokens deducted per admitted message.
    pub tokens_per_message: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        RateLimiterConfig {
            max_tokens: 100,
            refill_period_ms: 1_000,
            tokens_per_message: 1,
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: u64,
    last_refill: u64,
}

/// A token-bucket rate limiter with one lazily-created bucket per
/// stream. Buckets refill in whole-period steps so that a burst of
/// checks inside one period draws from a fixed budget.
pub struct TokenBucketRateLimiter {
    buckets: HashMap<String, TokenBucket>,
    config: RateLimiterConfig,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl TokenBucketRateLimiter {
    pub fn new(config: RateLimiterConfig, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        TokenBucketRateLimiter {
            buckets: HashMap::new(),
            config,
            clock,
        }
    }

    /// Checks whether a message on `stream` may be admitted,
    /// deducting tokens when it is.
    pub fn check(&mut self, stream: &str) -> bool {
        let now = self.clock.now_ms();
        let config = &self.config;

        let bucket = self
            .buckets
            .entry(stream.to_string())
            .or_insert_with(|| TokenBucket {
                tokens: config.max_tokens,
                last_refill: now,
            });

        let elapsed = now.saturating_sub(bucket.last_refill);
        if elapsed >= config.refill_period_ms {
            let refilled = elapsed / config.refill_period_ms * config.max_tokens;
            bucket.tokens = (bucket.tokens + refilled).min(config.max_tokens);
            bucket.last_refill = now;
        }

        if bucket.tokens >= config.tokens_per_message {
            bucket.tokens -= config.tokens_per_message;
            true
        } else {
            debug!(stream, "rate limit exceeded, denying message");
            false
        }
    }

    /// The number of tokens currently available for a stream.
    /// Untracked streams report a full bucket.
    pub fn token_count(&self, stream: &str) -> u64 {
        self.buckets
            .get(stream)
            .map(|bucket| bucket.tokens)
            .unwrap_or(self.config.max_tokens)
    }

    /// Drops the bucket for a stream; the next check starts full.
    pub fn reset(&mut self, stream: &str) {
        self.buckets.remove(stream);
    }

    /// Drops every bucket.
    pub fn reset_all(&mut self) {
        self.buckets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbflow_helpers::time::ManualClock;
    use pretty_assertions::assert_eq;

    fn limiter_with_clock(
        config: RateLimiterConfig,
        start_ms: u64,
    ) -> (TokenBucketRateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start_ms));
        let limiter = TokenBucketRateLimiter::new(config, clock.clone());
        (limiter, clock)
    }

    #[test]
    fn test_rate_limits_then_refills() {
        let config = RateLimiterConfig {
            max_tokens: 2,
            refill_period_ms: 100,
            tokens_per_message: 1,
        };
        let (mut limiter, clock) = limiter_with_clock(config, 0);

        assert!(limiter.check("A"));
        assert!(limiter.check("A"));
        assert!(!limiter.check("A"));

        clock.set(150);
        assert!(limiter.check("A"));
    }

    #[test]
    fn test_streams_are_isolated() {
        let config = RateLimiterConfig {
            max_tokens: 2,
            refill_period_ms: 60_000,
            tokens_per_message: 1,
        };
        let (mut limiter, _clock) = limiter_with_clock(config, 0);

        assert!(limiter.check("A"));
        assert!(limiter.check("A"));
        assert!(!limiter.check("A"));
        assert!(limiter.check("B"));
        assert!(limiter.check("B"));
        assert!(!limiter.check("B"));
    }

    #[test]
    fn test_refill_is_capped_at_max_tokens() {
        let config = RateLimiterConfig {
            max_tokens: 2,
            refill_period_ms: 100,
            tokens_per_message: 1,
        };
        let (mut limiter, clock) = limiter_with_clock(config, 0);

        assert!(limiter.check("A"));

        // Many periods pass; the bucket must not exceed capacity.
        clock.set(10_000);
        assert!(limiter.check("A"));
        assert!(limiter.check("A"));
        assert!(!limiter.check("A"));
    }

    #[test]
    fn test_cost_above_capacity_never_underflows() {
        let config = RateLimiterConfig {
            max_tokens: 2,
            refill_period_ms: 100,
            tokens_per_message: 5,
        };
        let (mut limiter, _clock) = limiter_with_clock(config, 0);

        assert!(!limiter.check("A"));
        assert_eq!(limiter.token_count("A"), 2);
    }

    #[test]
    fn test_untracked_stream_reports_full_bucket() {
        let (limiter, _clock) = limiter_with_clock(RateLimiterConfig::default(), 0);
        assert_eq!(limiter.token_count("never-seen"), 100);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let config = RateLimiterConfig {
            max_tokens: 1,
            refill_period_ms: 60_000,
            tokens_per_message: 1,
        };
        let (mut limiter, _clock) = limiter_with_clock(config, 0);

        assert!(limiter.check("A"));
        assert!(!limiter.check("A"));

        limiter.reset("A");
        limiter.reset("A");
        assert!(limiter.check("A"));
    }

    #[test]
    fn test_partial_period_does_not_refill() {
        let config = RateLimiterConfig {
            max_tokens: 2,
            refill_period_ms: 100,
            tokens_per_message: 1,
        };
        let (mut limiter, clock) = limiter_with_clock(config, 0);

        assert!(limiter.check("A"));
        assert!(limiter.check("A"));

        clock.set(99);
        assert!(!limiter.check("A"));
    }
}
