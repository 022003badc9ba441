use rand::Rng;

/// Configuration for an exponential backoff strategy shared by
/// forwarding retries and webhook delivery attempts.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// The base delay in milliseconds for the first retry attempt.
    pub base_delay_ms: u64,
    /// The multiplier applied for each subsequent attempt.
    pub backoff_rate: f64,
    /// An optional cap on the computed wait time in milliseconds.
    pub max_delay_ms: Option<u64>,
    /// Whether to apply full jitter to the computed wait time.
    /// See: https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            base_delay_ms: 1_000,
            backoff_rate: 2.0,
            max_delay_ms: Some(60_000),
            jitter: true,
        }
    }
}

/// Calculate the wait time in milliseconds for a retry attempt,
/// where `attempt` is zero-based (the first retry is attempt 0).
pub fn backoff_wait_time_ms(config: &BackoffConfig, attempt: u32) -> u64 {
    let mut computed_wait_time_ms =
        config.base_delay_ms as f64 * config.backoff_rate.powf(attempt as f64);

    if let Some(max_delay_ms) = config.max_delay_ms {
        computed_wait_time_ms = computed_wait_time_ms.min(max_delay_ms as f64);
    }

    if config.jitter && computed_wait_time_ms > 0.0 {
        rand::thread_rng()
            .gen_range(0.0..computed_wait_time_ms)
            .trunc() as u64
    } else {
        computed_wait_time_ms.trunc() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculates_backoff_wait_time_without_jitter() {
        let config = BackoffConfig {
            base_delay_ms: 2_000,
            backoff_rate: 1.5,
            max_delay_ms: Some(14_000),
            jitter: false,
        };

        // First attempt uses the base delay.
        assert_eq!(backoff_wait_time_ms(&config, 0), 2_000);

        // Subsequent attempts multiply by base * rate^attempt.
        assert_eq!(backoff_wait_time_ms(&config, 1), 3_000);
        assert_eq!(backoff_wait_time_ms(&config, 2), 4_500);
        assert_eq!(backoff_wait_time_ms(&config, 3), 6_750);
        assert_eq!(backoff_wait_time_ms(&config, 4), 10_125);

        // The sixth attempt would be 15.1875 seconds but is capped
        // at the configured max delay.
        assert_eq!(backoff_wait_time_ms(&config, 5), 14_000);
    }

    #[test_log::test]
    fn test_calculates_backoff_wait_time_within_jitter_bounds() {
        let config = BackoffConfig {
            base_delay_ms: 3_000,
            backoff_rate: 2.0,
            max_delay_ms: Some(80_000),
            jitter: true,
        };

        assert!(backoff_wait_time_ms(&config, 0) <= 3_000);
        assert!(backoff_wait_time_ms(&config, 1) <= 6_000);
        assert!(backoff_wait_time_ms(&config, 2) <= 12_000);
        assert!(backoff_wait_time_ms(&config, 3) <= 24_000);
        assert!(backoff_wait_time_ms(&config, 4) <= 48_000);

        // The sixth attempt would be 96 seconds but is capped at 80.
        assert!(backoff_wait_time_ms(&config, 5) <= 80_000);
    }
}
