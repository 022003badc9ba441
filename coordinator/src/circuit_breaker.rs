use tracing::{info, warn};

/// Configuration for a failure-threshold circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before allowing a probe.
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
        }
    }
}

/// A circuit breaker guarding a single downstream dependency
/// (a webhook channel or the execution stream).
///
/// Opens after `failure_threshold` failures, lets one probe through
/// after `reset_timeout_ms`, and closes on the first success.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failures: u32,
    last_failure: u64,
    is_open: bool,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            name: name.into(),
            failures: 0,
            last_failure: 0,
            is_open: false,
            config,
        }
    }

    /// Whether a call may proceed at `now`. An open breaker admits a
    /// single probe once the reset timeout has elapsed since the last
    /// failure; the probe's outcome decides whether it closes.
    pub fn allow_request(&mut self, now: u64) -> bool {
        if !self.is_open {
            return true;
        }

        if now.saturating_sub(self.last_failure) >= self.config.reset_timeout_ms {
            info!(breaker = %self.name, "circuit breaker half-open, allowing probe");
            return true;
        }

        false
    }

    pub fn record_success(&mut self) {
        if self.is_open {
            info!(breaker = %self.name, "circuit breaker closed after successful probe");
        }
        self.failures = 0;
        self.is_open = false;
    }

    pub fn record_failure(&mut self, now: u64) {
        self.failures += 1;
        self.last_failure = now;
        if !self.is_open && self.failures >= self.config.failure_threshold {
            self.is_open = true;
            warn!(
                breaker = %self.name,
                failures = self.failures,
                "circuit breaker opened"
            );
        }
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}
