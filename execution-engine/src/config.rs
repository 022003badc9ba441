use arbflow_helpers::env::EnvVars;

/// Configuration for the execution engine consumer and its local
/// execution queue, sourced once from the environment.
#[derive(Debug, Clone)]
pub struct ExecutionEngineConfig {
    /// Connection string for the streams broker.
    pub redis_url: String,
    /// Host identifier used to build the consumer name.
    pub hostname: String,
    /// Opportunities below this confidence are rejected outright.
    pub min_confidence: f64,
    /// Opportunities below this profit percentage are rejected.
    pub min_profit_percentage: f64,
    /// Pending entries older than this are force-acknowledged so the
    /// broker-side pending list cannot leak.
    pub pending_message_max_age_ms: u64,
    /// Interval between stale pending sweeps.
    pub stale_sweep_interval_ms: u64,
    /// Minimum idle time before another consumer's pending message is
    /// considered orphaned.
    pub orphan_claim_min_idle_ms: u64,
    /// Maximum orphaned messages claimed per recovery pass.
    pub orphan_claim_batch_size: usize,
    /// Messages fetched per read.
    pub read_count: usize,
    /// Blocking read timeout against the broker.
    pub block_time_ms: u64,
    /// Minimum spacing between reads; handling time counts towards it.
    pub polling_wait_time_ms: u64,
    /// Budget for in-flight work during shutdown.
    pub shutdown_ack_timeout_ms: u64,
    /// Capacity of the in-process execution queue.
    pub queue_capacity: usize,
    /// Queue depth at which a paused consumer resumes reading.
    pub queue_resume_threshold: usize,
    /// Number of execution workers draining the queue.
    pub workers: usize,
}

impl Default for ExecutionEngineConfig {
    fn default() -> Self {
        ExecutionEngineConfig {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            hostname: "execution-engine".to_string(),
            min_confidence: 0.5,
            min_profit_percentage: 0.1,
            pending_message_max_age_ms: 600_000,
            stale_sweep_interval_ms: 60_000,
            orphan_claim_min_idle_ms: 60_000,
            orphan_claim_batch_size: 100,
            read_count: 10,
            block_time_ms: 5_000,
            polling_wait_time_ms: 250,
            shutdown_ack_timeout_ms: 5_000,
            queue_capacity: 1_000,
            queue_resume_threshold: 500,
            workers: 4,
        }
    }
}

impl ExecutionEngineConfig {
    /// Creates execution engine configuration, sourcing overrides
    /// from the provided environment variables.
    pub fn from_env(env: &impl EnvVars) -> Self {
        let mut config = ExecutionEngineConfig::default();

        if let Some(redis_url) = env.get("REDIS_URL") {
            config.redis_url = redis_url;
        }
        if let Some(hostname) = env.get("HOSTNAME") {
            config.hostname = hostname;
        }
        if let Some(value) = env.get("EXECUTION_MIN_CONFIDENCE") {
            config.min_confidence = value
                .parse()
                .expect("Invalid minimum confidence, must be a valid number");
        }
        if let Some(value) = env.get("EXECUTION_MIN_PROFIT") {
            config.min_profit_percentage = value
                .parse()
                .expect("Invalid minimum profit, must be a valid number");
        }
        if let Some(value) = env.get("EXECUTION_QUEUE_CAPACITY") {
            config.queue_capacity = value
                .parse()
                .expect("Invalid queue capacity, must be a valid integer");
            config.queue_resume_threshold = config.queue_capacity / 2;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbflow_helpers::env::MapEnvVars;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_when_environment_is_empty() {
        let config = ExecutionEngineConfig::from_env(&MapEnvVars::default());

        assert_eq!(config.min_confidence, 0.5);
        assert_eq!(config.pending_message_max_age_ms, 600_000);
        assert_eq!(config.queue_capacity, 1_000);
    }

    #[test]
    fn test_environment_overrides_are_applied() {
        let env = MapEnvVars::default()
            .with_var("EXECUTION_MIN_CONFIDENCE", "0.8")
            .with_var("EXECUTION_QUEUE_CAPACITY", "200");

        let config = ExecutionEngineConfig::from_env(&env);

        assert_eq!(config.min_confidence, 0.8);
        assert_eq!(config.queue_capacity, 200);
        assert_eq!(config.queue_resume_threshold, 100);
    }
}
