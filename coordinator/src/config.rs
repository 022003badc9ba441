use arbflow_helpers::env::EnvVars;

use crate::{
    active_pairs::ActivePairsConfig,
    alerts::AlertNotifierConfig,
    health::HealthMonitorConfig,
    leadership::LeaderElectionConfig,
    router::OpportunityRouterConfig,
    stream_consumer::StreamConsumerConfig,
};

/// Top-level coordinator configuration, sourced once from the
/// environment and injected into every component.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Connection string for the streams broker.
    pub redis_url: String,
    /// Host identifier used to build the instance ID.
    pub hostname: String,
    pub discord_webhook_url: Option<String>,
    pub slack_webhook_url: Option<String>,
    /// Attaches the fast-lane opportunity stream when enabled.
    pub feature_fast_lane: bool,
    /// Messages fetched per read from each stream.
    pub read_count: usize,
    /// Blocking read timeout against the broker.
    pub block_time_ms: u64,
    /// Minimum spacing between reads on a stream; time already spent
    /// handling a batch counts towards it.
    pub polling_wait_time_ms: u64,
    /// Interval between health evaluation passes.
    pub health_evaluation_interval_ms: u64,
    /// Interval between maintenance sweeps (expiry cleanup, cooldown
    /// cleanup, pair cleanup).
    pub maintenance_interval_ms: u64,
    /// Budget for in-flight handlers during shutdown.
    pub shutdown_ack_timeout_ms: u64,
    pub consumer: StreamConsumerConfig,
    pub health: HealthMonitorConfig,
    pub leadership: LeaderElectionConfig,
    pub router: OpportunityRouterConfig,
    pub active_pairs: ActivePairsConfig,
    pub notifier: AlertNotifierConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            hostname: "coordinator".to_string(),
            discord_webhook_url: None,
            slack_webhook_url: None,
            feature_fast_lane: false,
            read_count: 100,
            block_time_ms: 5_000,
            polling_wait_time_ms: 1_000,
            health_evaluation_interval_ms: 15_000,
            maintenance_interval_ms: 60_000,
            shutdown_ack_timeout_ms: 5_000,
            consumer: StreamConsumerConfig::default(),
            health: HealthMonitorConfig::default(),
            leadership: LeaderElectionConfig::default(),
            router: OpportunityRouterConfig::default(),
            active_pairs: ActivePairsConfig::default(),
            notifier: AlertNotifierConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Creates coordinator configuration, sourcing overrides from the
    /// provided environment variables.
    pub fn from_env(env: &impl EnvVars) -> Self {
        let mut config = CoordinatorConfig::default();

        if let Some(redis_url) = env.get("REDIS_URL") {
            config.redis_url = redis_url;
        }
        if let Some(hostname) = env.get("HOSTNAME") {
            config.hostname = hostname;
        }
        config.discord_webhook_url = env.get("DISCORD_WEBHOOK_URL");
        config.slack_webhook_url = env.get("SLACK_WEBHOOK_URL");
        config.feature_fast_lane = env.flag("FEATURE_FAST_LANE");

        if let Some(value) = env.get("COORDINATOR_GRACE_PERIOD_MS") {
            config.health.startup_grace_period_ms = value
                .parse()
                .expect("Invalid grace period, must be a valid integer");
        }
        if let Some(value) = env.get("COORDINATOR_STALE_HEARTBEAT_MS") {
            config.health.stale_heartbeat_threshold_ms = value
                .parse()
                .expect("Invalid stale heartbeat threshold, must be a valid integer");
        }
        if let Some(value) = env.get("COORDINATOR_LOCK_TTL_MS") {
            config.leadership.lock_ttl_ms = value
                .parse()
                .expect("Invalid lock TTL, must be a valid integer");
        }
        if let Some(value) = env.get("COORDINATOR_HEARTBEAT_INTERVAL_MS") {
            config.leadership.heartbeat_interval_ms = value
                .parse()
                .expect("Invalid heartbeat interval, must be a valid integer");
        }
        config.leadership.standby = env.flag("COORDINATOR_STANDBY");

        config
    }
}
