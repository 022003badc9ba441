pub mod active_pairs;
pub mod alert_cooldown;
pub mod alerts;
pub mod circuit_breaker;
pub mod config;
pub mod consts;
pub mod coordinator;
pub mod errors;
pub mod health;
pub mod leadership;
pub mod messages;
pub mod rate_limiter;
pub mod router;
pub mod stream_consumer;
pub mod types;
