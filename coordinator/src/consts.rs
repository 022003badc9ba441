// The platform-wide stream and group names live with the shared wire
// contract; re-exported here so coordinator modules have one import
// path for all well-known names.
pub use arbflow_helpers::streams::{
    COORDINATOR_GROUP, DEAD_LETTER_STREAM, EXECUTION_REQUESTS_STREAM, FAST_LANE_STREAM,
    FORWARDING_DLQ_STREAM, HEALTH_STREAM, OPPORTUNITIES_STREAM, PRICE_UPDATES_STREAM,
    SWAP_EVENTS_STREAM, VOLUME_AGGREGATES_STREAM, WHALE_ALERTS_STREAM,
};

// The key holding the leadership lease; the value is the instance ID
// of the current leader.
pub const LEADER_LOCK_KEY: &str = "coordinator:leader:lock";

// Alert type identifiers.
pub const ALERT_STREAM_CONSUMER_FAILURE: &str = "STREAM_CONSUMER_FAILURE";
pub const ALERT_STREAM_RECOVERED: &str = "STREAM_RECOVERED";
pub const ALERT_SERVICE_UNHEALTHY: &str = "SERVICE_UNHEALTHY";
pub const ALERT_SYSTEM_HEALTH_LOW: &str = "SYSTEM_HEALTH_LOW";
pub const ALERT_DEGRADATION_CHANGE: &str = "DEGRADATION_LEVEL_CHANGE";
pub const ALERT_LEADER_ACQUIRED: &str = "LEADER_ACQUIRED";
pub const ALERT_LEADER_DEMOTION: &str = "LEADER_DEMOTION";
pub const ALERT_WHALE_MOVEMENT: &str = "WHALE_MOVEMENT";
