//! Well-known stream and consumer-group names shared by every
//! service on the platform. These are part of the wire contract:
//! detectors publish to them, the coordinator consumes and forwards,
//! and the execution engine reads the forwarded stream.

/// The stream carrying opportunities published by detector services.
pub const OPPORTUNITIES_STREAM: &str = "stream:opportunities";

/// The stream the coordinator forwards validated opportunities to
/// for the execution engine to consume.
pub const EXECUTION_REQUESTS_STREAM: &str = "stream:execution-requests";

/// A low-latency opportunity stream attached only when the fast-lane
/// feature flag is enabled.
pub const FAST_LANE_STREAM: &str = "stream:fast-lane";

/// The stream carrying worker heartbeat reports.
pub const HEALTH_STREAM: &str = "stream:health";

/// The stream carrying large-transfer notifications from detectors.
pub const WHALE_ALERTS_STREAM: &str = "stream:whale-alerts";

/// The stream carrying observed swap events used for pair activity
/// tracking.
pub const SWAP_EVENTS_STREAM: &str = "stream:swap-events";

/// The stream carrying windowed volume aggregates.
pub const VOLUME_AGGREGATES_STREAM: &str = "stream:volume-aggregates";

/// The stream carrying token price updates.
pub const PRICE_UPDATES_STREAM: &str = "stream:price-updates";

/// The stream receiving messages that could not be processed
/// normally, with enough metadata to replay or audit them.
pub const DEAD_LETTER_STREAM: &str = "stream:dead-letter-queue";

/// The stream receiving opportunities that could not be forwarded
/// to the execution engine.
pub const FORWARDING_DLQ_STREAM: &str = "stream:forwarding-dlq";

/// The consumer group used by coordinator replicas.
pub const COORDINATOR_GROUP: &str = "coordinator-group";

/// The consumer group used by execution engine replicas.
pub const EXECUTION_ENGINE_GROUP: &str = "execution-engine-group";
