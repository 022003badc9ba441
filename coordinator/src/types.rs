use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The reported status of a worker service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Degraded,
    Starting,
    Stopping,
}

/// A heartbeat report for a single worker service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    pub name: String,
    pub status: HealthStatus,
    /// Seconds since the service started.
    pub uptime: u64,
    /// Resident memory in megabytes; zero is a valid reading.
    pub memory_usage: f64,
    pub cpu_usage: f64,
    /// UNIX milliseconds of the most recent heartbeat.
    pub last_heartbeat: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<f64>,
}

/// Coarse platform health classification driving feature gating.
/// The variants are ordered from best to worst so that comparisons
/// read naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DegradationLevel {
    FullOperation,
    ReducedChains,
    DetectionOnly,
    ReadOnly,
    CompleteOutage,
}

impl DegradationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DegradationLevel::FullOperation => "FULL_OPERATION",
            DegradationLevel::ReducedChains => "REDUCED_CHAINS",
            DegradationLevel::DetectionOnly => "DETECTION_ONLY",
            DegradationLevel::ReadOnly => "READ_ONLY",
            DegradationLevel::CompleteOutage => "COMPLETE_OUTAGE",
        }
    }
}

/// Aggregated service metrics computed on each health evaluation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    pub active_services: usize,
    /// Percentage of tracked services that are healthy.
    pub system_health: f64,
    pub average_memory: f64,
    pub average_latency: f64,
    pub last_update: u64,
}

/// The severity attached to an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    High,
    Critical,
    Warning,
    Info,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "low",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Info => "info",
        }
    }
}

/// An alert nominated by a component; the notifier owns suppression
/// and channel delivery decisions.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    #[serde(rename = "type")]
    pub alert_type: String,
    pub severity: AlertSeverity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub message: String,
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Alert {
    pub fn new(
        alert_type: &str,
        severity: AlertSeverity,
        message: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Alert {
            alert_type: alert_type.to_string(),
            severity,
            service: None,
            message: message.into(),
            timestamp,
            data: None,
        }
    }

    pub fn for_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// The deduplication key used by the cooldown manager: alerts of
    /// the same type for the same service share a cooldown window.
    pub fn cooldown_key(&self) -> String {
        format!(
            "{}_{}",
            self.alert_type,
            self.service.as_deref().unwrap_or("system")
        )
    }
}

/// The record written to the forwarding dead letter stream when an
/// opportunity cannot be handed to the execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardingDlqRecord {
    pub opportunity_id: String,
    pub error: String,
    pub original_stream: String,
    pub timestamp: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_degradation_levels_are_ordered_best_to_worst() {
        assert!(DegradationLevel::FullOperation < DegradationLevel::ReducedChains);
        assert!(DegradationLevel::ReducedChains < DegradationLevel::DetectionOnly);
        assert!(DegradationLevel::DetectionOnly < DegradationLevel::ReadOnly);
        assert!(DegradationLevel::ReadOnly < DegradationLevel::CompleteOutage);
    }

    #[test]
    fn test_alert_cooldown_key_defaults_to_system() {
        let alert = Alert::new("SYSTEM_HEALTH_LOW", AlertSeverity::High, "low health", 1);
        assert_eq!(alert.cooldown_key(), "SYSTEM_HEALTH_LOW_system");

        let alert = alert.for_service("detector-evm");
        assert_eq!(alert.cooldown_key(), "SYSTEM_HEALTH_LOW_detector-evm");
    }

    #[test]
    fn test_service_health_parses_camel_case_payload() {
        let payload = r#"{
            "name": "detector-evm",
            "status": "healthy",
            "uptime": 120,
            "memoryUsage": 256.5,
            "cpuUsage": 12.0,
            "lastHeartbeat": 1700000000000
        }"#;

        let health: ServiceHealth = serde_json::from_str(payload).unwrap();
        assert_eq!(health.name, "detector-evm");
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.latency, None);
    }
}
