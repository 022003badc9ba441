use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use arbflow_helpers::time::Clock;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::{
    consts::{ALERT_SERVICE_UNHEALTHY, ALERT_SYSTEM_HEALTH_LOW},
    types::{Alert, AlertSeverity, DegradationLevel, HealthMetrics, HealthStatus, ServiceHealth},
};

/// Configuration for the health monitor.
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// Startup window during which partial-health signals are
    /// suppressed while workers come up.
    pub startup_grace_period_ms: u64,
    /// A healthy service whose heartbeat is older than this is
    /// flipped to unhealthy.
    pub stale_heartbeat_threshold_ms: u64,
    /// Entries with heartbeats older than this are purged entirely;
    /// they belong to a prior process.
    pub purge_age_ms: u64,
    /// Consecutive stale evaluations required before the degradation
    /// level may be downgraded.
    pub consecutive_failures_threshold: u32,
    /// Minimum tracked services before a low-health alert may fire
    /// inside the grace period.
    pub min_services_for_grace_alert: usize,
    /// System health percentage below which a low-health alert is
    /// nominated.
    pub low_health_threshold: f64,
    /// Exact name of the execution engine service.
    pub execution_engine_name: String,
    /// Substring identifying detector services.
    pub detector_pattern: String,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        HealthMonitorConfig {
            startup_grace_period_ms: 180_000,
            stale_heartbeat_threshold_ms: 90_000,
            purge_age_ms: 300_000,
            consecutive_failures_threshold: 3,
            min_services_for_grace_alert: 3,
            low_health_threshold: 80.0,
            execution_engine_name: "execution-engine".to_string(),
            detector_pattern: "detector".to_string(),
        }
    }
}

// Milestones since first stale detection at which throttled stale
// logging escalates back up to WARN.
const STALE_LOG_ESCALATION_MS: [u64; 3] = [60_000, 120_000, 300_000];

#[derive(Debug)]
struct StaleEscalation {
    first_detected: u64,
    next_stage: usize,
}

struct EvaluationSnapshot {
    service_count: usize,
    healthy_count: usize,
    executor_healthy: bool,
    detector_count: usize,
    healthy_detector_count: usize,
    metrics: HealthMetrics,
}

/// Tracks worker heartbeats and drives the platform degradation level.
///
/// Heartbeats arrive through [`HealthMonitor::record_heartbeat`] as the
/// health stream is consumed; [`HealthMonitor::evaluate`] runs on the
/// coordinator's evaluation tick and owns every state transition.
pub struct HealthMonitor {
    services: HashMap<String, ServiceHealth>,
    level: DegradationLevel,
    consecutive_stale_count: u32,
    heartbeat_seen: HashSet<String>,
    stale_escalations: HashMap<String, StaleEscalation>,
    metrics: HealthMetrics,
    started_at: Option<u64>,
    level_changes: u64,
    config: HealthMonitorConfig,
    clock: Arc<dyn Clock + Send + Sync>,
    alert_tx: UnboundedSender<Alert>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthMonitorConfig,
        clock: Arc<dyn Clock + Send + Sync>,
        alert_tx: UnboundedSender<Alert>,
    ) -> Self {
        HealthMonitor {
            services: HashMap::new(),
            level: DegradationLevel::FullOperation,
            consecutive_stale_count: 0,
            heartbeat_seen: HashSet::new(),
            stale_escalations: HashMap::new(),
            metrics: HealthMetrics::default(),
            started_at: None,
            level_changes: 0,
            config,
            clock,
            alert_tx,
        }
    }

    /// Marks the start of the grace period.
    pub fn start(&mut self) {
        self.started_at = Some(self.clock.now_ms());
    }

    /// True while the startup grace period is running. The boundary
    /// instant itself is outside the window.
    pub fn is_in_grace_period(&self) -> bool {
        match self.started_at {
            Some(started_at) => {
                self.clock.now_ms().saturating_sub(started_at)
                    < self.config.startup_grace_period_ms
            }
            None => false,
        }
    }

    /// Records a heartbeat report for a service. The stored
    /// `last_heartbeat` never moves backwards for a given service.
    pub fn record_heartbeat(&mut self, report: ServiceHealth) {
        self.heartbeat_seen.insert(report.name.clone());

        match self.services.get_mut(&report.name) {
            Some(existing) => {
                let last_heartbeat = existing.last_heartbeat.max(report.last_heartbeat);
                *existing = report;
                existing.last_heartbeat = last_heartbeat;
            }
            None => {
                self.services.insert(report.name.clone(), report);
            }
        }
    }

    /// True when the service has reported at least one heartbeat to
    /// this process.
    pub fn has_received_heartbeat(&self, name: &str) -> bool {
        self.heartbeat_seen.contains(name)
    }

    /// Runs one evaluation pass: purge, stale detection, hysteresis,
    /// degradation computation and metric aggregation.
    pub fn evaluate(&mut self) {
        let now = self.clock.now_ms();
        let in_grace = self.is_in_grace_period();

        self.purge_expired(now);
        let stale_count = self.detect_stale(now, in_grace);

        let snapshot = self.aggregate(now);
        self.metrics = snapshot.metrics;

        self.nominate_low_health_alert(&snapshot, in_grace, now);

        if stale_count > 0 {
            self.consecutive_stale_count += 1;
            if self.consecutive_stale_count < self.config.consecutive_failures_threshold {
                debug!(
                    stale_count,
                    consecutive = self.consecutive_stale_count,
                    threshold = self.config.consecutive_failures_threshold,
                    "stale heartbeats below hysteresis threshold, keeping level {}",
                    self.level.as_str()
                );
                return;
            }
        } else {
            self.consecutive_stale_count = 0;
        }

        let new_level = self.compute_level(&snapshot, in_grace);
        if new_level != self.level {
            self.level_changes += 1;
            if new_level > self.level {
                warn!(
                    from = self.level.as_str(),
                    to = new_level.as_str(),
                    "degradation level worsened"
                );
            } else {
                info!(
                    from = self.level.as_str(),
                    to = new_level.as_str(),
                    "degradation level improved"
                );
            }
            self.level = new_level;
        }
    }

    fn purge_expired(&mut self, now: u64) {
        let purge_age = self.config.purge_age_ms;
        let purged: Vec<String> = self
            .services
            .iter()
            .filter(|(_, service)| now.saturating_sub(service.last_heartbeat) > purge_age)
            .map(|(name, _)| name.clone())
            .collect();

        for name in purged {
            debug!(service = %name, "purging service entry with expired heartbeat");
            self.services.remove(&name);
            self.stale_escalations.remove(&name);
        }
    }

    fn detect_stale(&mut self, now: u64, in_grace: bool) -> usize {
        let threshold = self.config.stale_heartbeat_threshold_ms;
        let mut stale_count = 0;
        let mut stale_names = Vec::new();

        for (name, service) in self.services.iter_mut() {
            if service.status != HealthStatus::Healthy || service.last_heartbeat == 0 {
                continue;
            }

            let age = now.saturating_sub(service.last_heartbeat);
            // An age exactly equal to the threshold is not stale.
            if age <= threshold {
                continue;
            }

            // During the grace period only services that have already
            // heartbeated this process can go stale.
            if in_grace && !self.heartbeat_seen.contains(name) {
                continue;
            }

            service.status = HealthStatus::Unhealthy;
            stale_count += 1;
            stale_names.push((name.clone(), age));
        }

        for (name, age) in stale_names {
            self.log_stale(&name, age, now);
            if !in_grace {
                let alert = Alert::new(
                    ALERT_SERVICE_UNHEALTHY,
                    AlertSeverity::High,
                    format!("service {name} heartbeat is {age}ms old"),
                    now,
                )
                .for_service(name);
                let _ = self.alert_tx.send(alert);
            }
        }

        // Services that came back healthy shed their escalation state.
        self.stale_escalations.retain(|name, _| {
            self.services
                .get(name)
                .map(|service| service.status != HealthStatus::Healthy)
                .unwrap_or(false)
        });

        stale_count
    }

    // First detection per service logs at WARN; repeats drop to DEBUG
    // and re-escalate to WARN at fixed milestones so a long-stale
    // service resurfaces without flooding the logs.
    fn log_stale(&mut self, name: &str, age: u64, now: u64) {
        match self.stale_escalations.get_mut(name) {
            None => {
                warn!(service = %name, age_ms = age, "stale heartbeat detected");
                self.stale_escalations.insert(
                    name.to_string(),
                    StaleEscalation {
                        first_detected: now,
                        next_stage: 0,
                    },
                );
            }
            Some(escalation) => {
                let since_first = now.saturating_sub(escalation.first_detected);
                if escalation.next_stage < STALE_LOG_ESCALATION_MS.len()
                    && since_first >= STALE_LOG_ESCALATION_MS[escalation.next_stage]
                {
                    escalation.next_stage += 1;
                    warn!(
                        service = %name,
                        age_ms = age,
                        stale_for_ms = since_first,
                        "service heartbeat still stale"
                    );
                } else {
                    debug!(service = %name, age_ms = age, "stale heartbeat persists");
                }
            }
        }
    }

    fn aggregate(&self, now: u64) -> EvaluationSnapshot {
        let service_count = self.services.len();
        let mut healthy_count = 0;
        let mut executor_healthy = false;
        let mut detector_count = 0;
        let mut healthy_detector_count = 0;
        let mut memory_sum = 0.0;
        let mut latency_sum = 0.0;

        for (name, service) in &self.services {
            let healthy = service.status == HealthStatus::Healthy;
            if healthy {
                healthy_count += 1;
            }

            if name == &self.config.execution_engine_name {
                executor_healthy = healthy;
            }
            if name.contains(&self.config.detector_pattern) {
                detector_count += 1;
                if healthy {
                    healthy_detector_count += 1;
                }
            }

            memory_sum += service.memory_usage;
            latency_sum += service.latency.unwrap_or_else(|| {
                if service.last_heartbeat > 0 {
                    now.saturating_sub(service.last_heartbeat) as f64
                } else {
                    0.0
                }
            });
        }

        let divisor = service_count.max(1) as f64;
        let metrics = HealthMetrics {
            active_services: healthy_count,
            system_health: healthy_count as f64 / divisor * 100.0,
            average_memory: memory_sum / divisor,
            average_latency: latency_sum / divisor,
            last_update: now,
        };

        EvaluationSnapshot {
            service_count,
            healthy_count,
            executor_healthy,
            detector_count,
            healthy_detector_count,
            metrics,
        }
    }

    fn compute_level(&self, snapshot: &EvaluationSnapshot, in_grace: bool) -> DegradationLevel {
        if snapshot.service_count == 0 || snapshot.healthy_count == 0 {
            // A full outage during startup is indistinguishable from
            // workers that have not come up yet.
            return if in_grace {
                DegradationLevel::ReadOnly
            } else {
                DegradationLevel::CompleteOutage
            };
        }

        if !snapshot.executor_healthy {
            if snapshot.healthy_detector_count == 0 {
                return DegradationLevel::ReadOnly;
            }
            return DegradationLevel::DetectionOnly;
        }

        if snapshot.healthy_detector_count < snapshot.detector_count
            || snapshot.detector_count == 0
        {
            return DegradationLevel::ReducedChains;
        }

        DegradationLevel::FullOperation
    }

    fn nominate_low_health_alert(
        &self,
        snapshot: &EvaluationSnapshot,
        in_grace: bool,
        now: u64,
    ) {
        if snapshot.metrics.system_health >= self.config.low_health_threshold {
            return;
        }
        if in_grace && snapshot.service_count < self.config.min_services_for_grace_alert {
            return;
        }

        let alert = Alert::new(
            ALERT_SYSTEM_HEALTH_LOW,
            AlertSeverity::High,
            format!(
                "system health at {:.1}% ({} of {} services healthy)",
                snapshot.metrics.system_health, snapshot.healthy_count, snapshot.service_count
            ),
            now,
        );
        let _ = self.alert_tx.send(alert);
    }

    pub fn degradation_level(&self) -> DegradationLevel {
        self.level
    }

    /// The number of level transitions since construction; each
    /// transition corresponds to exactly one level-change log line.
    pub fn level_changes(&self) -> u64 {
        self.level_changes
    }

    pub fn metrics(&self) -> HealthMetrics {
        self.metrics
    }

    /// A value-copy snapshot of the tracked services; callers may
    /// mutate the copy freely.
    pub fn services_snapshot(&self) -> HashMap<String, ServiceHealth> {
        self.services.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbflow_helpers::time::ManualClock;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    const START_MS: u64 = 1_000_000;

    fn monitor(
        config: HealthMonitorConfig,
    ) -> (
        HealthMonitor,
        Arc<ManualClock>,
        mpsc::UnboundedReceiver<Alert>,
    ) {
        let clock = Arc::new(ManualClock::new(START_MS));
        let (alert_tx, alert_rx) = mpsc::unbounded_channel();
        let monitor = HealthMonitor::new(config, clock.clone(), alert_tx);
        (monitor, clock, alert_rx)
    }

    fn no_grace_config() -> HealthMonitorConfig {
        HealthMonitorConfig {
            startup_grace_period_ms: 0,
            ..HealthMonitorConfig::default()
        }
    }

    fn report(name: &str, status: HealthStatus, last_heartbeat: u64) -> ServiceHealth {
        ServiceHealth {
            name: name.to_string(),
            status,
            uptime: 60,
            memory_usage: 100.0,
            cpu_usage: 10.0,
            last_heartbeat,
            latency: Some(5.0),
        }
    }

    #[test]
    fn test_degradation_transitions_log_once_each() {
        let (mut monitor, clock, _alert_rx) = monitor(no_grace_config());
        monitor.start();

        // Empty map evaluates to a complete outage.
        monitor.evaluate();
        assert_eq!(
            monitor.degradation_level(),
            DegradationLevel::CompleteOutage
        );

        // Executor down, detector healthy: detection only.
        let now = clock.now_ms();
        monitor.record_heartbeat(report("execution-engine", HealthStatus::Unhealthy, now));
        monitor.record_heartbeat(report("detector-evm", HealthStatus::Healthy, now));
        monitor.evaluate();
        assert_eq!(monitor.degradation_level(), DegradationLevel::DetectionOnly);

        // Repeat evaluation at the same level: no further transition.
        monitor.evaluate();
        assert_eq!(monitor.level_changes(), 2);

        // All healthy again: full operation.
        let now = clock.now_ms();
        monitor.record_heartbeat(report("execution-engine", HealthStatus::Healthy, now));
        monitor.record_heartbeat(report("detector-evm", HealthStatus::Healthy, now));
        monitor.evaluate();
        assert_eq!(monitor.degradation_level(), DegradationLevel::FullOperation);
        assert_eq!(monitor.level_changes(), 3);
    }

    #[test]
    fn test_grace_period_boundary_is_exclusive() {
        let config = HealthMonitorConfig {
            startup_grace_period_ms: 180_000,
            ..HealthMonitorConfig::default()
        };
        let (mut monitor, clock, _alert_rx) = monitor(config);
        monitor.start();

        assert!(monitor.is_in_grace_period());

        clock.set(START_MS + 179_999);
        assert!(monitor.is_in_grace_period());

        clock.set(START_MS + 180_000);
        assert!(!monitor.is_in_grace_period());
    }

    #[test]
    fn test_outage_is_capped_at_read_only_during_grace() {
        let config = HealthMonitorConfig {
            startup_grace_period_ms: 180_000,
            ..HealthMonitorConfig::default()
        };
        let (mut monitor, _clock, _alert_rx) = monitor(config);
        monitor.start();

        monitor.evaluate();
        assert_eq!(monitor.degradation_level(), DegradationLevel::ReadOnly);
    }

    #[test]
    fn test_stale_boundary_age_equal_to_threshold_is_not_stale() {
        let (mut monitor, clock, _alert_rx) = monitor(no_grace_config());
        monitor.start();

        monitor.record_heartbeat(report(
            "execution-engine",
            HealthStatus::Healthy,
            START_MS,
        ));
        monitor.record_heartbeat(report("detector-evm", HealthStatus::Healthy, START_MS));

        // Exactly at the threshold: still healthy.
        clock.set(START_MS + 90_000);
        monitor.evaluate();
        assert_eq!(
            monitor.services_snapshot()["execution-engine"].status,
            HealthStatus::Healthy
        );

        // One millisecond past: stale.
        clock.set(START_MS + 90_001);
        monitor.evaluate();
        assert_eq!(
            monitor.services_snapshot()["execution-engine"].status,
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn test_hysteresis_requires_consecutive_stale_evaluations() {
        let (mut monitor, clock, _alert_rx) = monitor(no_grace_config());
        monitor.start();

        monitor.record_heartbeat(report(
            "execution-engine",
            HealthStatus::Healthy,
            START_MS,
        ));
        monitor.record_heartbeat(report("detector-evm", HealthStatus::Healthy, START_MS));
        monitor.evaluate();
        assert_eq!(monitor.degradation_level(), DegradationLevel::FullOperation);

        // First stale evaluation: the executor heartbeat expires but
        // the level holds.
        clock.set(START_MS + 100_000);
        monitor.record_heartbeat(report(
            "detector-evm",
            HealthStatus::Healthy,
            START_MS + 100_000,
        ));
        monitor.evaluate();
        assert_eq!(monitor.degradation_level(), DegradationLevel::FullOperation);

        // Second consecutive stale evaluation: a fresh heartbeat for
        // the executor flips it healthy again, then expires again.
        clock.set(START_MS + 200_000);
        monitor.record_heartbeat(report(
            "execution-engine",
            HealthStatus::Healthy,
            START_MS + 100_000,
        ));
        monitor.record_heartbeat(report(
            "detector-evm",
            HealthStatus::Healthy,
            START_MS + 200_000,
        ));
        monitor.evaluate();
        assert_eq!(monitor.degradation_level(), DegradationLevel::FullOperation);

        // Third consecutive stale evaluation crosses the hysteresis
        // threshold and the downgrade lands.
        clock.set(START_MS + 300_000);
        monitor.record_heartbeat(report(
            "execution-engine",
            HealthStatus::Healthy,
            START_MS + 200_000,
        ));
        monitor.record_heartbeat(report(
            "detector-evm",
            HealthStatus::Healthy,
            START_MS + 300_000,
        ));
        monitor.evaluate();
        assert_eq!(monitor.degradation_level(), DegradationLevel::DetectionOnly);
    }

    #[test]
    fn test_clean_evaluation_resets_consecutive_counter() {
        let (mut monitor, clock, _alert_rx) = monitor(no_grace_config());
        monitor.start();

        monitor.record_heartbeat(report(
            "execution-engine",
            HealthStatus::Healthy,
            START_MS,
        ));
        monitor.record_heartbeat(report("detector-evm", HealthStatus::Healthy, START_MS));

        // Two stale evaluations in a row.
        for step in 1..=2u64 {
            clock.set(START_MS + step * 100_000);
            monitor.record_heartbeat(report(
                "execution-engine",
                HealthStatus::Healthy,
                START_MS + (step - 1) * 100_000,
            ));
            monitor.record_heartbeat(report(
                "detector-evm",
                HealthStatus::Healthy,
                START_MS + step * 100_000,
            ));
            monitor.evaluate();
        }
        assert_eq!(monitor.degradation_level(), DegradationLevel::FullOperation);

        // A clean evaluation resets the counter.
        let now = clock.now_ms();
        monitor.record_heartbeat(report("execution-engine", HealthStatus::Healthy, now));
        monitor.record_heartbeat(report("detector-evm", HealthStatus::Healthy, now));
        monitor.evaluate();

        // One more stale evaluation alone must not downgrade.
        clock.advance(100_000);
        monitor.record_heartbeat(report(
            "detector-evm",
            HealthStatus::Healthy,
            clock.now_ms(),
        ));
        monitor.evaluate();
        assert_eq!(monitor.degradation_level(), DegradationLevel::FullOperation);
    }

    #[test]
    fn test_entries_older_than_purge_age_are_dropped() {
        let (mut monitor, clock, _alert_rx) = monitor(no_grace_config());
        monitor.start();

        monitor.record_heartbeat(report("detector-old", HealthStatus::Healthy, START_MS));
        clock.set(START_MS + 300_001);
        monitor.evaluate();

        assert!(!monitor.services_snapshot().contains_key("detector-old"));
    }

    #[test]
    fn test_grace_skips_stale_detection_for_unseen_services() {
        let config = HealthMonitorConfig {
            startup_grace_period_ms: 500_000,
            ..HealthMonitorConfig::default()
        };
        let (mut monitor, clock, _alert_rx) = monitor(config);
        monitor.start();

        // A service that heartbeated this process is treated normally
        // even during grace.
        monitor.record_heartbeat(report("detector-evm", HealthStatus::Healthy, START_MS));
        clock.set(START_MS + 100_000);
        monitor.evaluate();
        assert_eq!(
            monitor.services_snapshot()["detector-evm"].status,
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn test_reduced_chains_when_any_detector_down() {
        let (mut monitor, clock, _alert_rx) = monitor(no_grace_config());
        monitor.start();

        let now = clock.now_ms();
        monitor.record_heartbeat(report("execution-engine", HealthStatus::Healthy, now));
        monitor.record_heartbeat(report("detector-evm", HealthStatus::Healthy, now));
        monitor.record_heartbeat(report("detector-solana", HealthStatus::Unhealthy, now));
        monitor.evaluate();

        assert_eq!(monitor.degradation_level(), DegradationLevel::ReducedChains);
    }

    #[test]
    fn test_executor_down_with_no_healthy_detectors_is_read_only() {
        let (mut monitor, clock, _alert_rx) = monitor(no_grace_config());
        monitor.start();

        let now = clock.now_ms();
        monitor.record_heartbeat(report("execution-engine", HealthStatus::Unhealthy, now));
        monitor.record_heartbeat(report("detector-evm", HealthStatus::Unhealthy, now));
        monitor.record_heartbeat(report("api-gateway", HealthStatus::Healthy, now));
        monitor.evaluate();

        assert_eq!(monitor.degradation_level(), DegradationLevel::ReadOnly);
    }

    #[test]
    fn test_metrics_single_pass_preserves_zero_memory() {
        let (mut monitor, clock, _alert_rx) = monitor(no_grace_config());
        monitor.start();

        let now = clock.now_ms();
        let mut zero_memory = report("detector-evm", HealthStatus::Healthy, now);
        zero_memory.memory_usage = 0.0;
        zero_memory.latency = Some(10.0);
        monitor.record_heartbeat(zero_memory);

        let mut no_latency = report("execution-engine", HealthStatus::Unhealthy, now - 2_000);
        no_latency.memory_usage = 300.0;
        no_latency.latency = None;
        monitor.record_heartbeat(no_latency);

        monitor.evaluate();
        let metrics = monitor.metrics();

        assert_eq!(metrics.active_services, 1);
        assert_eq!(metrics.system_health, 50.0);
        assert_eq!(metrics.average_memory, 150.0);
        // The missing latency falls back to heartbeat age (2000ms).
        assert_eq!(metrics.average_latency, (10.0 + 2_000.0) / 2.0);
        assert_eq!(metrics.last_update, now);
    }

    #[test]
    fn test_low_health_alert_rules_in_and_out_of_grace() {
        let config = HealthMonitorConfig {
            startup_grace_period_ms: 500_000,
            ..HealthMonitorConfig::default()
        };
        let (mut monitor, clock, mut alert_rx) = monitor(config);
        monitor.start();

        // In grace with fewer than the minimum services: suppressed.
        let now = clock.now_ms();
        monitor.record_heartbeat(report("detector-evm", HealthStatus::Unhealthy, now));
        monitor.evaluate();
        assert!(alert_rx.try_recv().is_err());

        // Still in grace but with enough services: nominated.
        monitor.record_heartbeat(report("detector-solana", HealthStatus::Unhealthy, now));
        monitor.record_heartbeat(report("execution-engine", HealthStatus::Unhealthy, now));
        monitor.evaluate();
        let alert = alert_rx.try_recv().unwrap();
        assert_eq!(alert.alert_type, ALERT_SYSTEM_HEALTH_LOW);
    }

    #[test]
    fn test_stale_service_nominates_unhealthy_alert_outside_grace() {
        let (mut monitor, clock, mut alert_rx) = monitor(no_grace_config());
        monitor.start();

        monitor.record_heartbeat(report("detector-evm", HealthStatus::Healthy, START_MS));
        clock.set(START_MS + 120_000);
        monitor.evaluate();

        let mut saw_unhealthy = false;
        while let Ok(alert) = alert_rx.try_recv() {
            if alert.alert_type == ALERT_SERVICE_UNHEALTHY {
                assert_eq!(alert.service.as_deref(), Some("detector-evm"));
                saw_unhealthy = true;
            }
        }
        assert!(saw_unhealthy);
    }
}
