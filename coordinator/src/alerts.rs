use std::{
    error::Error,
    fmt::{self, Display},
    sync::Arc,
    time::Duration,
};

use arbflow_helpers::{
    retries::{backoff_wait_time_ms, BackoffConfig},
    time::Clock,
};
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use crate::{
    alert_cooldown::{AlertCooldownConfig, AlertCooldownManager},
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig},
    types::Alert,
};

/// The error type surfaced by alert channels.
#[derive(Debug)]
pub struct ChannelSendError {
    message: String,
}

impl ChannelSendError {
    pub fn new(message: impl Into<String>) -> Self {
        ChannelSendError {
            message: message.into(),
        }
    }
}

impl Display for ChannelSendError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "alert channel send error: {}", self.message)
    }
}

impl Error for ChannelSendError {}

/// A delivery target for alerts (a chat webhook, a pager, ...).
#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, alert: &Alert) -> Result<(), ChannelSendError>;
}

/// The webhook body formats supported out of the box.
#[derive(Debug, Clone, Copy)]
pub enum WebhookFormat {
    Discord,
    Slack,
}

/// An alert channel that posts to a chat webhook.
pub struct WebhookChannel {
    name: String,
    url: String,
    format: WebhookFormat,
    http: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(name: impl Into<String>, url: impl Into<String>, format: WebhookFormat) -> Self {
        WebhookChannel {
            name: name.into(),
            url: url.into(),
            format,
            http: reqwest::Client::new(),
        }
    }

    fn body(&self, alert: &Alert) -> serde_json::Value {
        let service = alert
            .service
            .as_deref()
            .map(|service| format!(" ({service})"))
            .unwrap_or_default();
        let text = format!(
            "[{severity}] {alert_type}{service}: {message}",
            severity = alert.severity.as_str(),
            alert_type = alert.alert_type,
            message = alert.message,
        );

        match self.format {
            WebhookFormat::Discord => json!({ "content": text }),
            WebhookFormat::Slack => json!({ "text": text }),
        }
    }
}

#[async_trait]
impl AlertChannel for WebhookChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, alert: &Alert) -> Result<(), ChannelSendError> {
        let response = self
            .http
            .post(&self.url)
            .json(&self.body(alert))
            .send()
            .await
            .map_err(|err| ChannelSendError::new(err.to_string()))?;

        if !response.status().is_success() {
            return Err(ChannelSendError::new(format!(
                "webhook responded with status {}",
                response.status()
            )));
        }

        Ok(())
    }
}

/// A fixed-size ring of the most recent alerts; pushes are O(1)
/// and never reallocate once the ring is full.
pub struct AlertHistory {
    slots: Vec<Option<Alert>>,
    head: usize,
    len: usize,
}

impl AlertHistory {
    pub fn new(capacity: usize) -> Self {
        AlertHistory {
            slots: (0..capacity.max(1)).map(|_| None).collect(),
            head: 0,
            len: 0,
        }
    }

    pub fn push(&mut self, alert: Alert) {
        self.slots[self.head] = Some(alert);
        self.head = (self.head + 1) % self.slots.len();
        self.len = (self.len + 1).min(self.slots.len());
    }

    /// The most recent alerts, newest first, up to `limit`.
    pub fn newest_first(&self, limit: usize) -> Vec<Alert> {
        let capacity = self.slots.len();
        let count = limit.min(self.len);
        let mut alerts = Vec::with_capacity(count);
        for offset in 1..=count {
            let index = (self.head + capacity - offset) % capacity;
            if let Some(alert) = &self.slots[index] {
                alerts.push(alert.clone());
            }
        }
        alerts
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Configuration for the alert notifier.
#[derive(Debug, Clone)]
pub struct AlertNotifierConfig {
    /// The number of alerts retained in the in-memory history ring.
    pub history_size: usize,
    /// The circuit breaker settings applied to each channel.
    pub channel_breaker: CircuitBreakerConfig,
    /// Retries per channel send before the attempt counts as failed.
    pub send_retries: u32,
    /// Backoff between send retries.
    pub send_backoff: BackoffConfig,
    /// Cooldown settings for alert deduplication.
    pub cooldown: AlertCooldownConfig,
}

impl Default for AlertNotifierConfig {
    fn default() -> Self {
        AlertNotifierConfig {
            history_size: 100,
            channel_breaker: CircuitBreakerConfig::default(),
            send_retries: 2,
            send_backoff: BackoffConfig {
                base_delay_ms: 500,
                backoff_rate: 2.0,
                max_delay_ms: Some(5_000),
                jitter: true,
            },
            cooldown: AlertCooldownConfig::default(),
        }
    }
}

/// Fans alerts out to the configured channels, guarding each channel
/// with its own circuit breaker and deduplicating via the cooldown
/// manager. Components nominate alerts; this is where suppression
/// and delivery are decided.
pub struct AlertNotifier {
    channels: Vec<Box<dyn AlertChannel>>,
    breakers: Vec<CircuitBreaker>,
    history: AlertHistory,
    cooldowns: AlertCooldownManager,
    config: AlertNotifierConfig,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl AlertNotifier {
    pub fn new(
        channels: Vec<Box<dyn AlertChannel>>,
        config: AlertNotifierConfig,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Self {
        let breakers = channels
            .iter()
            .map(|channel| {
                CircuitBreaker::new(channel.name().to_string(), config.channel_breaker.clone())
            })
            .collect();

        AlertNotifier {
            breakers,
            history: AlertHistory::new(config.history_size),
            cooldowns: AlertCooldownManager::new(config.cooldown.clone()),
            channels,
            config,
            clock,
        }
    }

    /// Records the alert in the history ring and, when the cooldown
    /// allows, delivers it to every channel whose breaker admits the
    /// call. Returns true when the alert was dispatched to at least
    /// one channel.
    pub async fn notify(&mut self, alert: Alert) -> bool {
        let now = self.clock.now_ms();
        let cooldown_key = alert.cooldown_key();
        self.history.push(alert.clone());

        if self.channels.is_empty() {
            // The coordinator already logs alert nominations at WARN;
            // logging here again at WARN would double every alert in
            // the logs of channel-less deployments.
            debug!(
                alert_type = %alert.alert_type,
                "no alert channels configured, alert stored in history only"
            );
            return false;
        }

        if !self.cooldowns.should_send_and_record(&cooldown_key, now) {
            return false;
        }

        let mut dispatched = false;
        for (channel, breaker) in self.channels.iter().zip(self.breakers.iter_mut()) {
            let now = self.clock.now_ms();
            if !breaker.allow_request(now) {
                debug!(
                    channel = channel.name(),
                    "alert channel circuit breaker open, skipping send"
                );
                continue;
            }

            match send_with_retries(channel.as_ref(), &alert, &self.config).await {
                Ok(()) => {
                    breaker.record_success();
                    dispatched = true;
                }
                Err(err) => {
                    warn!(
                        channel = channel.name(),
                        "failed to deliver alert: {err}"
                    );
                    breaker.record_failure(self.clock.now_ms());
                }
            }
        }

        dispatched
    }

    /// The most recent alerts, newest first.
    pub fn history(&self, limit: usize) -> Vec<Alert> {
        self.history.newest_first(limit)
    }

    /// Runs a cooldown cleanup sweep; called from the coordinator's
    /// maintenance task.
    pub fn cleanup_cooldowns(&mut self) -> usize {
        self.cooldowns.cleanup(self.clock.now_ms())
    }
}

async fn send_with_retries(
    channel: &dyn AlertChannel,
    alert: &Alert,
    config: &AlertNotifierConfig,
) -> Result<(), ChannelSendError> {
    let mut attempt: u32 = 0;
    loop {
        match channel.send(alert).await {
            Ok(()) => return Ok(()),
            Err(err) if attempt < config.send_retries => {
                let wait_ms = backoff_wait_time_ms(&config.send_backoff, attempt);
                debug!(
                    channel = channel.name(),
                    attempt,
                    wait_ms,
                    "alert send failed, retrying: {err}"
                );
                tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AlertSeverity;
    use arbflow_helpers::time::ManualClock;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    struct RecordingChannel {
        name: String,
        sent: Arc<Mutex<Vec<Alert>>>,
        fail_times: Arc<Mutex<u32>>,
    }

    impl RecordingChannel {
        fn new(name: &str) -> (Self, Arc<Mutex<Vec<Alert>>>, Arc<Mutex<u32>>) {
            let sent = Arc::new(Mutex::new(Vec::new()));
            let fail_times = Arc::new(Mutex::new(0));
            (
                RecordingChannel {
                    name: name.to_string(),
                    sent: sent.clone(),
                    fail_times: fail_times.clone(),
                },
                sent,
                fail_times,
            )
        }
    }

    #[async_trait]
    impl AlertChannel for RecordingChannel {
        fn name(&self) -> &str {
            &self.name
        }

        async fn send(&self, alert: &Alert) -> Result<(), ChannelSendError> {
            let mut fail_times = self.fail_times.lock().unwrap();
            if *fail_times > 0 {
                *fail_times -= 1;
                return Err(ChannelSendError::new("forced failure"));
            }
            self.sent.lock().unwrap().push(alert.clone());
            Ok(())
        }
    }

    fn test_config() -> AlertNotifierConfig {
        AlertNotifierConfig {
            history_size: 4,
            channel_breaker: CircuitBreakerConfig {
                failure_threshold: 2,
                reset_timeout_ms: 60_000,
            },
            send_retries: 0,
            send_backoff: BackoffConfig {
                base_delay_ms: 1,
                backoff_rate: 1.0,
                max_delay_ms: Some(1),
                jitter: false,
            },
            cooldown: AlertCooldownConfig {
                cooldown_ms: 1_000,
                max_age_ms: 3_600_000,
                cleanup_threshold: 1_000,
            },
        }
    }

    fn alert(alert_type: &str, timestamp: u64) -> Alert {
        Alert::new(alert_type, AlertSeverity::Warning, "something happened", timestamp)
    }

    #[test]
    fn test_history_ring_wraps_and_returns_newest_first() {
        let mut history = AlertHistory::new(3);
        for index in 0..5 {
            history.push(alert(&format!("A{index}"), index));
        }

        assert_eq!(history.len(), 3);
        let newest = history.newest_first(10);
        let types: Vec<String> = newest.into_iter().map(|a| a.alert_type).collect();
        assert_eq!(types, vec!["A4", "A3", "A2"]);

        let limited = history.newest_first(1);
        assert_eq!(limited[0].alert_type, "A4");
    }

    #[test_log::test(tokio::test)]
    async fn test_notify_delivers_and_applies_cooldown() {
        let clock = Arc::new(ManualClock::new(10_000));
        let (channel, sent, _) = RecordingChannel::new("discord");
        let mut notifier =
            AlertNotifier::new(vec![Box::new(channel)], test_config(), clock.clone());

        assert!(notifier.notify(alert("SERVICE_UNHEALTHY", 10_000)).await);
        // Inside the cooldown window the same alert key is suppressed.
        assert!(!notifier.notify(alert("SERVICE_UNHEALTHY", 10_100)).await);

        clock.advance(1_001);
        assert!(notifier.notify(alert("SERVICE_UNHEALTHY", 11_001)).await);

        assert_eq!(sent.lock().unwrap().len(), 2);
        // Suppressed alerts still land in the history ring.
        assert_eq!(notifier.history(10).len(), 3);
    }

    #[test_log::test(tokio::test)]
    async fn test_channel_breaker_opens_and_recovers() {
        let clock = Arc::new(ManualClock::new(10_000));
        let (channel, sent, fail_times) = RecordingChannel::new("slack");
        let mut notifier =
            AlertNotifier::new(vec![Box::new(channel)], test_config(), clock.clone());

        *fail_times.lock().unwrap() = 2;
        assert!(!notifier.notify(alert("A", 10_000)).await);
        clock.advance(2_000);
        assert!(!notifier.notify(alert("B", 12_000)).await);

        // Two failures opened the breaker; the next alert is skipped
        // without reaching the channel.
        clock.advance(2_000);
        assert!(!notifier.notify(alert("C", 14_000)).await);
        assert_eq!(*fail_times.lock().unwrap(), 0);
        assert!(sent.lock().unwrap().is_empty());

        // After the reset timeout a probe goes through and closes
        // the breaker.
        clock.advance(60_000);
        assert!(notifier.notify(alert("D", 74_000)).await);
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_no_channels_stores_history_only() {
        let clock = Arc::new(ManualClock::new(10_000));
        let mut notifier = AlertNotifier::new(vec![], test_config(), clock);

        assert!(!notifier.notify(alert("A", 10_000)).await);
        assert_eq!(notifier.history(10).len(), 1);
    }
}
