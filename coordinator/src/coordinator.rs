use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use arbflow_helpers::{
    consumers::{HandlerError, MessageHandler, StreamMessage},
    redis::StreamsClient,
    time::Clock,
};
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::json;
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
    time::{interval, Instant},
};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    active_pairs::ActivePairsTracker,
    alerts::{AlertChannel, AlertNotifier, WebhookChannel, WebhookFormat},
    config::CoordinatorConfig,
    consts::{
        ALERT_WHALE_MOVEMENT, COORDINATOR_GROUP, FAST_LANE_STREAM, HEALTH_STREAM,
        OPPORTUNITIES_STREAM, PRICE_UPDATES_STREAM, SWAP_EVENTS_STREAM,
        VOLUME_AGGREGATES_STREAM, WHALE_ALERTS_STREAM,
    },
    errors::CoordinatorStartError,
    health::HealthMonitor,
    leadership::LeaderElection,
    messages::{parse_stream_payload, PayloadError, StreamPayload},
    router::{OpportunityRouter, RouterStats},
    stream_consumer::StreamConsumerManager,
    types::{Alert, AlertSeverity, DegradationLevel, HealthMetrics},
};

/// Counters for the informational streams the coordinator tracks
/// without a dedicated domain handler.
#[derive(Debug, Default)]
struct DispatchStats {
    volume_aggregates: AtomicU64,
    price_updates: AtomicU64,
}

/// Routes decoded stream payloads to their domain owners. One
/// dispatcher instance serves every attached stream; the payload type
/// is derived from the stream name.
struct CoordinatorDispatcher {
    health: Arc<Mutex<HealthMonitor>>,
    router: Arc<Mutex<OpportunityRouter>>,
    pairs: Arc<Mutex<ActivePairsTracker>>,
    alert_tx: mpsc::UnboundedSender<Alert>,
    leadership_rx: watch::Receiver<bool>,
    clock: Arc<dyn Clock + Send + Sync>,
    stats: DispatchStats,
}

#[async_trait]
impl MessageHandler for CoordinatorDispatcher {
    async fn handle(&self, stream: &str, message: &StreamMessage) -> Result<(), HandlerError> {
        let payload = match parse_stream_payload(stream, message) {
            Ok(payload) => payload,
            // Entries with no payload have nothing to replay; they
            // are acknowledged without a dead letter record.
            Err(PayloadError::Empty) => {
                debug!(stream, message_id = %message.id, "ignoring empty stream entry");
                return Ok(());
            }
            Err(err) => return Err(HandlerError::failure(err.to_string())),
        };

        match payload {
            StreamPayload::StreamInit => {
                debug!(stream, "acknowledging stream-init system message");
            }
            StreamPayload::Health(report) => {
                self.health.lock().await.record_heartbeat(*report);
            }
            StreamPayload::Opportunity(opportunity) => {
                let is_leader = *self.leadership_rx.borrow();
                self.router
                    .lock()
                    .await
                    .process_opportunity(*opportunity, is_leader)
                    .await;
            }
            StreamPayload::SwapEvent(event) => {
                self.pairs
                    .lock()
                    .await
                    .track_pair(&event.pair_address, &event.chain, &event.dex);
            }
            StreamPayload::WhaleAlert(whale) => {
                let alert = Alert::new(
                    ALERT_WHALE_MOVEMENT,
                    AlertSeverity::Info,
                    format!(
                        "whale movement of ${:.0} in {} on {}",
                        whale.amount_usd, whale.token, whale.chain
                    ),
                    self.clock.now_ms(),
                )
                .with_data(json!({
                    "token": whale.token,
                    "chain": whale.chain,
                    "amountUsd": whale.amount_usd,
                    "txHash": whale.tx_hash,
                }));
                let _ = self.alert_tx.send(alert);
            }
            StreamPayload::VolumeAggregate(aggregate) => {
                self.stats.volume_aggregates.fetch_add(1, Ordering::Relaxed);
                debug!(
                    pair = %aggregate.pair_address,
                    volume_usd = aggregate.volume_usd,
                    "volume aggregate tracked"
                );
            }
            StreamPayload::PriceUpdate(update) => {
                self.stats.price_updates.fetch_add(1, Ordering::Relaxed);
                debug!(
                    token = %update.token,
                    price_usd = update.price_usd,
                    "price update tracked"
                );
            }
        }

        Ok(())
    }
}

/// A point-in-time view of the coordinator for the HTTP surface.
#[derive(Debug, Clone)]
pub struct CoordinatorStatus {
    pub instance_id: String,
    pub is_leader: bool,
    pub degradation_level: DegradationLevel,
    pub metrics: HealthMetrics,
    pub router_stats: RouterStats,
}

/// The control plane service: attaches one consumer per event stream,
/// elects a leader across replicas, supervises worker health and
/// forwards validated opportunities to the execution engine.
pub struct Coordinator {
    client: Arc<dyn StreamsClient>,
    config: CoordinatorConfig,
    instance_id: String,
    manager: Arc<StreamConsumerManager>,
    dispatcher: Arc<CoordinatorDispatcher>,
    health: Arc<Mutex<HealthMonitor>>,
    router: Arc<Mutex<OpportunityRouter>>,
    pairs: Arc<Mutex<ActivePairsTracker>>,
    election: Arc<LeaderElection>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    alert_rx: Mutex<Option<mpsc::UnboundedReceiver<Alert>>>,
    notifier: Mutex<Option<AlertNotifier>>,
    stopped: AtomicBool,
}

impl Coordinator {
    pub fn new(
        client: Arc<dyn StreamsClient>,
        clock: Arc<dyn Clock + Send + Sync>,
        config: CoordinatorConfig,
    ) -> Self {
        let instance_id = format!("{}-{}", config.hostname, clock.now_ms());
        let (alert_tx, alert_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(8);

        let mut channels: Vec<Box<dyn AlertChannel>> = Vec::new();
        if let Some(url) = &config.discord_webhook_url {
            channels.push(Box::new(WebhookChannel::new(
                "discord",
                url.clone(),
                WebhookFormat::Discord,
            )));
        }
        if let Some(url) = &config.slack_webhook_url {
            channels.push(Box::new(WebhookChannel::new(
                "slack",
                url.clone(),
                WebhookFormat::Slack,
            )));
        }
        let notifier = AlertNotifier::new(channels, config.notifier.clone(), clock.clone());

        let mut consumer_config = config.consumer.clone();
        consumer_config.instance_id = instance_id.clone();
        consumer_config.consumer_name = instance_id.clone();
        let manager = Arc::new(StreamConsumerManager::new(
            client.clone(),
            clock.clone(),
            consumer_config,
            alert_tx.clone(),
        ));

        let health = Arc::new(Mutex::new(HealthMonitor::new(
            config.health.clone(),
            clock.clone(),
            alert_tx.clone(),
        )));
        let router = Arc::new(Mutex::new(OpportunityRouter::new(
            client.clone(),
            clock.clone(),
            config.router.clone(),
        )));
        let pairs = Arc::new(Mutex::new(ActivePairsTracker::new(
            config.active_pairs.clone(),
            clock.clone(),
        )));
        let election = Arc::new(LeaderElection::new(
            client.clone(),
            clock.clone(),
            config.leadership.clone(),
            instance_id.clone(),
            alert_tx.clone(),
        ));

        let dispatcher = Arc::new(CoordinatorDispatcher {
            health: health.clone(),
            router: router.clone(),
            pairs: pairs.clone(),
            alert_tx,
            leadership_rx: election.subscribe(),
            clock,
            stats: DispatchStats::default(),
        });

        Coordinator {
            client,
            config,
            instance_id,
            manager,
            dispatcher,
            health,
            router,
            pairs,
            election,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            alert_rx: Mutex::new(Some(alert_rx)),
            notifier: Mutex::new(Some(notifier)),
            stopped: AtomicBool::new(false),
        }
    }

    /// The streams this coordinator attaches consumers to.
    fn streams(&self) -> Vec<&'static str> {
        let mut streams = vec![
            HEALTH_STREAM,
            OPPORTUNITIES_STREAM,
            WHALE_ALERTS_STREAM,
            SWAP_EVENTS_STREAM,
            VOLUME_AGGREGATES_STREAM,
            PRICE_UPDATES_STREAM,
        ];
        if self.config.feature_fast_lane {
            streams.push(FAST_LANE_STREAM);
        }
        streams
    }

    /// Bootstraps consumer groups, recovers orphaned messages from
    /// crashed peers, and spawns the long-running tasks.
    #[instrument(name = "coordinator_start", skip(self), fields(instance_id = %self.instance_id))]
    pub async fn start(self: Arc<Self>) -> Result<(), CoordinatorStartError> {
        let streams = self.streams();
        for stream in &streams {
            self.client
                .create_consumer_group(stream, COORDINATOR_GROUP)
                .await?;
        }

        let groups: Vec<(String, String)> = streams
            .iter()
            .map(|stream| (stream.to_string(), COORDINATOR_GROUP.to_string()))
            .collect();
        let recovered = self.manager.recover_pending_messages(&groups).await;
        if recovered > 0 {
            info!(recovered, "recovered orphaned messages on startup");
        }

        self.health.lock().await.start();

        let mut tasks = self.tasks.lock().await;
        for stream in streams {
            let coordinator = self.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                coordinator.run_consume_loop(stream, shutdown_rx).await;
            }));
        }

        let election = self.election.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            election.run(shutdown_rx).await;
        }));

        let notifier = self
            .notifier
            .lock()
            .await
            .take()
            .expect("coordinator already started");
        let alert_rx = self
            .alert_rx
            .lock()
            .await
            .take()
            .expect("coordinator already started");
        let shutdown_rx = self.shutdown_tx.subscribe();
        let cleanup_interval_ms = self.config.maintenance_interval_ms;
        tasks.push(tokio::spawn(async move {
            run_alert_pipeline(notifier, alert_rx, shutdown_rx, cleanup_interval_ms).await;
        }));

        let coordinator = self.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            coordinator.run_maintenance(shutdown_rx).await;
        }));

        info!("coordinator started");
        Ok(())
    }

    async fn run_consume_loop(&self, stream: &'static str, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(stream, "stream consumer attached");
        loop {
            let started = Instant::now();

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(stream, "received shutdown signal, stopping stream consumer");
                    break;
                }
                _ = self.drain_stream_once(stream) => {}
            }

            // Time already spent reading and handling counts towards
            // the polling interval.
            let elapsed_ms = started.elapsed().as_millis() as u64;
            let wait_ms = self.config.polling_wait_time_ms.saturating_sub(elapsed_ms);
            if wait_ms > 0 {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!(stream, "received shutdown signal, stopping stream consumer");
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(wait_ms)) => {}
                }
            }
        }
    }

    /// Reads one batch from a stream and runs each message through
    /// the wrapped pipeline. Returns the number of messages handled.
    pub async fn drain_stream_once(&self, stream: &str) -> usize {
        let read_result = self
            .client
            .xread_group(
                stream,
                COORDINATOR_GROUP,
                &self.instance_id,
                self.config.read_count,
                self.config.block_time_ms,
            )
            .await;

        let messages = match read_result {
            Ok(messages) => messages,
            Err(err) => {
                error!(stream, "failed to read from stream: {err}");
                self.manager.track_error(stream);
                return 0;
            }
        };

        if self.manager.error_count() > 0 {
            self.manager.reset_errors();
        }

        for message in &messages {
            self.manager
                .process_message(
                    stream,
                    COORDINATOR_GROUP,
                    message,
                    self.dispatcher.as_ref(),
                )
                .await;
        }
        messages.len()
    }

    async fn run_maintenance(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut health_tick = interval(Duration::from_millis(
            self.config.health_evaluation_interval_ms,
        ));
        let mut maintenance_tick =
            interval(Duration::from_millis(self.config.maintenance_interval_ms));

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("received shutdown signal, stopping maintenance task");
                    break;
                }
                _ = health_tick.tick() => {
                    self.health.lock().await.evaluate();
                }
                _ = maintenance_tick.tick() => {
                    let removed = self.router.lock().await.cleanup_expired_opportunities();
                    let pairs_removed = self.pairs.lock().await.cleanup();
                    debug!(
                        expired_opportunities = removed,
                        expired_pairs = pairs_removed,
                        "maintenance sweep complete"
                    );
                }
            }
        }
    }

    /// Stops the coordinator: new reads stop, in-flight handlers get
    /// the shutdown budget, then the leadership lease is released.
    /// Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            debug!("coordinator stop called again, ignoring");
            return;
        }

        info!("stopping coordinator");
        let _ = self.shutdown_tx.send(());

        let budget = Duration::from_millis(self.config.shutdown_ack_timeout_ms);
        let mut tasks = self.tasks.lock().await;
        join_all(tasks.drain(..).map(|mut task| async move {
            if tokio::time::timeout(budget, &mut task).await.is_err() {
                warn!("task exceeded the shutdown budget, abandoning it");
                task.abort();
            }
        }))
        .await;

        self.election.stop().await;
        info!("coordinator stopped");
    }

    /// Allows a standby replica to start competing for leadership.
    pub async fn activate_standby(&self) -> bool {
        self.election.activate_standby().await
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// A snapshot of coordinator state for the HTTP surface.
    pub async fn status(&self) -> CoordinatorStatus {
        let health = self.health.lock().await;
        let router = self.router.lock().await;
        CoordinatorStatus {
            instance_id: self.instance_id.clone(),
            is_leader: self.is_leader(),
            degradation_level: health.degradation_level(),
            metrics: health.metrics(),
            router_stats: router.stats(),
        }
    }
}

// The coordinator is the platform's single WARN-level source for
// alert nominations; the notifier itself only logs channel plumbing.
fn log_alert(alert: &Alert) {
    match alert.severity {
        AlertSeverity::Critical => {
            error!(
                alert_type = %alert.alert_type,
                service = alert.service.as_deref().unwrap_or("system"),
                "{}",
                alert.message
            );
        }
        AlertSeverity::High | AlertSeverity::Warning => {
            warn!(
                alert_type = %alert.alert_type,
                service = alert.service.as_deref().unwrap_or("system"),
                "{}",
                alert.message
            );
        }
        AlertSeverity::Low | AlertSeverity::Info => {
            info!(
                alert_type = %alert.alert_type,
                service = alert.service.as_deref().unwrap_or("system"),
                "{}",
                alert.message
            );
        }
    }
}

async fn run_alert_pipeline(
    mut notifier: AlertNotifier,
    mut alert_rx: mpsc::UnboundedReceiver<Alert>,
    mut shutdown_rx: broadcast::Receiver<()>,
    cleanup_interval_ms: u64,
) {
    let mut cleanup_tick = interval(Duration::from_millis(cleanup_interval_ms));
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("received shutdown signal, stopping alert pipeline");
                break;
            }
            maybe_alert = alert_rx.recv() => {
                match maybe_alert {
                    Some(alert) => {
                        log_alert(&alert);
                        notifier.notify(alert).await;
                    }
                    None => break,
                }
            }
            _ = cleanup_tick.tick() => {
                notifier.cleanup_cooldowns();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::{DEAD_LETTER_STREAM, EXECUTION_REQUESTS_STREAM};
    use arbflow_helpers::{testing::FakeStreamsClient, time::ManualClock};
    use pretty_assertions::assert_eq;

    fn coordinator() -> (Arc<Coordinator>, Arc<FakeStreamsClient>, Arc<ManualClock>) {
        let client = Arc::new(FakeStreamsClient::new());
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let config = CoordinatorConfig {
            hostname: "coord-test".to_string(),
            ..CoordinatorConfig::default()
        };
        let coordinator = Arc::new(Coordinator::new(client.clone(), clock.clone(), config));
        (coordinator, client, clock)
    }

    async fn bootstrap_groups(coordinator: &Coordinator, client: &FakeStreamsClient) {
        for stream in coordinator.streams() {
            client
                .create_consumer_group(stream, COORDINATOR_GROUP)
                .await
                .unwrap();
        }
    }

    fn opportunity_payload(id: &str, timestamp: u64) -> String {
        format!(
            r#"{{
                "id": "{id}",
                "type": "cross-dex",
                "tokenIn": "WETH",
                "tokenOut": "USDC",
                "amountIn": "1000000000000000000",
                "profitPercentage": 0.8,
                "confidence": 0.9,
                "timestamp": {timestamp},
                "status": "pending"
            }}"#
        )
    }

    #[test_log::test(tokio::test)]
    async fn test_health_reports_flow_into_the_monitor() {
        let (coordinator, client, _clock) = coordinator();
        bootstrap_groups(&coordinator, &client).await;

        client
            .xadd(
                HEALTH_STREAM,
                &[(
                    "data".to_string(),
                    r#"{
                        "name": "detector-evm",
                        "status": "healthy",
                        "uptime": 60,
                        "memoryUsage": 128.0,
                        "cpuUsage": 5.0,
                        "lastHeartbeat": 1700000000000
                    }"#
                    .to_string(),
                )],
            )
            .await
            .unwrap();

        let handled = coordinator.drain_stream_once(HEALTH_STREAM).await;
        assert_eq!(handled, 1);

        let health = coordinator.health.lock().await;
        assert!(health.services_snapshot().contains_key("detector-evm"));
        assert!(health.has_received_heartbeat("detector-evm"));
    }

    #[test_log::test(tokio::test)]
    async fn test_leader_forwards_opportunities_to_execution_stream() {
        let (coordinator, client, clock) = coordinator();
        bootstrap_groups(&coordinator, &client).await;

        // Become leader first; otherwise routing stores but does not
        // forward.
        coordinator.election.run_heartbeat().await;
        assert!(coordinator.is_leader());

        client
            .xadd(
                OPPORTUNITIES_STREAM,
                &[(
                    "data".to_string(),
                    opportunity_payload("O1", clock.now_ms()),
                )],
            )
            .await
            .unwrap();

        let handled = coordinator.drain_stream_once(OPPORTUNITIES_STREAM).await;
        assert_eq!(handled, 1);
        assert_eq!(client.entries(EXECUTION_REQUESTS_STREAM).len(), 1);

        let status = coordinator.status().await;
        assert!(status.is_leader);
        assert_eq!(status.router_stats.opportunities_forwarded, 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_non_leader_stores_without_forwarding() {
        let (coordinator, client, clock) = coordinator();
        bootstrap_groups(&coordinator, &client).await;

        client
            .xadd(
                OPPORTUNITIES_STREAM,
                &[(
                    "data".to_string(),
                    opportunity_payload("O1", clock.now_ms()),
                )],
            )
            .await
            .unwrap();

        coordinator.drain_stream_once(OPPORTUNITIES_STREAM).await;
        assert!(client.entries(EXECUTION_REQUESTS_STREAM).is_empty());
        assert_eq!(
            coordinator.router.lock().await.stats().total_opportunities,
            1
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_malformed_payload_is_dead_lettered_and_acked() {
        let (coordinator, client, _clock) = coordinator();
        bootstrap_groups(&coordinator, &client).await;

        client
            .xadd(
                OPPORTUNITIES_STREAM,
                &[("data".to_string(), "{broken".to_string())],
            )
            .await
            .unwrap();

        coordinator.drain_stream_once(OPPORTUNITIES_STREAM).await;

        assert_eq!(client.entries(DEAD_LETTER_STREAM).len(), 1);
        assert!(client
            .pending_owners(OPPORTUNITIES_STREAM, COORDINATOR_GROUP)
            .is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_stream_init_messages_are_silently_acked() {
        let (coordinator, client, _clock) = coordinator();
        bootstrap_groups(&coordinator, &client).await;

        client
            .xadd(
                SWAP_EVENTS_STREAM,
                &[("type".to_string(), "stream-init".to_string())],
            )
            .await
            .unwrap();

        coordinator.drain_stream_once(SWAP_EVENTS_STREAM).await;

        assert!(client.entries(DEAD_LETTER_STREAM).is_empty());
        assert!(client
            .pending_owners(SWAP_EVENTS_STREAM, COORDINATOR_GROUP)
            .is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_swap_events_update_active_pairs() {
        let (coordinator, client, _clock) = coordinator();
        bootstrap_groups(&coordinator, &client).await;

        client
            .xadd(
                SWAP_EVENTS_STREAM,
                &[(
                    "data".to_string(),
                    r#"{
                        "pairAddress": "0xabc",
                        "chain": "base",
                        "dex": "aerodrome",
                        "timestamp": 1700000000000
                    }"#
                    .to_string(),
                )],
            )
            .await
            .unwrap();

        coordinator.drain_stream_once(SWAP_EVENTS_STREAM).await;
        assert!(coordinator.pairs.lock().await.has("0xabc"));
    }

    #[test_log::test(tokio::test)]
    async fn test_read_errors_feed_burst_tracking_and_recovery() {
        let (coordinator, client, _clock) = coordinator();
        bootstrap_groups(&coordinator, &client).await;

        // Reads themselves cannot fail in the fake, so drive the
        // manager directly the way the consume loop does.
        coordinator.manager.track_error(OPPORTUNITIES_STREAM);
        assert_eq!(coordinator.manager.error_count(), 1);

        // A successful pass resets the burst.
        client
            .xadd(
                SWAP_EVENTS_STREAM,
                &[("type".to_string(), "stream-init".to_string())],
            )
            .await
            .unwrap();
        coordinator.drain_stream_once(SWAP_EVENTS_STREAM).await;
        assert_eq!(coordinator.manager.error_count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_stop_is_idempotent() {
        let (coordinator, _client, _clock) = coordinator();

        coordinator.stop().await;
        coordinator.stop().await;
        assert!(!coordinator.is_leader());
    }

    #[test_log::test(tokio::test)]
    async fn test_fast_lane_stream_attached_only_with_feature_flag() {
        let client = Arc::new(FakeStreamsClient::new());
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));

        let config = CoordinatorConfig::default();
        let coordinator = Coordinator::new(client.clone(), clock.clone(), config);
        assert!(!coordinator.streams().contains(&FAST_LANE_STREAM));

        let config = CoordinatorConfig {
            feature_fast_lane: true,
            ..CoordinatorConfig::default()
        };
        let coordinator = Coordinator::new(client, clock, config);
        assert!(coordinator.streams().contains(&FAST_LANE_STREAM));
    }
}
