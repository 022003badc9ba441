use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use arbflow_helpers::{
    consumers::{DlqRecord, StreamMessage},
    opportunities::{validate_opportunity_message, Opportunity, ValidationOutcome},
    redis::StreamsClient,
    streams::{DEAD_LETTER_STREAM, EXECUTION_ENGINE_GROUP, EXECUTION_REQUESTS_STREAM},
    time::Clock,
};
use tokio::{
    sync::{broadcast, mpsc},
    time::interval,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::ExecutionEngineConfig,
    queue::{EnqueueError, ExecutionQueue},
    workers::CompletionEvent,
};

/// A forwarded opportunity whose stream message is awaiting its
/// deferred acknowledgment. Keyed by opportunity ID so upstream
/// redelivery cannot leak broker-side pending entries.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub stream_name: String,
    pub group_name: String,
    pub message_id: String,
    pub queued_at: u64,
}

/// How the consumer resolved one delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Queued for execution; the ACK is deferred until completion.
    Queued,
    /// A policy rejection or system message, acknowledged silently.
    Rejected,
    /// Structurally invalid, dead-lettered and acknowledged.
    DeadLettered,
    /// A redelivery of an in-flight opportunity; the prior message
    /// was acknowledged and this one took over its pending slot.
    Replaced,
    /// The execution queue is full; the message stays pending for
    /// redelivery once the queue drains.
    Backpressure,
}

/// Consumes forwarded opportunities from the execution-requests
/// stream with deferred acknowledgment: a message is only ACKed once
/// its opportunity has finished executing, been rejected by policy,
/// or been dead-lettered. In-flight work survives a crash as
/// broker-side pending entries that a peer reclaims.
pub struct ExecutionEngineConsumer {
    client: Arc<dyn StreamsClient>,
    clock: Arc<dyn Clock + Send + Sync>,
    config: ExecutionEngineConfig,
    consumer_name: String,
    queue: ExecutionQueue,
    pending: Mutex<HashMap<String, PendingMessage>>,
    active: Mutex<HashSet<String>>,
    stopped: AtomicBool,
}

impl ExecutionEngineConsumer {
    pub fn new(
        client: Arc<dyn StreamsClient>,
        clock: Arc<dyn Clock + Send + Sync>,
        config: ExecutionEngineConfig,
        queue: ExecutionQueue,
    ) -> Self {
        let consumer_name = format!("{}-{}", config.hostname, clock.now_ms());
        ExecutionEngineConsumer {
            client,
            clock,
            config,
            consumer_name,
            queue,
            pending: Mutex::new(HashMap::new()),
            active: Mutex::new(HashSet::new()),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    /// Runs the consume loop: reads while the queue is accepting,
    /// applies completions, and sweeps stale pending entries.
    pub async fn run(
        self: Arc<Self>,
        mut completion_rx: mpsc::UnboundedReceiver<CompletionEvent>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut pause_rx = self.queue.pause_signal();
        let mut stale_tick = interval(Duration::from_millis(self.config.stale_sweep_interval_ms));
        info!(consumer = %self.consumer_name, "execution engine consumer attached");

        loop {
            let paused = *pause_rx.borrow();

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("received shutdown signal, stopping execution consumer");
                    break;
                }
                maybe_event = completion_rx.recv() => {
                    match maybe_event {
                        Some(event) => self.mark_complete(&event.opportunity_id).await,
                        None => break,
                    }
                }
                _ = stale_tick.tick() => {
                    self.cleanup_stale_pending().await;
                }
                changed = pause_rx.changed() => {
                    if changed.is_err() {
                        continue;
                    }
                    let paused_now = *pause_rx.borrow();
                    if self.stopped.load(Ordering::SeqCst) {
                        debug!(paused = paused_now, "ignoring queue signal after stop");
                    } else if paused_now {
                        info!("execution queue full, pausing stream reads");
                    } else {
                        info!("execution queue drained, resuming stream reads");
                    }
                }
                _ = self.consume_once(), if !paused => {}
            }
        }
    }

    async fn consume_once(&self) {
        let messages = match self
            .client
            .xread_group(
                EXECUTION_REQUESTS_STREAM,
                EXECUTION_ENGINE_GROUP,
                &self.consumer_name,
                self.config.read_count,
                self.config.block_time_ms,
            )
            .await
        {
            Ok(messages) => messages,
            Err(err) => {
                error!("failed to read execution requests: {err}");
                tokio::time::sleep(Duration::from_millis(self.config.polling_wait_time_ms))
                    .await;
                return;
            }
        };

        if messages.is_empty() {
            tokio::time::sleep(Duration::from_millis(self.config.polling_wait_time_ms)).await;
            return;
        }

        for message in &messages {
            self.handle_message(message).await;
        }
    }

    /// Runs one delivered message through the validation pipeline.
    ///
    /// Structural failures are dead-lettered and acknowledged;
    /// policy rejections are acknowledged silently; backpressure
    /// leaves the message pending for redelivery.
    pub async fn handle_message(&self, message: &StreamMessage) -> ConsumeOutcome {
        match validate_opportunity_message(message) {
            ValidationOutcome::System | ValidationOutcome::Empty => {
                self.ack(&message.id).await;
                ConsumeOutcome::Rejected
            }
            ValidationOutcome::Reject { code, details } => {
                self.write_dlq(message, code, &details).await;
                self.ack(&message.id).await;
                ConsumeOutcome::DeadLettered
            }
            ValidationOutcome::Ok(opportunity) => {
                self.handle_opportunity(*opportunity, message).await
            }
        }
    }

    async fn handle_opportunity(
        &self,
        opportunity: Opportunity,
        message: &StreamMessage,
    ) -> ConsumeOutcome {
        if opportunity.confidence < self.config.min_confidence {
            debug!(
                opportunity_id = %opportunity.id,
                confidence = opportunity.confidence,
                "rejecting low-confidence opportunity"
            );
            self.ack(&message.id).await;
            return ConsumeOutcome::Rejected;
        }

        if opportunity.profit_percentage.unwrap_or(0.0) < self.config.min_profit_percentage {
            debug!(
                opportunity_id = %opportunity.id,
                "rejecting opportunity below the profit floor"
            );
            self.ack(&message.id).await;
            return ConsumeOutcome::Rejected;
        }

        // Upstream redelivery of an in-flight opportunity: the new
        // message takes over the pending slot and the prior message
        // is acknowledged so only one PEL entry tracks the work.
        let prior_message_id = {
            let mut pending = self.pending.lock().unwrap();
            match pending.get(&opportunity.id) {
                Some(prior) => {
                    let prior_id = prior.message_id.clone();
                    pending.insert(
                        opportunity.id.clone(),
                        self.pending_record(&message.id),
                    );
                    Some(prior_id)
                }
                None => None,
            }
        };
        if let Some(prior_id) = prior_message_id {
            if let Err(err) = self
                .client
                .xack(EXECUTION_REQUESTS_STREAM, EXECUTION_ENGINE_GROUP, &prior_id)
                .await
            {
                warn!(
                    opportunity_id = %opportunity.id,
                    prior_message_id = %prior_id,
                    "failed to acknowledge replaced pending message: {err}"
                );
            }
            return ConsumeOutcome::Replaced;
        }

        // The insert is the duplicate gate: two deliveries of the
        // same opportunity racing past the pending check cannot both
        // claim the execution slot.
        if !self.active.lock().unwrap().insert(opportunity.id.clone()) {
            debug!(
                opportunity_id = %opportunity.id,
                "rejecting duplicate of an in-flight opportunity"
            );
            self.ack(&message.id).await;
            return ConsumeOutcome::Rejected;
        }

        match self.queue.try_enqueue(opportunity.clone()) {
            Ok(()) => {
                self.pending.lock().unwrap().insert(
                    opportunity.id.clone(),
                    self.pending_record(&message.id),
                );
                ConsumeOutcome::Queued
            }
            Err(EnqueueError::Full) | Err(EnqueueError::Closed) => {
                self.active.lock().unwrap().remove(&opportunity.id);
                debug!(
                    opportunity_id = %opportunity.id,
                    "execution queue rejected the opportunity, leaving message pending"
                );
                ConsumeOutcome::Backpressure
            }
        }
    }

    fn pending_record(&self, message_id: &str) -> PendingMessage {
        PendingMessage {
            stream_name: EXECUTION_REQUESTS_STREAM.to_string(),
            group_name: EXECUTION_ENGINE_GROUP.to_string(),
            message_id: message_id.to_string(),
            queued_at: self.clock.now_ms(),
        }
    }

    /// Releases an opportunity's execution slot and acknowledges its
    /// pending message. An ACK failure keeps the pending record so
    /// shutdown reconciliation can retry the acknowledgment.
    pub async fn mark_complete(&self, opportunity_id: &str) {
        self.active.lock().unwrap().remove(opportunity_id);

        let entry = self
            .pending
            .lock()
            .unwrap()
            .get(opportunity_id)
            .cloned();
        let Some(entry) = entry else {
            return;
        };

        match self
            .client
            .xack(&entry.stream_name, &entry.group_name, &entry.message_id)
            .await
        {
            Ok(_) => {
                self.pending.lock().unwrap().remove(opportunity_id);
                debug!(opportunity_id, "execution complete, message acknowledged");
            }
            Err(err) => {
                warn!(
                    opportunity_id,
                    message_id = %entry.message_id,
                    "completion acknowledgment failed, keeping pending record: {err}"
                );
            }
        }
    }

    /// Force-acknowledges pending entries older than the configured
    /// max age so the broker-side pending list cannot leak, and
    /// releases their execution slots to avoid locking the
    /// opportunity out forever. Returns the number swept.
    pub async fn cleanup_stale_pending(&self) -> usize {
        let now = self.clock.now_ms();
        let max_age = self.config.pending_message_max_age_ms;
        let stale: Vec<(String, PendingMessage)> = {
            let pending = self.pending.lock().unwrap();
            pending
                .iter()
                .filter(|(_, entry)| now.saturating_sub(entry.queued_at) > max_age)
                .map(|(id, entry)| (id.clone(), entry.clone()))
                .collect()
        };

        for (opportunity_id, entry) in &stale {
            warn!(
                opportunity_id = %opportunity_id,
                message_id = %entry.message_id,
                age_ms = now.saturating_sub(entry.queued_at),
                "force-acknowledging stale pending message"
            );
            if let Err(err) = self
                .client
                .xack(&entry.stream_name, &entry.group_name, &entry.message_id)
                .await
            {
                error!(
                    message_id = %entry.message_id,
                    "failed to force-acknowledge stale pending message: {err}"
                );
            }
            self.pending.lock().unwrap().remove(opportunity_id);
            self.active.lock().unwrap().remove(opportunity_id);
        }

        stale.len()
    }

    /// Acknowledges completed-but-unacknowledged work during
    /// shutdown. Opportunities still executing keep their messages in
    /// the pending entries list so a restarted peer can reclaim them.
    pub async fn shutdown_ack(&self) -> usize {
        let completed: Vec<(String, PendingMessage)> = {
            let pending = self.pending.lock().unwrap();
            let active = self.active.lock().unwrap();
            pending
                .iter()
                .filter(|(opportunity_id, _)| !active.contains(*opportunity_id))
                .map(|(id, entry)| (id.clone(), entry.clone()))
                .collect()
        };

        for (opportunity_id, entry) in &completed {
            if let Err(err) = self
                .client
                .xack(&entry.stream_name, &entry.group_name, &entry.message_id)
                .await
            {
                error!(
                    message_id = %entry.message_id,
                    "failed to acknowledge completed message during shutdown: {err}"
                );
            }
            self.pending.lock().unwrap().remove(opportunity_id);
        }

        info!(
            acked = completed.len(),
            left_pending = self.pending.lock().unwrap().len(),
            "shutdown acknowledgment reconciliation complete"
        );
        completed.len()
    }

    /// Claims messages stranded by crashed peers and reprocesses
    /// them. Unlike the coordinator's recovery, reclaimed execution
    /// requests are re-run: execution state is recoverable where
    /// stale market data is not. A reprocess the queue cannot accept
    /// is acknowledged to avoid an infinite claim loop.
    pub async fn recover_orphaned_messages(&self) -> u64 {
        let mut recovered: u64 = 0;

        let summary = match self
            .client
            .xpending_summary(EXECUTION_REQUESTS_STREAM, EXECUTION_ENGINE_GROUP)
            .await
        {
            Ok(summary) => summary,
            Err(err) => {
                warn!("failed to read execution pending summary: {err}");
                return 0;
            }
        };

        for consumer in &summary.consumers {
            if consumer.name == self.consumer_name || consumer.pending == 0 {
                continue;
            }

            let entries = match self
                .client
                .xpending_range(
                    EXECUTION_REQUESTS_STREAM,
                    EXECUTION_ENGINE_GROUP,
                    &consumer.name,
                    self.config.orphan_claim_batch_size,
                )
                .await
            {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(
                        consumer = %consumer.name,
                        "failed to read execution pending entries: {err}"
                    );
                    continue;
                }
            };

            let eligible_ids: Vec<String> = entries
                .iter()
                .filter(|entry| entry.idle_ms >= self.config.orphan_claim_min_idle_ms)
                .take(self.config.orphan_claim_batch_size)
                .map(|entry| entry.message_id.clone())
                .collect();

            if eligible_ids.is_empty() {
                continue;
            }

            let claimed = match self
                .client
                .xclaim(
                    EXECUTION_REQUESTS_STREAM,
                    EXECUTION_ENGINE_GROUP,
                    &self.consumer_name,
                    self.config.orphan_claim_min_idle_ms,
                    &eligible_ids,
                )
                .await
            {
                Ok(claimed) => claimed,
                Err(err) => {
                    warn!(
                        consumer = %consumer.name,
                        "failed to claim orphaned execution requests: {err}"
                    );
                    continue;
                }
            };

            for message in &claimed {
                let outcome = self.handle_message(message).await;
                if outcome == ConsumeOutcome::Backpressure {
                    warn!(
                        message_id = %message.id,
                        "reprocessing reclaimed message failed, acknowledging to avoid a retry loop"
                    );
                    self.ack(&message.id).await;
                }
                recovered += 1;
            }

            info!(
                consumer = %consumer.name,
                claimed = claimed.len(),
                "reprocessed orphaned execution requests"
            );
        }

        recovered
    }

    /// Marks the consumer stopped; later queue signals are ignored.
    pub fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    async fn ack(&self, message_id: &str) {
        if let Err(err) = self
            .client
            .xack(EXECUTION_REQUESTS_STREAM, EXECUTION_ENGINE_GROUP, message_id)
            .await
        {
            error!(message_id, "failed to acknowledge message: {err}");
        }
    }

    async fn write_dlq(&self, message: &StreamMessage, code: &str, details: &str) {
        let record = DlqRecord {
            original_message_id: message.id.clone(),
            original_stream: EXECUTION_REQUESTS_STREAM.to_string(),
            original_data: serde_json::to_string(&message.fields)
                .unwrap_or_else(|_| "{}".to_string()),
            error: code.to_string(),
            error_stack: details.chars().take(500).collect(),
            timestamp: self.clock.now_ms(),
            service: "execution-engine".to_string(),
            instance_id: self.consumer_name.clone(),
        };

        let payload = match serde_json::to_string(&record) {
            Ok(payload) => payload,
            Err(err) => {
                error!("failed to serialize DLQ record: {err}");
                return;
            }
        };

        if let Err(err) = self
            .client
            .xadd(DEAD_LETTER_STREAM, &[("data".to_string(), payload)])
            .await
        {
            error!(
                message_id = %message.id,
                "failed to write execution DLQ record: {err}"
            );
        }
    }

    /// A value-copy snapshot of the pending index.
    pub fn pending_snapshot(&self) -> HashMap<String, PendingMessage> {
        self.pending.lock().unwrap().clone()
    }

    /// A value-copy snapshot of the in-flight opportunity IDs.
    pub fn active_snapshot(&self) -> HashSet<String> {
        self.active.lock().unwrap().clone()
    }
}
