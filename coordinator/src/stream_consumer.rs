use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
};

use arbflow_helpers::{
    consumers::{DlqRecord, HandlerError, MessageHandler, StreamMessage},
    redis::StreamsClient,
    time::Clock,
};
use chrono::DateTime;
use tokio::{io::AsyncWriteExt, sync::mpsc::UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::{
    consts::{ALERT_STREAM_CONSUMER_FAILURE, ALERT_STREAM_RECOVERED, DEAD_LETTER_STREAM},
    rate_limiter::{RateLimiterConfig, TokenBucketRateLimiter},
    types::{Alert, AlertSeverity},
};

/// Configuration for the stream consumer manager.
#[derive(Debug, Clone)]
pub struct StreamConsumerConfig {
    /// The service name stamped into dead letter records.
    pub service_name: String,
    /// The instance identifier stamped into dead letter records.
    pub instance_id: String,
    /// The consumer name used when claiming orphaned messages.
    pub consumer_name: String,
    /// The stream receiving dead letter records.
    pub dlq_stream: String,
    /// Stream errors tolerated before a consumer-failure alert fires.
    pub max_stream_errors: u32,
    /// Minimum idle time before another consumer's pending message
    /// is considered orphaned. Values much below a minute risk
    /// stealing messages from a healthy peer mid-handler.
    pub orphan_claim_min_idle_ms: u64,
    /// Maximum orphaned messages claimed per consumer per recovery
    /// pass.
    pub orphan_claim_batch_size: usize,
    /// Per-stream admission control.
    pub rate_limiter: RateLimiterConfig,
    /// Directory receiving the local DLQ fallback files.
    pub fallback_dir: PathBuf,
    /// Daily size cap for a DLQ fallback file.
    pub fallback_max_bytes: u64,
}

impl Default for StreamConsumerConfig {
    fn default() -> Self {
        StreamConsumerConfig {
            service_name: "coordinator".to_string(),
            instance_id: "coordinator-0".to_string(),
            consumer_name: "coordinator-0".to_string(),
            dlq_stream: DEAD_LETTER_STREAM.to_string(),
            max_stream_errors: 10,
            orphan_claim_min_idle_ms: 60_000,
            orphan_claim_batch_size: 100,
            rate_limiter: RateLimiterConfig::default(),
            fallback_dir: PathBuf::from("data"),
            fallback_max_bytes: 100 * 1024 * 1024,
        }
    }
}

/// How a delivered message was resolved by the wrapped pipeline.
/// Every variant except `LeftPending` implies exactly one ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    RateLimited,
    DeadLettered,
    LeftPending,
}

#[derive(Debug, Default)]
struct FallbackFileState {
    date: String,
    bytes: u64,
    limit_warned: bool,
}

/// Wraps domain handlers with the shared consumption pipeline:
/// per-stream rate limiting, deferred acknowledgment, dead-lettering
/// with a local file fallback, error-burst alerting and orphaned
/// message recovery.
pub struct StreamConsumerManager {
    client: Arc<dyn StreamsClient>,
    clock: Arc<dyn Clock + Send + Sync>,
    config: StreamConsumerConfig,
    rate_limiter: Mutex<TokenBucketRateLimiter>,
    error_count: AtomicU32,
    // Flipped synchronously before the alert is dispatched so that
    // concurrent error tracking cannot emit duplicate alerts.
    failure_alert_sent: AtomicBool,
    alert_tx: UnboundedSender<Alert>,
    fallback: tokio::sync::Mutex<FallbackFileState>,
}

impl StreamConsumerManager {
    pub fn new(
        client: Arc<dyn StreamsClient>,
        clock: Arc<dyn Clock + Send + Sync>,
        config: StreamConsumerConfig,
        alert_tx: UnboundedSender<Alert>,
    ) -> Self {
        let rate_limiter =
            TokenBucketRateLimiter::new(config.rate_limiter.clone(), clock.clone());
        StreamConsumerManager {
            client,
            clock,
            config,
            rate_limiter: Mutex::new(rate_limiter),
            error_count: AtomicU32::new(0),
            failure_alert_sent: AtomicBool::new(false),
            alert_tx,
            fallback: tokio::sync::Mutex::new(FallbackFileState::default()),
        }
    }

    /// Runs one delivered message through the wrapped pipeline.
    ///
    /// The message always resolves to exactly one of: acknowledged
    /// after success, acknowledged after a dead letter write, or left
    /// in the pending entries list for redelivery (backpressure).
    /// Rate-limited messages are acknowledged, never left pending,
    /// as an unacknowledged flood would only grow the PEL.
    pub async fn process_message(
        &self,
        stream: &str,
        group: &str,
        message: &StreamMessage,
        handler: &dyn MessageHandler,
    ) -> ProcessOutcome {
        let admitted = {
            let mut rate_limiter = self.rate_limiter.lock().unwrap();
            rate_limiter.check(stream)
        };
        if !admitted {
            self.ack(stream, group, &message.id).await;
            return ProcessOutcome::RateLimited;
        }

        match handler.handle(stream, message).await {
            Ok(()) => {
                self.ack(stream, group, &message.id).await;
                ProcessOutcome::Completed
            }
            Err(HandlerError::Backpressure) => {
                debug!(
                    stream,
                    message_id = %message.id,
                    "handler reported backpressure, leaving message pending"
                );
                ProcessOutcome::LeftPending
            }
            Err(HandlerError::Failure(err)) => {
                self.write_dlq(stream, message, &format!("{err}"), &format!("{err:?}"))
                    .await;
                self.ack(stream, group, &message.id).await;
                ProcessOutcome::DeadLettered
            }
        }
    }

    // An ACK failure is logged and swallowed; the message will be
    // redelivered and the pipeline treats redelivery as benign.
    async fn ack(&self, stream: &str, group: &str, message_id: &str) {
        if let Err(err) = self.client.xack(stream, group, message_id).await {
            error!(
                stream,
                message_id, "failed to acknowledge message: {err}"
            );
        }
    }

    async fn write_dlq(
        &self,
        stream: &str,
        message: &StreamMessage,
        error_message: &str,
        error_stack: &str,
    ) {
        let mut stack: String = error_stack.chars().take(500).collect();
        if stack.len() < error_stack.len() {
            stack.push('…');
        }

        let record = DlqRecord {
            original_message_id: message.id.clone(),
            original_stream: stream.to_string(),
            original_data: serde_json::to_string(&message.fields)
                .unwrap_or_else(|_| "{}".to_string()),
            error: error_message.to_string(),
            error_stack: stack,
            timestamp: self.clock.now_ms(),
            service: self.config.service_name.clone(),
            instance_id: self.config.instance_id.clone(),
        };

        let payload = match serde_json::to_string(&record) {
            Ok(payload) => payload,
            Err(err) => {
                error!("failed to serialize DLQ record: {err}");
                return;
            }
        };

        match self
            .client
            .xadd(&self.config.dlq_stream, &[("data".to_string(), payload.clone())])
            .await
        {
            Ok(_) => {
                debug!(
                    stream,
                    message_id = %message.id,
                    "message written to dead letter stream"
                );
            }
            Err(err) => {
                warn!(
                    stream,
                    message_id = %message.id,
                    "DLQ write failed, appending to local fallback: {err}"
                );
                self.append_fallback(&payload).await;
            }
        }
    }

    fn fallback_path(&self, date: &str) -> PathBuf {
        self.config
            .fallback_dir
            .join(format!("dlq-fallback-{date}.jsonl"))
    }

    async fn append_fallback(&self, payload: &str) {
        let date = match DateTime::from_timestamp_millis(self.clock.now_ms() as i64) {
            Some(datetime) => datetime.format("%Y-%m-%d").to_string(),
            None => "unknown-date".to_string(),
        };

        let mut state = self.fallback.lock().await;
        if state.date != date {
            let path = self.fallback_path(&date);
            state.date = date.clone();
            state.bytes = tokio::fs::metadata(&path)
                .await
                .map(|metadata| metadata.len())
                .unwrap_or(0);
            state.limit_warned = false;
        }

        let line_bytes = payload.len() as u64 + 1;
        if state.bytes + line_bytes > self.config.fallback_max_bytes {
            if !state.limit_warned {
                warn!(
                    date = %date,
                    "DLQ fallback file reached its daily size cap, dropping records"
                );
                state.limit_warned = true;
            } else {
                debug!("DLQ fallback record dropped, daily size cap reached");
            }
            return;
        }

        if let Err(err) = self.write_fallback_line(&date, payload).await {
            error!("failed to append DLQ fallback record: {err}");
            return;
        }
        state.bytes += line_bytes;
    }

    async fn write_fallback_line(&self, date: &str, payload: &str) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.config.fallback_dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.fallback_path(date))
            .await?;
        file.write_all(payload.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }

    /// Records a stream-level consumption error. Reaching the
    /// configured burst threshold emits a single critical alert;
    /// further errors stay silent until the burst is reset.
    pub fn track_error(&self, stream: &str) {
        let count = self.error_count.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(stream, count, "stream consumption error tracked");

        if count >= self.config.max_stream_errors
            && !self.failure_alert_sent.swap(true, Ordering::SeqCst)
        {
            let alert = Alert::new(
                ALERT_STREAM_CONSUMER_FAILURE,
                AlertSeverity::Critical,
                format!(
                    "stream consumption has failed {count} times, last failure on {stream}"
                ),
                self.clock.now_ms(),
            )
            .for_service(self.config.service_name.clone());
            let _ = self.alert_tx.send(alert);
        }
    }

    /// Clears the error burst. Emits a recovery alert when a failure
    /// alert had been sent for the burst being cleared.
    pub fn reset_errors(&self) {
        self.error_count.store(0, Ordering::SeqCst);
        if self.failure_alert_sent.swap(false, Ordering::SeqCst) {
            let alert = Alert::new(
                ALERT_STREAM_RECOVERED,
                AlertSeverity::Warning,
                "stream consumption recovered after a failure burst",
                self.clock.now_ms(),
            )
            .for_service(self.config.service_name.clone());
            let _ = self.alert_tx.send(alert);
        }
    }

    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::SeqCst)
    }

    /// Reclaims messages stranded in other consumers' pending entries
    /// lists (their owner crashed mid-handler) and dead-letters each
    /// one. Reclaimed market data is never re-executed: by the time a
    /// message has sat idle past the claim threshold its prices are
    /// stale and replaying the trade would be unsafe.
    ///
    /// Returns the number of messages recovered.
    pub async fn recover_pending_messages(&self, groups: &[(String, String)]) -> u64 {
        let mut recovered: u64 = 0;

        for (stream, group) in groups {
            let summary = match self.client.xpending_summary(stream, group).await {
                Ok(summary) => summary,
                Err(err) => {
                    warn!(stream, group, "failed to read pending summary: {err}");
                    continue;
                }
            };

            for consumer in &summary.consumers {
                if consumer.name == self.config.consumer_name || consumer.pending == 0 {
                    continue;
                }

                let entries = match self
                    .client
                    .xpending_range(
                        stream,
                        group,
                        &consumer.name,
                        self.config.orphan_claim_batch_size,
                    )
                    .await
                {
                    Ok(entries) => entries,
                    Err(err) => {
                        warn!(
                            stream,
                            group,
                            consumer = %consumer.name,
                            "failed to read pending entries: {err}"
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
                        stream,
                        group,
                        &self.config.consumer_name,
                        self.config.orphan_claim_min_idle_ms,
                        &eligible_ids,
                    )
                    .await
                {
                    Ok(claimed) => claimed,
                    Err(err) => {
                        warn!(
                            stream,
                            group,
                            consumer = %consumer.name,
                            "failed to claim orphaned messages: {err}"
                        );
                        continue;
                    }
                };

                for message in &claimed {
                    self.write_dlq(
                        stream,
                        message,
                        &format!(
                            "orphaned message reclaimed from consumer {}",
                            consumer.name
                        ),
                        "orphaned pending message, original handler did not complete",
                    )
                    .await;
                    self.ack(stream, group, &message.id).await;
                    recovered += 1;
                }

                info!(
                    stream,
                    group,
                    consumer = %consumer.name,
                    claimed = claimed.len(),
                    "reclaimed orphaned pending messages"
                );
            }
        }

        recovered
    }
}
