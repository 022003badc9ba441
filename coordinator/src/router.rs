use std::{collections::HashMap, sync::Arc, time::Duration};

use arbflow_helpers::{
    opportunities::{Opportunity, OpportunityStatus},
    redis::StreamsClient,
    retries::{backoff_wait_time_ms, BackoffConfig},
    time::Clock,
};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig},
    consts::{EXECUTION_REQUESTS_STREAM, FORWARDING_DLQ_STREAM},
    types::ForwardingDlqRecord,
};

/// Configuration for the opportunity router.
#[derive(Debug, Clone)]
pub struct OpportunityRouterConfig {
    /// Opportunities with a profit percentage outside
    /// `[min_profit, max_profit]` are rejected as implausible.
    pub min_profit: f64,
    pub max_profit: f64,
    /// Window within which a repeated opportunity ID is a duplicate.
    pub duplicate_window_ms: u64,
    /// Pending opportunities older than this are expired.
    pub opportunity_ttl_ms: u64,
    /// Total publish attempts when forwarding to the execution stream.
    pub forward_max_attempts: u32,
    /// Backoff between forwarding attempts.
    pub forward_backoff: BackoffConfig,
    /// The stream validated opportunities are forwarded to.
    pub execution_stream: String,
    /// Circuit breaker settings for the forwarding path.
    pub breaker: CircuitBreakerConfig,
}

impl Default for OpportunityRouterConfig {
    fn default() -> Self {
        OpportunityRouterConfig {
            min_profit: 0.01,
            max_profit: 100.0,
            duplicate_window_ms: 30_000,
            opportunity_ttl_ms: 300_000,
            forward_max_attempts: 3,
            forward_backoff: BackoffConfig {
                base_delay_ms: 100,
                backoff_rate: 2.0,
                max_delay_ms: Some(2_000),
                jitter: true,
            },
            execution_stream: EXECUTION_REQUESTS_STREAM.to_string(),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Counters exposed on the metrics surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterStats {
    pub total_opportunities: u64,
    pub opportunities_forwarded: u64,
    pub opportunities_dropped: u64,
    pub duplicates_rejected: u64,
    pub validation_rejected: u64,
    pub expired_removed: u64,
}

/// How the router resolved a processed opportunity.
#[derive(Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    Accepted { forwarded: bool },
    Rejected { reason: &'static str },
}

/// Routes structurally-valid opportunities towards the execution
/// engine: duplicate-window suppression, sanity bounds on profit,
/// leader-gated forwarding behind a circuit breaker, and TTL expiry
/// of the pending set.
pub struct OpportunityRouter {
    client: Arc<dyn StreamsClient>,
    clock: Arc<dyn Clock + Send + Sync>,
    config: OpportunityRouterConfig,
    pending: HashMap<String, Opportunity>,
    recent_ids: HashMap<String, u64>,
    breaker: CircuitBreaker,
    stats: RouterStats,
}

impl OpportunityRouter {
    pub fn new(
        client: Arc<dyn StreamsClient>,
        clock: Arc<dyn Clock + Send + Sync>,
        config: OpportunityRouterConfig,
    ) -> Self {
        let breaker = CircuitBreaker::new("opportunity-forwarding", config.breaker.clone());
        OpportunityRouter {
            client,
            clock,
            config,
            pending: HashMap::new(),
            recent_ids: HashMap::new(),
            breaker,
            stats: RouterStats::default(),
        }
    }

    /// Runs an opportunity through validation, duplicate suppression
    /// and, on the leader, forwarding to the execution stream.
    pub async fn process_opportunity(
        &mut self,
        opportunity: Opportunity,
        is_leader: bool,
    ) -> RouteOutcome {
        let now = self.clock.now_ms();

        if opportunity.id.is_empty() {
            self.stats.validation_rejected += 1;
            return RouteOutcome::Rejected {
                reason: "missing_id",
            };
        }

        if let Some(profit) = opportunity.profit_percentage {
            if profit < self.config.min_profit || profit > self.config.max_profit {
                debug!(
                    opportunity_id = %opportunity.id,
                    profit,
                    "rejecting opportunity with implausible profit percentage"
                );
                self.stats.validation_rejected += 1;
                return RouteOutcome::Rejected {
                    reason: "profit_out_of_range",
                };
            }
        }

        if let Some(first_seen) = self.recent_ids.get(&opportunity.id) {
            if now.saturating_sub(*first_seen) < self.config.duplicate_window_ms {
                debug!(
                    opportunity_id = %opportunity.id,
                    "rejecting duplicate opportunity inside the duplicate window"
                );
                self.stats.duplicates_rejected += 1;
                return RouteOutcome::Rejected { reason: "duplicate" };
            }
        }

        self.recent_ids.insert(opportunity.id.clone(), now);
        self.pending
            .insert(opportunity.id.clone(), opportunity.clone());
        self.stats.total_opportunities += 1;

        let should_forward =
            is_leader && opportunity.status == Some(OpportunityStatus::Pending);
        if !should_forward {
            return RouteOutcome::Accepted { forwarded: false };
        }

        let forwarded = self.forward_to_execution_engine(&opportunity).await;
        RouteOutcome::Accepted { forwarded }
    }

    /// Publishes an opportunity to the execution stream behind the
    /// forwarding circuit breaker, falling back to the forwarding
    /// dead letter stream when delivery is impossible.
    pub async fn forward_to_execution_engine(&mut self, opportunity: &Opportunity) -> bool {
        let now = self.clock.now_ms();
        if !self.breaker.allow_request(now) {
            warn!(
                opportunity_id = %opportunity.id,
                "forwarding circuit breaker open, dead-lettering opportunity"
            );
            self.write_forwarding_dlq(opportunity, "Circuit breaker open")
                .await;
            self.stats.opportunities_dropped += 1;
            return false;
        }

        let fields = opportunity.to_stream_fields();
        let mut last_error = String::new();
        for attempt in 0..self.config.forward_max_attempts {
            match self
                .client
                .xadd(&self.config.execution_stream, &fields)
                .await
            {
                Ok(_) => {
                    self.breaker.record_success();
                    self.stats.opportunities_forwarded += 1;
                    debug!(
                        opportunity_id = %opportunity.id,
                        stream = %self.config.execution_stream,
                        "forwarded opportunity to execution engine"
                    );
                    return true;
                }
                Err(err) => {
                    last_error = err.to_string();
                    warn!(
                        opportunity_id = %opportunity.id,
                        attempt,
                        "failed to publish opportunity to execution stream: {err}"
                    );
                    if attempt + 1 < self.config.forward_max_attempts {
                        let wait_ms =
                            backoff_wait_time_ms(&self.config.forward_backoff, attempt);
                        tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                    }
                }
            }
        }

        self.breaker.record_failure(self.clock.now_ms());
        self.write_forwarding_dlq(opportunity, &last_error).await;
        self.stats.opportunities_dropped += 1;
        false
    }

    async fn write_forwarding_dlq(&self, opportunity: &Opportunity, reason: &str) {
        let record = ForwardingDlqRecord {
            opportunity_id: opportunity.id.clone(),
            error: reason.to_string(),
            original_stream: self.config.execution_stream.clone(),
            timestamp: self.clock.now_ms(),
        };

        let payload = match serde_json::to_string(&record) {
            Ok(payload) => payload,
            Err(err) => {
                error!("failed to serialize forwarding DLQ record: {err}");
                return;
            }
        };

        if let Err(err) = self
            .client
            .xadd(
                FORWARDING_DLQ_STREAM,
                &[("data".to_string(), payload)],
            )
            .await
        {
            error!(
                opportunity_id = %record.opportunity_id,
                "failed to write forwarding DLQ record: {err}"
            );
        }
    }

    /// Removes pending opportunities that have expired or outlived
    /// the TTL, and prunes the duplicate window. Returns the number
    /// of pending entries removed.
    pub fn cleanup_expired_opportunities(&mut self) -> usize {
        let now = self.clock.now_ms();
        let ttl = self.config.opportunity_ttl_ms;
        let before = self.pending.len();

        self.pending.retain(|_, opportunity| {
            let expired = opportunity
                .expires_at
                .map(|expires_at| expires_at < now)
                .unwrap_or(false);
            let aged_out = now.saturating_sub(opportunity.timestamp) > ttl;
            !(expired || aged_out)
        });

        let duplicate_window = self.config.duplicate_window_ms;
        self.recent_ids
            .retain(|_, first_seen| now.saturating_sub(*first_seen) < duplicate_window);

        let removed = before - self.pending.len();
        if removed > 0 {
            info!(removed, "expired pending opportunities cleaned up");
            self.stats.expired_removed += removed as u64;
        }
        removed
    }

    /// A value-copy snapshot of the pending opportunity set.
    pub fn pending_snapshot(&self) -> HashMap<String, Opportunity> {
        self.pending.clone()
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }
}
