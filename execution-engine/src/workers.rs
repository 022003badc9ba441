use std::sync::Arc;

use arbflow_helpers::opportunities::Opportunity;
use async_trait::async_trait;
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info};

use crate::{errors::ExecutionError, queue::ExecutionQueueReceiver};

/// The strategy side of the execution engine. Implementations carry
/// out the actual trade; the consumer and worker pool only deliver
/// opportunities to it with at-least-once semantics.
#[async_trait]
pub trait ExecutionHandler: Send + Sync {
    async fn execute(&self, opportunity: &Opportunity) -> Result<(), ExecutionError>;
}

/// Emitted by a worker when an opportunity finishes executing,
/// successfully or not. The consumer uses this to acknowledge the
/// originating stream message and release the in-flight slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionEvent {
    pub opportunity_id: String,
    pub success: bool,
}

/// Spawns the execution worker pool. Workers share the queue
/// receiver and report every completion on the completion channel.
pub fn spawn_workers(
    count: usize,
    receiver: ExecutionQueueReceiver,
    handler: Arc<dyn ExecutionHandler>,
    completion_tx: mpsc::UnboundedSender<CompletionEvent>,
    shutdown_tx: &broadcast::Sender<()>,
) -> Vec<JoinHandle<()>> {
    let receiver = Arc::new(Mutex::new(receiver));
    let mut handles = Vec::with_capacity(count);

    for worker_id in 0..count {
        let receiver = receiver.clone();
        let handler = handler.clone();
        let completion_tx = completion_tx.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();

        handles.push(tokio::spawn(async move {
            loop {
                let opportunity = tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!(worker_id, "received shutdown signal, stopping execution worker");
                        break;
                    }
                    opportunity = async { receiver.lock().await.recv().await } => {
                        match opportunity {
                            Some(opportunity) => opportunity,
                            None => break,
                        }
                    }
                };

                debug!(
                    worker_id,
                    opportunity_id = %opportunity.id,
                    "executing opportunity"
                );
                let success = match handler.execute(&opportunity).await {
                    Ok(()) => true,
                    Err(err) => {
                        error!(
                            worker_id,
                            opportunity_id = %opportunity.id,
                            "execution failed: {err}"
                        );
                        false
                    }
                };

                let _ = completion_tx.send(CompletionEvent {
                    opportunity_id: opportunity.id,
                    success,
                });
            }
        }));
    }

    handles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::execution_queue;
    use arbflow_helpers::opportunities::{OpportunityKind, OpportunityStatus};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    struct FlakyHandler;

    #[async_trait]
    impl ExecutionHandler for FlakyHandler {
        async fn execute(&self, opportunity: &Opportunity) -> Result<(), ExecutionError> {
            if opportunity.id.ends_with("fail") {
                return Err(ExecutionError::new("strategy rejected the trade"));
            }
            Ok(())
        }
    }

    fn opportunity(id: &str) -> Opportunity {
        Opportunity {
            id: id.to_string(),
            kind: OpportunityKind::Simple,
            token_in: "WETH".to_string(),
            token_out: "USDC".to_string(),
            amount_in: "1000".to_string(),
            expected_profit: None,
            profit_percentage: Some(0.5),
            confidence: 0.9,
            timestamp: 1,
            expires_at: None,
            buy_chain: None,
            sell_chain: None,
            status: Some(OpportunityStatus::Pending),
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_workers_execute_and_report_completions() {
        let (queue, receiver) = execution_queue(10, 5);
        let (completion_tx, mut completion_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);

        let handles = spawn_workers(
            2,
            receiver,
            Arc::new(FlakyHandler),
            completion_tx,
            &shutdown_tx,
        );

        queue.try_enqueue(opportunity("O1")).unwrap();
        queue.try_enqueue(opportunity("O2-fail")).unwrap();

        let mut completions = Vec::new();
        for _ in 0..2 {
            let event = tokio::time::timeout(Duration::from_secs(2), completion_rx.recv())
                .await
                .expect("timed out waiting for completion")
                .unwrap();
            completions.push(event);
        }
        completions.sort_by(|a, b| a.opportunity_id.cmp(&b.opportunity_id));

        assert_eq!(
            completions,
            vec![
                CompletionEvent {
                    opportunity_id: "O1".to_string(),
                    success: true,
                },
                CompletionEvent {
                    opportunity_id: "O2-fail".to_string(),
                    success: false,
                },
            ]
        );

        let _ = shutdown_tx.send(());
        for handle in handles {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }
    }
}
