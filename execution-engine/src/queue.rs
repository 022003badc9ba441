use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use arbflow_helpers::opportunities::Opportunity;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Why an opportunity could not be enqueued.
#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueError {
    /// The queue is at capacity; the caller must leave the message
    /// pending so it is redelivered once the queue drains.
    Full,
    /// The worker side of the queue has shut down.
    Closed,
}

impl fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EnqueueError::Full => write!(f, "execution queue is full"),
            EnqueueError::Closed => write!(f, "execution queue is closed"),
        }
    }
}

impl std::error::Error for EnqueueError {}

struct QueueShared {
    depth: AtomicUsize,
    resume_below: usize,
    pause_tx: watch::Sender<bool>,
}

/// The producer half of the bounded in-process execution queue.
///
/// A full queue flips the pause signal so the stream consumer stops
/// reading entirely; pending-list pressure then builds on the broker
/// side where a restarted peer can reclaim it. The worker half flips
/// the signal back once the queue drains below the resume threshold.
pub struct ExecutionQueue {
    shared: Arc<QueueShared>,
    tx: mpsc::Sender<Opportunity>,
}

/// The worker half of the execution queue.
pub struct ExecutionQueueReceiver {
    shared: Arc<QueueShared>,
    rx: mpsc::Receiver<Opportunity>,
}

/// Creates a bounded execution queue with pause/resume signalling.
pub fn execution_queue(
    capacity: usize,
    resume_below: usize,
) -> (ExecutionQueue, ExecutionQueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (pause_tx, _) = watch::channel(false);
    let shared = Arc::new(QueueShared {
        depth: AtomicUsize::new(0),
        resume_below,
        pause_tx,
    });

    (
        ExecutionQueue {
            shared: shared.clone(),
            tx,
        },
        ExecutionQueueReceiver { shared, rx },
    )
}

impl ExecutionQueue {
    /// Attempts to enqueue an opportunity without waiting. A full
    /// queue raises the pause signal before reporting the failure.
    pub fn try_enqueue(&self, opportunity: Opportunity) -> Result<(), EnqueueError> {
        // Counted before the send so a worker that receives the item
        // immediately cannot decrement past zero.
        self.shared.depth.fetch_add(1, Ordering::SeqCst);
        match self.tx.try_send(opportunity) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.shared.depth.fetch_sub(1, Ordering::SeqCst);
                if !*self.shared.pause_tx.borrow() {
                    debug!("execution queue full, signalling pause");
                    let _ = self.shared.pause_tx.send(true);
                }
                Err(EnqueueError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.shared.depth.fetch_sub(1, Ordering::SeqCst);
                Err(EnqueueError::Closed)
            }
        }
    }

    /// A receiver observing the pause signal: true while the stream
    /// consumer should stop reading.
    pub fn pause_signal(&self) -> watch::Receiver<bool> {
        self.shared.pause_tx.subscribe()
    }

    pub fn depth(&self) -> usize {
        self.shared.depth.load(Ordering::SeqCst)
    }
}

impl ExecutionQueueReceiver {
    /// Receives the next queued opportunity, lowering the pause
    /// signal once the queue has drained below the resume threshold.
    pub async fn recv(&mut self) -> Option<Opportunity> {
        let opportunity = self.rx.recv().await?;
        let depth = self.shared.depth.fetch_sub(1, Ordering::SeqCst) - 1;

        if depth <= self.shared.resume_below && *self.shared.pause_tx.borrow() {
            debug!(depth, "execution queue drained, signalling resume");
            let _ = self.shared.pause_tx.send(false);
        }

        Some(opportunity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbflow_helpers::opportunities::{OpportunityKind, OpportunityStatus};
    use pretty_assertions::assert_eq;

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
    async fn test_full_queue_raises_pause_signal() {
        let (queue, _receiver) = execution_queue(2, 0);
        let pause_rx = queue.pause_signal();

        queue.try_enqueue(opportunity("O1")).unwrap();
        queue.try_enqueue(opportunity("O2")).unwrap();
        assert!(!*pause_rx.borrow());

        assert_eq!(queue.try_enqueue(opportunity("O3")), Err(EnqueueError::Full));
        assert!(*pause_rx.borrow());
        assert_eq!(queue.depth(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn test_draining_below_threshold_resumes() {
        let (queue, mut receiver) = execution_queue(2, 1);

        queue.try_enqueue(opportunity("O1")).unwrap();
        queue.try_enqueue(opportunity("O2")).unwrap();
        assert_eq!(queue.try_enqueue(opportunity("O3")), Err(EnqueueError::Full));

        let mut pause_rx = queue.pause_signal();
        assert!(*pause_rx.borrow_and_update());

        let first = receiver.recv().await.unwrap();
        assert_eq!(first.id, "O1");
        // Depth dropped to 1, at the resume threshold.
        assert!(pause_rx.has_changed().unwrap());
        assert!(!*pause_rx.borrow_and_update());
    }

    #[test_log::test(tokio::test)]
    async fn test_closed_queue_reports_closed() {
        let (queue, receiver) = execution_queue(2, 0);
        drop(receiver);

        assert_eq!(
            queue.try_enqueue(opportunity("O1")),
            Err(EnqueueError::Closed)
        );
    }
}
