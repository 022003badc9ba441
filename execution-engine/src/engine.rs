use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use arbflow_helpers::{
    redis::StreamsClient,
    streams::{EXECUTION_ENGINE_GROUP, EXECUTION_REQUESTS_STREAM},
    time::Clock,
};
use futures::future::join_all;
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, instrument, warn};

use crate::{
    config::ExecutionEngineConfig,
    consumer::ExecutionEngineConsumer,
    errors::ExecutionEngineStartError,
    queue::{execution_queue, ExecutionQueueReceiver},
    workers::{spawn_workers, ExecutionHandler},
};

/// The execution engine service: a deferred-ACK stream consumer, a
/// bounded in-process queue and a worker pool draining it into the
/// injected execution strategy.
pub struct ExecutionEngine {
    client: Arc<dyn StreamsClient>,
    config: ExecutionEngineConfig,
    consumer: Arc<ExecutionEngineConsumer>,
    handler: Arc<dyn ExecutionHandler>,
    queue_receiver: Mutex<Option<ExecutionQueueReceiver>>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl ExecutionEngine {
    pub fn new(
        client: Arc<dyn StreamsClient>,
        clock: Arc<dyn Clock + Send + Sync>,
        config: ExecutionEngineConfig,
        handler: Arc<dyn ExecutionHandler>,
    ) -> Self {
        let (queue, queue_receiver) =
            execution_queue(config.queue_capacity, config.queue_resume_threshold);
        let consumer = Arc::new(ExecutionEngineConsumer::new(
            client.clone(),
            clock,
            config.clone(),
            queue,
        ));
        let (shutdown_tx, _) = broadcast::channel(8);

        ExecutionEngine {
            client,
            config,
            consumer,
            handler,
            queue_receiver: Mutex::new(Some(queue_receiver)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Bootstraps the consumer group, reclaims orphaned execution
    /// requests, and spawns the consumer and worker tasks.
    #[instrument(name = "execution_engine_start", skip(self), fields(consumer = %self.consumer.consumer_name()))]
    pub async fn start(&self) -> Result<(), ExecutionEngineStartError> {
        self.client
            .create_consumer_group(EXECUTION_REQUESTS_STREAM, EXECUTION_ENGINE_GROUP)
            .await?;

        let recovered = self.consumer.recover_orphaned_messages().await;
        if recovered > 0 {
            info!(recovered, "reprocessed orphaned execution requests on startup");
        }

        let queue_receiver = self
            .queue_receiver
            .lock()
            .await
            .take()
            .expect("execution engine already started");
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let mut tasks = self.tasks.lock().await;
        tasks.extend(spawn_workers(
            self.config.workers,
            queue_receiver,
            self.handler.clone(),
            completion_tx,
            &self.shutdown_tx,
        ));

        let consumer = self.consumer.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            consumer.run(completion_rx, shutdown_rx).await;
        }));

        info!("execution engine started");
        Ok(())
    }

    /// Stops the engine: reads stop, in-flight work gets the shutdown
    /// budget, then completed-but-unacknowledged messages are
    /// reconciled. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            debug!("execution engine stop called again, ignoring");
            return;
        }

        info!("stopping execution engine");
        self.consumer.mark_stopped();
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

        self.consumer.shutdown_ack().await;
        info!("execution engine stopped");
    }

    pub fn consumer(&self) -> &Arc<ExecutionEngineConsumer> {
        &self.consumer
    }
}
