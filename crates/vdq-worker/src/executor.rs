//! Job executor.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use vdq_queue::{DeliverySource, JobQueue, QueueConsumer};

use crate::config::WorkerConfig;
use crate::error::WorkerResult;
use crate::processor::{JobProcessor, ProcessingContext};
use crate::sweeper::RetentionSweeper;

/// Runs the consumer and the retention sweeper until shutdown.
pub struct JobExecutor {
    config: WorkerConfig,
    queue: Arc<JobQueue>,
    ctx: ProcessingContext,
    shutdown: watch::Sender<bool>,
    consumer_name: String,
}

impl JobExecutor {
    pub fn new(config: WorkerConfig, queue: Arc<JobQueue>, ctx: ProcessingContext) -> Self {
        let (shutdown, _) = watch::channel(false);
        let consumer_name = format!("worker-{}", Uuid::new_v4());

        Self {
            config,
            queue,
            ctx,
            shutdown,
            consumer_name,
        }
    }

    /// Start the executor. Returns after shutdown once the in-flight
    /// delivery has finished.
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            "Starting job executor '{}' (max attempts: {}, max url retries: {})",
            self.consumer_name, self.config.retry.max_attempts, self.config.retry.max_url_retries
        );

        self.queue.connect().await;

        let sweeper_task = if self.config.sweep_enabled {
            let sweeper = RetentionSweeper::new(
                Arc::clone(&self.ctx.store),
                self.config.retention_ttl,
                self.config.sweep_interval,
            );
            let shutdown_rx = self.shutdown.subscribe();
            Some(tokio::spawn(async move { sweeper.run(shutdown_rx).await }))
        } else {
            info!("Retention sweeper disabled");
            None
        };

        let processor = JobProcessor::new(self.ctx.clone(), &self.config);
        let source: Arc<dyn DeliverySource> = self.queue.clone();
        let consumer = QueueConsumer::new(source, self.consumer_name.clone(), self.queue.config());
        let result = consumer.run(&processor, self.shutdown.subscribe()).await;

        // The sweeper only stops on the shutdown signal.
        let _ = self.shutdown.send(true);
        if let Some(task) = sweeper_task {
            if let Err(e) = task.await {
                warn!("Retention sweeper task failed: {}", e);
            }
        }

        self.queue.close().await;
        info!("Job executor '{}' stopped", self.consumer_name);

        result.map_err(Into::into)
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}
