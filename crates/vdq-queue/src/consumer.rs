//! Consumer loop and in-flight heartbeat.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use vdq_models::MessageId;

use crate::error::QueueResult;
use crate::queue::{Delivery, QueueConfig, MIN_TIMER_PERIOD};

/// Broker side of the consumer protocol.
#[async_trait]
pub trait DeliverySource: Send + Sync {
    /// Next new message for `consumer_name`, if one arrives within the
    /// read timeout.
    async fn read_next(&self, consumer_name: &str) -> QueueResult<Option<Delivery>>;

    /// Take over one delivery idle for longer than the claim threshold.
    async fn claim_stale(&self, consumer_name: &str) -> QueueResult<Option<Delivery>>;

    /// Reset the idle time of an in-flight delivery.
    async fn touch(&self, consumer_name: &str, message_id: &MessageId) -> QueueResult<()>;

    async fn ack(&self, message_id: &MessageId) -> QueueResult<()>;

    /// Drop the connection and reconnect, waiting as long as it takes.
    async fn reconnect(&self);
}

/// What to do with a delivery once the handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remove it from the queue.
    Ack,
    /// Leave it pending; it is redelivered after the claim idle time.
    Retain,
}

/// Processes one delivery at a time.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Disposition;
}

/// A named member of the consumer group, processing one delivery at a time.
pub struct QueueConsumer {
    queue: Arc<dyn DeliverySource>,
    name: String,
    config: QueueConfig,
}

impl QueueConsumer {
    pub fn new(
        queue: Arc<dyn DeliverySource>,
        name: impl Into<String>,
        config: &QueueConfig,
    ) -> Self {
        Self {
            queue,
            name: name.into(),
            config: config.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Consume until `shutdown` turns true.
    ///
    /// A delivery already being handled always runs to completion. Broker
    /// errors trigger a reconnect with a fixed delay; the loop never exits
    /// on its own.
    pub async fn run<H>(&self, handler: &H, mut shutdown: watch::Receiver<bool>) -> QueueResult<()>
    where
        H: DeliveryHandler + ?Sized,
    {
        let config = &self.config;
        let mut last_claim: Option<Instant> = None;

        info!(
            consumer = %self.name,
            stream = %config.stream_name,
            "Consumer started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let claim_due = last_claim.map_or(true, |at| at.elapsed() >= config.claim_interval);

            let next = tokio::select! {
                _ = shutdown.changed() => break,
                next = self.next_delivery(claim_due) => next,
            };
            if claim_due {
                last_claim = Some(Instant::now());
            }

            let delivery = match next {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(e) => {
                    warn!(consumer = %self.name, "Broker error, reconnecting: {}", e);
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = self.queue.reconnect() => {}
                    }
                    continue;
                }
            };

            self.dispatch(handler, delivery, config.heartbeat_interval, config.reconnect_delay)
                .await;
        }

        info!(consumer = %self.name, "Consumer stopped");
        Ok(())
    }

    async fn next_delivery(&self, claim_due: bool) -> QueueResult<Option<Delivery>> {
        if claim_due {
            if let Some(delivery) = self.queue.claim_stale(&self.name).await? {
                return Ok(Some(delivery));
            }
        }
        self.queue.read_next(&self.name).await
    }

    async fn dispatch<H>(
        &self,
        handler: &H,
        delivery: Delivery,
        heartbeat_interval: Duration,
        retain_backoff: Duration,
    ) where
        H: DeliveryHandler + ?Sized,
    {
        let heartbeat = {
            let queue = Arc::clone(&self.queue);
            let consumer = self.name.clone();
            let message_id = delivery.message_id.clone();
            Heartbeat::start(heartbeat_interval, move || {
                let queue = Arc::clone(&queue);
                let consumer = consumer.clone();
                let message_id = message_id.clone();
                async move { queue.touch(&consumer, &message_id).await }
            })
        };

        let disposition = handler.handle(&delivery).await;
        heartbeat.stop().await;

        match disposition {
            Disposition::Ack => {
                if let Err(e) = self.queue.ack(&delivery.message_id).await {
                    warn!(
                        message_id = %delivery.message_id,
                        "Failed to ack, message will be redelivered: {}", e
                    );
                }
            }
            Disposition::Retain => {
                info!(
                    message_id = %delivery.message_id,
                    "Leaving message pending for redelivery"
                );
                tokio::time::sleep(retain_backoff).await;
            }
        }
    }
}

/// Background task keeping an in-flight delivery alive.
///
/// Runs independently of the handler, so a long fetch cannot starve it.
pub struct Heartbeat {
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Call `beat` every `every`, starting one interval from now.
    ///
    /// Periods under [`MIN_TIMER_PERIOD`] are raised to it.
    pub fn start<F, Fut>(every: Duration, beat: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = QueueResult<()>> + Send + 'static,
    {
        let every = every.max(MIN_TIMER_PERIOD);
        let (tx, mut rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    _ = ticker.tick() => {
                        match beat().await {
                            Ok(()) => debug!("Heartbeat sent"),
                            Err(e) => warn!("Heartbeat failed: {}", e),
                        }
                    }
                }
            }
        });

        Self {
            stop: Some(tx),
            handle,
        }
    }

    /// Stop the task and wait for an in-progress beat to finish.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.handle).await {
            if e.is_panic() {
                error!("Heartbeat task panicked: {}", e);
            }
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
