//! Job queue using Redis Streams.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use vdq_models::{FetchJob, MessageId};

use crate::consumer::DeliverySource;
use crate::error::{QueueError, QueueResult};

/// Pending entries inspected per claim scan.
const CLAIM_SCAN_COUNT: usize = 10;

/// Floor for timer periods read from the environment.
pub const MIN_TIMER_PERIOD: Duration = Duration::from_secs(1);

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Stream name for jobs
    pub stream_name: String,
    /// Consumer group name
    pub consumer_group: String,
    /// How long a read blocks waiting for a new message
    pub block: Duration,
    /// Fixed delay between reconnect attempts
    pub reconnect_delay: Duration,
    /// How often an in-flight delivery is kept alive
    pub heartbeat_interval: Duration,
    /// Idle time after which another consumer may take over a delivery
    pub claim_min_idle: Duration,
    /// How often the pending list is scanned for abandoned deliveries
    pub claim_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            stream_name: "vdq:jobs".to_string(),
            consumer_group: "vdq:workers".to_string(),
            block: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            claim_min_idle: Duration::from_secs(300), // 5 minutes
            claim_interval: Duration::from_secs(30),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let secs = |name: &str, default: u64| {
            Duration::from_secs(
                std::env::var(name)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(default),
            )
        };

        Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            stream_name: std::env::var("QUEUE_STREAM").unwrap_or_else(|_| "vdq:jobs".to_string()),
            consumer_group: std::env::var("QUEUE_CONSUMER_GROUP")
                .unwrap_or_else(|_| "vdq:workers".to_string()),
            block: secs("QUEUE_BLOCK_SECS", 5),
            reconnect_delay: secs("QUEUE_RECONNECT_DELAY", 5),
            heartbeat_interval: secs("QUEUE_HEARTBEAT_INTERVAL", 30).max(MIN_TIMER_PERIOD),
            claim_min_idle: secs("QUEUE_CLAIM_MIN_IDLE", 300),
            claim_interval: secs("QUEUE_CLAIM_INTERVAL", 30).max(MIN_TIMER_PERIOD),
        }
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Stream entry id of this publish
    pub message_id: MessageId,
    pub job: FetchJob,
    /// How many times the broker has handed this entry out, including now
    pub delivery_count: u64,
}

/// Anything that can put a job on the queue.
#[async_trait]
pub trait JobPublisher: Send + Sync {
    /// Stamp `enqueued_at` and publish durably. Returns the new message id.
    async fn publish(&self, job: FetchJob) -> QueueResult<MessageId>;
}

/// Job queue client with an explicit connection lifecycle.
///
/// The connection slot is shared with heartbeat tasks. Teardown takes the
/// write lock, so it never overlaps an in-progress heartbeat.
pub struct JobQueue {
    client: redis::Client,
    config: QueueConfig,
    conn: RwLock<Option<MultiplexedConnection>>,
}

impl JobQueue {
    /// Create a new job queue. Does not connect.
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            client,
            config,
            conn: RwLock::new(None),
        })
    }

    /// Create from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::new(QueueConfig::from_env())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Connect, retrying with a fixed delay until the broker answers.
    pub async fn connect(&self) {
        let mut slot = self.conn.write().await;
        loop {
            match self.open().await {
                Ok(conn) => {
                    *slot = Some(conn);
                    info!(
                        stream = %self.config.stream_name,
                        group = %self.config.consumer_group,
                        "Connected to broker"
                    );
                    return;
                }
                Err(e) => {
                    warn!(
                        "Broker connection failed, retrying in {:?}: {}",
                        self.config.reconnect_delay, e
                    );
                    tokio::time::sleep(self.config.reconnect_delay).await;
                }
            }
        }
    }

    /// Drop the current connection and connect again.
    pub async fn reconnect(&self) {
        self.close().await;
        self.connect().await;
    }

    /// Close the connection. Safe to call more than once.
    pub async fn close(&self) {
        let mut slot = self.conn.write().await;
        if slot.take().is_some() {
            info!("Closed broker connection");
        }
    }

    /// Single reopen attempt after a failed command.
    async fn recover(&self) {
        let mut slot = self.conn.write().await;
        match self.open().await {
            Ok(conn) => {
                *slot = Some(conn);
                debug!("Reopened broker connection");
            }
            Err(e) => {
                *slot = None;
                warn!("Failed to reopen broker connection: {}", e);
            }
        }
    }

    async fn open(&self) -> QueueResult<MultiplexedConnection> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        self.ensure_group(&mut conn).await?;
        Ok(conn)
    }

    /// Create the consumer group if it does not exist.
    async fn ensure_group(&self, conn: &mut MultiplexedConnection) -> QueueResult<()> {
        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(conn)
            .await;

        match result {
            Ok(_) => info!("Created consumer group: {}", self.config.consumer_group),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("Consumer group already exists: {}", self.config.consumer_group);
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }

        Ok(())
    }

    async fn connection(&self) -> QueueResult<MultiplexedConnection> {
        self.conn.read().await.clone().ok_or(QueueError::NotConnected)
    }

    /// Read the next new message for this consumer (at most one).
    pub async fn read_next(&self, consumer_name: &str) -> QueueResult<Option<Delivery>> {
        let mut conn = self.connection().await?;

        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(consumer_name)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(self.config.block.as_millis() as u64)
            .arg("STREAMS")
            .arg(&self.config.stream_name)
            .arg(">") // Only new messages
            .query_async(&mut conn)
            .await?;

        let Some(reply) = reply else {
            return Ok(None);
        };

        for stream_key in reply.keys {
            for entry in stream_key.ids {
                if let Some(delivery) = self.decode(entry, 1).await {
                    return Ok(Some(delivery));
                }
            }
        }

        Ok(None)
    }

    /// Take over one delivery abandoned by a crashed or disconnected consumer.
    ///
    /// The broker filters the pending list by idle time, so entries held by
    /// live consumers never crowd out an abandoned one.
    pub async fn claim_stale(&self, consumer_name: &str) -> QueueResult<Option<Delivery>> {
        let mut conn = self.connection().await?;
        let min_idle_ms = self.config.claim_min_idle.as_millis() as u64;

        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(CLAIM_SCAN_COUNT)
            .query_async(&mut conn)
            .await?;

        for stale in pending.ids {
            // XCLAIM re-checks the idle time, so a racing consumer cannot
            // take an entry that was just claimed or touched.
            let claimed: StreamClaimReply = redis::cmd("XCLAIM")
                .arg(&self.config.stream_name)
                .arg(&self.config.consumer_group)
                .arg(consumer_name)
                .arg(min_idle_ms)
                .arg(&stale.id)
                .query_async(&mut conn)
                .await?;

            for entry in claimed.ids {
                let delivery_count = stale.times_delivered as u64 + 1;
                if let Some(delivery) = self.decode(entry, delivery_count).await {
                    info!(
                        message_id = %delivery.message_id,
                        previous_owner = %stale.consumer,
                        idle_ms = stale.last_delivered_ms,
                        "Claimed abandoned delivery"
                    );
                    return Ok(Some(delivery));
                }
            }
        }

        Ok(None)
    }

    /// Decode a stream entry. Malformed entries are acknowledged and dropped.
    async fn decode(&self, entry: StreamId, delivery_count: u64) -> Option<Delivery> {
        let message_id = MessageId::from_string(entry.id.clone());

        let parsed = entry
            .get::<String>("job")
            .ok_or_else(|| QueueError::Serialization("missing job field".to_string()))
            .and_then(|payload| decode_job(&payload));

        match parsed {
            Ok(job) => {
                debug!(message_id = %message_id, attempt = job.attempt, "Consumed job from stream");
                Some(Delivery {
                    message_id,
                    job,
                    delivery_count,
                })
            }
            Err(e) => {
                warn!(message_id = %message_id, "Discarding malformed job payload: {}", e);
                // Ack the malformed message to prevent reprocessing
                self.ack(&message_id).await.ok();
                None
            }
        }
    }

    /// Reset the idle time of an in-flight delivery so it is not claimed
    /// by another consumer while the handler is still running.
    pub async fn touch(&self, consumer_name: &str, message_id: &MessageId) -> QueueResult<()> {
        let slot = self.conn.read().await;
        let mut conn = slot.clone().ok_or(QueueError::NotConnected)?;

        redis::cmd("XCLAIM")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(consumer_name)
            .arg(0)
            .arg(message_id.as_str())
            .arg("JUSTID")
            .query_async::<()>(&mut conn)
            .await?;

        Ok(())
    }

    /// Acknowledge a delivery and remove it from the stream.
    pub async fn ack(&self, message_id: &MessageId) -> QueueResult<()> {
        let mut conn = self.connection().await?;

        redis::cmd("XACK")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(message_id.as_str())
            .query_async::<()>(&mut conn)
            .await?;

        redis::cmd("XDEL")
            .arg(&self.config.stream_name)
            .arg(message_id.as_str())
            .query_async::<()>(&mut conn)
            .await?;

        debug!("Acknowledged message: {}", message_id);
        Ok(())
    }

    /// Get queue length.
    pub async fn len(&self) -> QueueResult<u64> {
        let mut conn = self.connection().await?;
        let len: u64 = conn.xlen(&self.config.stream_name).await?;
        Ok(len)
    }

}

/// Parse the `job` field of a stream entry.
pub(crate) fn decode_job(payload: &str) -> QueueResult<FetchJob> {
    Ok(serde_json::from_str(payload)?)
}

#[async_trait]
impl DeliverySource for JobQueue {
    async fn read_next(&self, consumer_name: &str) -> QueueResult<Option<Delivery>> {
        JobQueue::read_next(self, consumer_name).await
    }

    async fn claim_stale(&self, consumer_name: &str) -> QueueResult<Option<Delivery>> {
        JobQueue::claim_stale(self, consumer_name).await
    }

    async fn touch(&self, consumer_name: &str, message_id: &MessageId) -> QueueResult<()> {
        JobQueue::touch(self, consumer_name, message_id).await
    }

    async fn ack(&self, message_id: &MessageId) -> QueueResult<()> {
        JobQueue::ack(self, message_id).await
    }

    async fn reconnect(&self) {
        JobQueue::reconnect(self).await
    }
}

#[async_trait]
impl JobPublisher for JobQueue {
    async fn publish(&self, mut job: FetchJob) -> QueueResult<MessageId> {
        job.enqueued_at = Utc::now();
        let payload = serde_json::to_string(&job)?;

        let mut conn = self.connection().await?;
        let result: Result<String, redis::RedisError> = redis::cmd("XADD")
            .arg(&self.config.stream_name)
            .arg("*")
            .arg("job")
            .arg(&payload)
            .query_async(&mut conn)
            .await;

        match result {
            Ok(id) => {
                let message_id = MessageId::from_string(id);
                info!(
                    message_id = %message_id,
                    attempt = job.attempt,
                    "Published job"
                );
                Ok(message_id)
            }
            Err(e) => {
                let err = QueueError::from(e);
                if err.is_transient() {
                    self.recover().await;
                }
                Err(err)
            }
        }
    }
}
