//! Progress relay via Redis Pub/Sub.
//!
//! Emitting is fire-and-forget: events go into a bounded buffer drained by
//! a forwarder task, so a slow or absent subscriber never stalls a job.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};

use futures_util::Stream;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use vdq_models::{ProgressEvent, ProgressMessage};

use crate::error::{QueueError, QueueResult};

/// Default number of buffered events before ticks are dropped.
pub const DEFAULT_RELAY_BUFFER: usize = 256;

/// Sink for progress messages addressed to a client.
pub trait ProgressRelay: Send + Sync {
    /// Deliver best-effort. Never blocks and never fails the caller.
    fn emit(&self, client_ref: &str, message: ProgressMessage);
}

/// Pub/Sub channel name for a client.
pub fn channel_name(client_ref: &str) -> String {
    format!("vdq:progress:{}", client_ref)
}

/// Relay publishing to `vdq:progress:<client_ref>`.
pub struct RedisProgressRelay {
    tx: mpsc::Sender<ProgressEvent>,
}

impl RedisProgressRelay {
    /// Start the relay and its forwarder task.
    ///
    /// The forwarder exits once every relay handle is dropped.
    pub fn start(redis_url: &str, buffer: usize) -> QueueResult<(Self, JoinHandle<()>)> {
        let client = redis::Client::open(redis_url)?;
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let handle = tokio::spawn(forward(client, rx));
        Ok((Self { tx }, handle))
    }
}

impl ProgressRelay for RedisProgressRelay {
    fn emit(&self, client_ref: &str, message: ProgressMessage) {
        let event = ProgressEvent {
            client_ref: client_ref.to_string(),
            message,
        };
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                debug!(client_ref = %event.client_ref, "Progress buffer full, dropping event");
            }
            Err(TrySendError::Closed(event)) => {
                debug!(
                    client_ref = %event.client_ref,
                    "Progress forwarder stopped, dropping event"
                );
            }
        }
    }
}

async fn forward(client: redis::Client, mut rx: mpsc::Receiver<ProgressEvent>) {
    let mut conn: Option<MultiplexedConnection> = None;

    while let Some(event) = rx.recv().await {
        if let Err(e) = publish_event(&client, &mut conn, &event).await {
            conn = None;
            warn!(client_ref = %event.client_ref, "Dropped progress event: {}", e);
        }
    }

    debug!("Progress forwarder stopped");
}

async fn publish_event(
    client: &redis::Client,
    conn: &mut Option<MultiplexedConnection>,
    event: &ProgressEvent,
) -> QueueResult<()> {
    if conn.is_none() {
        *conn = Some(client.get_multiplexed_async_connection().await?);
    }
    let conn = conn.as_mut().ok_or(QueueError::NotConnected)?;

    let payload = serde_json::to_string(&event.message)?;
    conn.publish::<_, _, ()>(channel_name(&event.client_ref), payload)
        .await?;
    Ok(())
}

/// Read side of the Redis relay.
pub struct ProgressSubscriber {
    client: redis::Client,
}

impl ProgressSubscriber {
    pub fn new(redis_url: &str) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    /// Subscribe to progress messages for a client.
    /// Returns a pinned stream that can be polled with `.next()`.
    pub async fn subscribe(
        &self,
        client_ref: &str,
    ) -> QueueResult<Pin<Box<dyn Stream<Item = ProgressMessage> + Send>>> {
        use futures_util::StreamExt;

        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel_name(client_ref)).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            serde_json::from_str(&payload).ok()
        });

        Ok(Box::pin(stream))
    }
}

/// In-process relay keyed by client ref.
///
/// Used when the API and worker share a process, and in tests.
pub struct LocalProgressRelay {
    subscribers: Mutex<HashMap<String, mpsc::Sender<ProgressMessage>>>,
    buffer: usize,
}

impl Default for LocalProgressRelay {
    fn default() -> Self {
        Self::new(DEFAULT_RELAY_BUFFER)
    }
}

impl LocalProgressRelay {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, mpsc::Sender<ProgressMessage>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a client. Replaces any earlier registration for the same ref.
    pub fn subscribe(&self, client_ref: &str) -> mpsc::Receiver<ProgressMessage> {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.lock().insert(client_ref.to_string(), tx);
        rx
    }

    pub fn unsubscribe(&self, client_ref: &str) {
        self.lock().remove(client_ref);
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }
}

impl ProgressRelay for LocalProgressRelay {
    fn emit(&self, client_ref: &str, message: ProgressMessage) {
        let mut subscribers = self.lock();
        let Some(tx) = subscribers.get(client_ref) else {
            debug!(client_ref, "No subscriber, dropping progress event");
            return;
        };

        match tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(client_ref, "Subscriber lagging, dropping progress event");
            }
            Err(TrySendError::Closed(_)) => {
                subscribers.remove(client_ref);
                debug!(client_ref, "Subscriber gone");
            }
        }
    }
}
