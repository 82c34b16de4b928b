//! Redis Streams job queue for media fetch jobs.
//!
//! This crate provides:
//! - Durable job publishing and one-at-a-time consumption via Redis Streams
//! - Redelivery of abandoned messages and an in-flight heartbeat
//! - The per-fingerprint retry ledger
//! - Progress relay via Redis Pub/Sub

pub mod consumer;
pub mod error;
pub mod ledger;
pub mod memory;
pub mod progress;
pub mod queue;

pub use consumer::{DeliveryHandler, DeliverySource, Disposition, Heartbeat, QueueConsumer};
pub use error::{QueueError, QueueResult};
pub use ledger::{RedisRetryLedger, RetryLedger, LEDGER_KEY_PREFIX};
pub use memory::{MemoryQueue, MemoryRetryLedger};
pub use progress::{
    channel_name, LocalProgressRelay, ProgressRelay, ProgressSubscriber, RedisProgressRelay,
    DEFAULT_RELAY_BUFFER,
};
pub use queue::{Delivery, JobPublisher, JobQueue, QueueConfig, MIN_TIMER_PERIOD};
