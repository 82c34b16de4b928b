//! Media fetch worker.
//!
//! This crate provides:
//! - The per-delivery state machine with dedup, ledger and bounded retry
//! - Job executor wiring the queue consumer to the processor
//! - The retention sweeper
//! - Graceful shutdown

pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod processor;
pub mod retry;
pub mod sweeper;

pub use config::{RetryPolicy, WorkerConfig};
pub use error::{DropReason, JobOutcome, JobState, WorkerError, WorkerResult};
pub use executor::JobExecutor;
pub use logging::JobLogger;
pub use processor::{JobProcessor, JobReport, ProcessingContext};
pub use retry::{retry_async, FailureTracker, RetryConfig, RetryResult};
pub use sweeper::{RetentionSweeper, SweepReport};
