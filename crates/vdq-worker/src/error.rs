//! Worker error types and job outcomes.

use std::fmt;

use thiserror::Error;

use vdq_models::MessageId;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// The adapter could not produce a file.
    #[error("Extraction failed: {0}")]
    ExtractionFailure(String),

    /// The artifact could not be written.
    #[error("Storage failed: {0}")]
    StorageFailure(String),

    /// Broker, cache or store unreachable. Never a job failure.
    #[error("Infrastructure unavailable: {0}")]
    TransientInfra(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Queue error: {0}")]
    Queue(#[from] vdq_queue::QueueError),
}

impl WorkerError {
    pub fn extraction_failure(msg: impl Into<String>) -> Self {
        Self::ExtractionFailure(msg.into())
    }

    pub fn storage_failure(msg: impl Into<String>) -> Self {
        Self::StorageFailure(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientInfra(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }
}

/// Why a job was given up for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// The message lineage used up its attempts.
    MaxAttemptsExceeded { attempt: u32 },
    /// The key hit its ledger cap for the current window.
    RateLimitExceeded { count: u64 },
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::MaxAttemptsExceeded { attempt } => {
                write!(f, "max attempts exceeded (attempt {})", attempt)
            }
            DropReason::RateLimitExceeded { count } => {
                write!(f, "max retries exceeded for this URL ({} attempts)", count)
            }
        }
    }
}

/// Result of handling one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Fetched and stored.
    Completed { object_key: String },
    /// A valid artifact already existed; not an error.
    DuplicateSkip { object_key: String },
    /// Failed; republished with the next attempt.
    RetryScheduled {
        next_attempt: u32,
        message_id: MessageId,
        reason: String,
    },
    /// Terminal give-up.
    Dropped(DropReason),
    /// Infrastructure trouble; the delivery stays pending.
    Retained { reason: String },
}

impl JobOutcome {
    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Completed { .. } => "completed",
            JobOutcome::DuplicateSkip { .. } => "duplicate_skip",
            JobOutcome::RetryScheduled { .. } => "retry_scheduled",
            JobOutcome::Dropped(DropReason::MaxAttemptsExceeded { .. }) => "max_attempts_exceeded",
            JobOutcome::Dropped(DropReason::RateLimitExceeded { .. }) => "rate_limit_exceeded",
            JobOutcome::Retained { .. } => "retained",
        }
    }

    /// Whether the delivery should be acknowledged.
    pub fn should_ack(&self) -> bool {
        !matches!(self, JobOutcome::Retained { .. })
    }
}

/// Processing states of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Received,
    CheckingDedup,
    Skipped,
    Fetching,
    Uploading,
    Failed,
    Acked,
    Requeued,
    Dropped,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Received => "RECEIVED",
            JobState::CheckingDedup => "CHECKING_DEDUP",
            JobState::Skipped => "SKIPPED",
            JobState::Fetching => "FETCHING",
            JobState::Uploading => "UPLOADING",
            JobState::Failed => "FAILED",
            JobState::Acked => "ACKED",
            JobState::Requeued => "REQUEUED",
            JobState::Dropped => "DROPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Acked | JobState::Requeued | JobState::Dropped)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            WorkerError::extraction_failure("HTTP 403").to_string(),
            "Extraction failed: HTTP 403"
        );
        assert_eq!(
            WorkerError::transient("redis down").to_string(),
            "Infrastructure unavailable: redis down"
        );
    }

    #[test]
    fn test_only_retained_outcome_skips_ack() {
        assert!(!JobOutcome::Retained { reason: "x".into() }.should_ack());
        assert!(JobOutcome::Dropped(DropReason::RateLimitExceeded { count: 6 }).should_ack());
        assert!(JobOutcome::DuplicateSkip { object_key: "k".into() }.should_ack());
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Requeued.is_terminal());
        assert!(!JobState::Failed.is_terminal());
        assert_eq!(JobState::CheckingDedup.to_string(), "CHECKING_DEDUP");
    }
}
