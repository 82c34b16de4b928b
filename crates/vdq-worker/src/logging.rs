//! Structured job logging utilities.
//!
//! Every line for one delivery carries the same message id, attempt and
//! fingerprint fields, so a job can be followed across retries.

use tracing::{error, info, warn, Span};

use vdq_models::{Fingerprint, MessageId};

use crate::error::JobState;

/// Job logger for structured logging with consistent formatting.
#[derive(Debug, Clone)]
pub struct JobLogger {
    message_id: String,
    attempt: u32,
    fingerprint: String,
}

impl JobLogger {
    pub fn new(message_id: &MessageId, attempt: u32, fingerprint: &Fingerprint) -> Self {
        Self {
            message_id: message_id.to_string(),
            attempt,
            fingerprint: fingerprint.to_string(),
        }
    }

    /// Log the start of a delivery.
    pub fn log_start(&self, message: &str) {
        info!(
            message_id = %self.message_id,
            attempt = self.attempt,
            fingerprint = %self.fingerprint,
            "Job started: {}", message
        );
    }

    /// Log a state transition.
    pub fn log_transition(&self, from: JobState, to: JobState) {
        info!(
            message_id = %self.message_id,
            attempt = self.attempt,
            fingerprint = %self.fingerprint,
            from = %from,
            to = %to,
            "Job state: {} -> {}", from, to
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            message_id = %self.message_id,
            attempt = self.attempt,
            fingerprint = %self.fingerprint,
            "Job warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            message_id = %self.message_id,
            attempt = self.attempt,
            fingerprint = %self.fingerprint,
            "Job error: {}", message
        );
    }

    /// Log the end of a delivery.
    pub fn log_completion(&self, message: &str) {
        info!(
            message_id = %self.message_id,
            attempt = self.attempt,
            fingerprint = %self.fingerprint,
            "Job finished: {}", message
        );
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Create a tracing span for this delivery.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            message_id = %self.message_id,
            attempt = self.attempt,
            fingerprint = %self.fingerprint
        )
    }
}

/// Ordered record of the states one delivery went through.
#[derive(Debug)]
pub struct StateTrail<'a> {
    logger: &'a JobLogger,
    states: Vec<JobState>,
}

impl<'a> StateTrail<'a> {
    /// Start in `RECEIVED`.
    pub fn new(logger: &'a JobLogger) -> Self {
        Self {
            logger,
            states: vec![JobState::Received],
        }
    }

    pub fn enter(&mut self, next: JobState) {
        let current = self.current();
        self.logger.log_transition(current, next);
        self.states.push(next);
    }

    pub fn current(&self) -> JobState {
        self.states.last().copied().unwrap_or(JobState::Received)
    }

    pub fn into_states(self) -> Vec<JobState> {
        self.states
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_logger_fields() {
        let logger = JobLogger::new(
            &MessageId::from_string("1700000000000-0"),
            2,
            &Fingerprint::of("https://x/a"),
        );

        assert_eq!(logger.message_id(), "1700000000000-0");
        assert_eq!(logger.attempt(), 2);
    }

    #[test]
    fn test_state_trail_records_order() {
        let logger = JobLogger::new(&MessageId::from_string("1-0"), 0, &Fingerprint::of("k"));
        let mut trail = StateTrail::new(&logger);

        trail.enter(JobState::CheckingDedup);
        trail.enter(JobState::Skipped);
        trail.enter(JobState::Acked);

        assert_eq!(trail.current(), JobState::Acked);
        assert_eq!(
            trail.into_states(),
            vec![
                JobState::Received,
                JobState::CheckingDedup,
                JobState::Skipped,
                JobState::Acked,
            ]
        );
    }
}
