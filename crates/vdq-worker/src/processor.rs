//! Per-delivery state machine.
//!
//! `RECEIVED -> CHECKING_DEDUP -> {SKIPPED | FETCHING} -> {UPLOADING | FAILED}
//! -> {ACKED | REQUEUED | DROPPED}`

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use vdq_media::Extractor;
use vdq_models::{
    artifact_key, download_file_name, DownloadProgress, FetchJob, Fingerprint, ProgressMessage,
};
use vdq_queue::{Delivery, DeliveryHandler, Disposition, JobPublisher, ProgressRelay, RetryLedger};
use vdq_storage::{ArtifactStore, IdempotencyStore};

use crate::config::{RetryPolicy, WorkerConfig};
use crate::error::{DropReason, JobOutcome, JobState, WorkerError, WorkerResult};
use crate::logging::{JobLogger, StateTrail};
use crate::metrics;
use crate::retry::{retry_async, RetryConfig, RetryResult};

/// Collaborators a processor works with. Built once at startup.
#[derive(Clone)]
pub struct ProcessingContext {
    pub publisher: Arc<dyn JobPublisher>,
    pub ledger: Arc<dyn RetryLedger>,
    pub store: Arc<dyn ArtifactStore>,
    pub extractor: Arc<dyn Extractor>,
    pub relay: Arc<dyn ProgressRelay>,
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub outcome: JobOutcome,
    /// States visited, starting at `RECEIVED`
    pub states: Vec<JobState>,
}

/// Applies the retry and dedup rules to each delivery.
pub struct JobProcessor {
    ctx: ProcessingContext,
    dedup: IdempotencyStore,
    policy: RetryPolicy,
    presign_expiry: Duration,
    republish: RetryConfig,
}

impl JobProcessor {
    pub fn new(ctx: ProcessingContext, config: &WorkerConfig) -> Self {
        let dedup = IdempotencyStore::new(Arc::clone(&ctx.store), config.min_valid_size);
        Self {
            ctx,
            dedup,
            policy: config.retry.clone(),
            presign_expiry: config.presign_expiry,
            republish: RetryConfig::new("republish").with_max_retries(3),
        }
    }

    /// Override the backoff used when republishing.
    pub fn with_republish_retry(mut self, republish: RetryConfig) -> Self {
        self.republish = republish;
        self
    }

    /// Run one delivery through the state machine.
    pub async fn process(&self, delivery: &Delivery) -> JobReport {
        let job = &delivery.job;
        let fingerprint = job.fingerprint();
        let logger = JobLogger::new(&delivery.message_id, job.attempt, &fingerprint);
        let mut trail = StateTrail::new(&logger);

        logger.log_start(&format!(
            "key={} delivery={}",
            job.key, delivery.delivery_count
        ));

        let outcome = self.run(job, &fingerprint, &logger, &mut trail).await;

        metrics::record_job_outcome(outcome.label());
        logger.log_completion(&format!("{} ({})", trail.current(), outcome.label()));

        JobReport {
            outcome,
            states: trail.into_states(),
        }
    }

    async fn run(
        &self,
        job: &FetchJob,
        fingerprint: &Fingerprint,
        logger: &JobLogger,
        trail: &mut StateTrail<'_>,
    ) -> JobOutcome {
        if job.is_exhausted(self.policy.max_attempts) {
            return self.drop_job(
                job,
                DropReason::MaxAttemptsExceeded {
                    attempt: job.attempt,
                },
                logger,
                trail,
            );
        }

        trail.enter(JobState::CheckingDedup);
        match self.dedup.find_valid(fingerprint).await {
            Ok(Some(existing)) => {
                trail.enter(JobState::Skipped);
                self.notify_completed(job, &existing.key).await;
                trail.enter(JobState::Acked);
                return JobOutcome::DuplicateSkip {
                    object_key: existing.key,
                };
            }
            Ok(None) => {}
            Err(e) => {
                return retain(WorkerError::transient(format!("dedup lookup: {}", e)), logger);
            }
        }

        // Counts every fetch of this key, whichever lineage it came from.
        match self.ctx.ledger.increment(fingerprint).await {
            Ok(count) if count > self.policy.max_url_retries => {
                return self.drop_job(job, DropReason::RateLimitExceeded { count }, logger, trail);
            }
            Ok(count) => {
                tracing::debug!(fingerprint = %fingerprint, count, "Ledger admitted fetch");
            }
            Err(e) => {
                return retain(WorkerError::transient(format!("retry ledger: {}", e)), logger);
            }
        }

        trail.enter(JobState::Fetching);
        match self.fetch_and_store(job, fingerprint, trail).await {
            Ok(object_key) => {
                self.notify_completed(job, &object_key).await;
                trail.enter(JobState::Acked);
                JobOutcome::Completed { object_key }
            }
            Err(e) => {
                trail.enter(JobState::Failed);
                logger.log_warning(&e.to_string());
                self.schedule_retry(job, e, logger, trail).await
            }
        }
    }

    async fn fetch_and_store(
        &self,
        job: &FetchJob,
        fingerprint: &Fingerprint,
        trail: &mut StateTrail<'_>,
    ) -> WorkerResult<String> {
        let on_progress = |progress: DownloadProgress| {
            let (Some(client_ref), Some(message)) = (
                job.client_ref.as_deref(),
                ProgressMessage::from_progress(&progress),
            ) else {
                return;
            };
            self.ctx.relay.emit(client_ref, message);
            metrics::record_progress_event();
        };

        let started = Instant::now();
        let extracted = self
            .ctx
            .extractor
            .fetch(&job.key, &on_progress)
            .await
            .map_err(|e| WorkerError::extraction_failure(e.to_string()))?;
        metrics::record_fetch_duration(started.elapsed().as_secs_f64());

        trail.enter(JobState::Uploading);
        let object_key = artifact_key(fingerprint, extracted.extension());
        let file_name = download_file_name(&extracted.title, extracted.extension());

        let started = Instant::now();
        let uploaded = self
            .ctx
            .store
            .put(&object_key, &extracted.local_path, Some(&file_name))
            .await;
        extracted.cleanup().await;

        uploaded.map_err(|e| WorkerError::storage_failure(e.to_string()))?;
        metrics::record_upload_duration(started.elapsed().as_secs_f64());

        Ok(object_key)
    }

    async fn schedule_retry(
        &self,
        job: &FetchJob,
        error: WorkerError,
        logger: &JobLogger,
        trail: &mut StateTrail<'_>,
    ) -> JobOutcome {
        let next = job.next_attempt();
        if next.is_exhausted(self.policy.max_attempts) {
            return self.drop_job(
                job,
                DropReason::MaxAttemptsExceeded {
                    attempt: next.attempt,
                },
                logger,
                trail,
            );
        }

        let published =
            retry_async(&self.republish, || self.ctx.publisher.publish(next.clone())).await;
        match published {
            RetryResult::Success(message_id) => {
                trail.enter(JobState::Requeued);
                JobOutcome::RetryScheduled {
                    next_attempt: next.attempt,
                    message_id,
                    reason: error.to_string(),
                }
            }
            // The original stays pending and comes back through redelivery.
            RetryResult::Failed { error, attempts } => retain(
                WorkerError::transient(format!(
                    "republish failed after {} attempts: {}",
                    attempts, error
                )),
                logger,
            ),
        }
    }

    fn drop_job(
        &self,
        job: &FetchJob,
        reason: DropReason,
        logger: &JobLogger,
        trail: &mut StateTrail<'_>,
    ) -> JobOutcome {
        trail.enter(JobState::Dropped);
        logger.log_error(&format!("Giving up: {}", reason));
        self.notify(job, ProgressMessage::failed(reason.to_string()));
        JobOutcome::Dropped(reason)
    }

    async fn notify_completed(&self, job: &FetchJob, object_key: &str) {
        if job.client_ref.is_none() {
            return;
        }

        let download_url = match self.ctx.store.presign(object_key, self.presign_expiry).await {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::warn!(object_key, "Failed to presign download link: {}", e);
                None
            }
        };
        self.notify(job, ProgressMessage::completed(object_key, download_url));
    }

    fn notify(&self, job: &FetchJob, message: ProgressMessage) {
        if let Some(client_ref) = job.client_ref.as_deref() {
            self.ctx.relay.emit(client_ref, message);
        }
    }
}

fn retain(error: WorkerError, logger: &JobLogger) -> JobOutcome {
    logger.log_warning(&format!("{}; leaving message for redelivery", error));
    JobOutcome::Retained {
        reason: error.to_string(),
    }
}

#[async_trait]
impl DeliveryHandler for JobProcessor {
    async fn handle(&self, delivery: &Delivery) -> Disposition {
        let report = self.process(delivery).await;
        if report.outcome.should_ack() {
            Disposition::Ack
        } else {
            Disposition::Retain
        }
    }
}
