use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{sleep, MissedTickBehavior};
use uuid::Uuid;

use crate::db::{JobStore, StoreError};
use crate::models::job::JobStatus;
use crate::services::pipeline::{AnalysisOutcome, AnalysisPipeline};
use crate::services::queue::{Delivery, JobQueue, QueueError, QueueMessage};
use crate::services::retry::RetryPolicy;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(900);
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

const ABANDONED_MESSAGE: &str =
    "The analysis could not be completed after repeated attempts. Please retry.";

/// What happened to one dequeued message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageOutcome {
    Completed,
    /// Terminal failure; no further queue attempts.
    Failed,
    /// A redelivery was enqueued after the backoff delay.
    RetryScheduled { next_attempt: u32 },
    /// Nothing to do: the job is missing, completed, or the message was
    /// superseded by a newer retry.
    Skipped,
}

/// Consumes queued jobs and drives them through the shared pipeline.
///
/// Adds the coarse, job-level retry tier: a transient failure is redelivered
/// up to `retry.max_attempts` times with its own exponential backoff.
pub struct QueueWorker {
    queue: Arc<dyn JobQueue>,
    jobs: Arc<dyn JobStore>,
    pipeline: Arc<AnalysisPipeline>,
    retry: RetryPolicy,
    concurrency: usize,
    poll_interval: Duration,
    visibility_timeout: Duration,
}

impl QueueWorker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        jobs: Arc<dyn JobStore>,
        pipeline: Arc<AnalysisPipeline>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            queue,
            jobs,
            pipeline,
            retry,
            concurrency: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    /// Poll until `shutdown` resolves, then wait for in-flight jobs.
    pub async fn run<F>(self: Arc<Self>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        tokio::pin!(shutdown);

        // First tick fires immediately, recovering anything a crashed worker left behind.
        let mut sweep = tokio::time::interval((self.visibility_timeout / 2).max(MIN_SWEEP_INTERVAL));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(concurrency = self.concurrency, "Queue worker started");

        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                _ = sweep.tick() => {
                    self.requeue_stale().await;
                    continue;
                }
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.queue.dequeue().await {
                Ok(Some(delivery)) => {
                    let worker = Arc::clone(&self);
                    tokio::spawn(async move {
                        worker.handle(delivery).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tracing::trace!("No jobs available, sleeping");
                    sleep(self.poll_interval).await;
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!(error = %e, "Failed to dequeue job");
                    sleep(self.poll_interval).await;
                }
            }
        }

        tracing::info!("Shutdown requested, waiting for in-flight jobs");
        if permits.acquire_many(self.concurrency as u32).await.is_err() {
            tracing::warn!("Worker permits closed before in-flight jobs drained");
        }
        tracing::info!("Queue worker stopped");
    }

    /// Dequeue and fully handle at most one message.
    pub async fn poll_once(&self) -> Result<Option<MessageOutcome>, QueueError> {
        match self.queue.dequeue().await? {
            Some(delivery) => Ok(Some(self.handle(delivery).await)),
            None => Ok(None),
        }
    }

    async fn handle(&self, delivery: Delivery) -> MessageOutcome {
        let outcome = self.process(&delivery.message).await;
        if let Err(e) = self.queue.ack(&delivery).await {
            tracing::error!(job_id = %delivery.message.job_id, error = %e, "Failed to ack queue message");
        }
        outcome
    }

    pub async fn process(&self, message: &QueueMessage) -> MessageOutcome {
        let job_id = message.job_id;

        let job = match self.jobs.claim_attempt(job_id, message.retry_count).await {
            Ok(job) => job,
            Err(StoreError::NotFound(_)) => {
                tracing::warn!(job_id = %job_id, "Queued job no longer exists, dropping message");
                return MessageOutcome::Skipped;
            }
            Err(e @ (StoreError::Transition(_) | StoreError::Superseded { .. })) => {
                tracing::info!(job_id = %job_id, reason = %e, "Stale queue message, dropping");
                return MessageOutcome::Skipped;
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Could not claim queued job");
                return self.schedule_retry(message, message.retry_count).await;
            }
        };

        tracing::info!(
            job_id = %job_id,
            attempt = message.attempt,
            retry_count = job.retry_count,
            is_retry = message.is_retry,
            "Processing queued analysis job"
        );

        let generation = job.retry_count;
        match self.pipeline.attempt(job, &message.input).await {
            Ok(AnalysisOutcome::Completed(_)) => MessageOutcome::Completed,
            Ok(AnalysisOutcome::Failed { cause, .. }) => {
                if cause.is_transient() {
                    self.schedule_retry(message, generation).await
                } else {
                    tracing::warn!(job_id = %job_id, error = %cause, "Permanent failure, not retrying");
                    MessageOutcome::Failed
                }
            }
            Err(StoreError::Transition(e)) => {
                tracing::warn!(job_id = %job_id, error = %e, "Job not runnable, dropping message");
                MessageOutcome::Skipped
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Store error while processing job");
                self.schedule_retry(message, generation).await
            }
        }
    }

    /// Hand in-flight messages older than the visibility timeout back to
    /// the queue.
    pub async fn requeue_stale(&self) -> u64 {
        match self.queue.requeue_stale(self.visibility_timeout).await {
            Ok(0) => 0,
            Ok(moved) => {
                tracing::warn!(moved, "Requeued deliveries abandoned by a previous worker");
                moved
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to requeue stale deliveries");
                0
            }
        }
    }

    /// Wait out the backoff for this attempt, then enqueue the redelivery for
    /// `generation`, the job's `retry_count` after the failed attempt. The
    /// current message stays in flight until then.
    async fn schedule_retry(&self, message: &QueueMessage, generation: i32) -> MessageOutcome {
        let job_id = message.job_id;
        if !self.retry.allows_another(message.attempt) {
            tracing::warn!(
                job_id = %job_id,
                attempts = message.attempt,
                "Job failed after max queue attempts"
            );
            self.abandon(job_id, generation).await;
            return MessageOutcome::Failed;
        }

        let delay = self.retry.delay_for(message.attempt);
        tracing::info!(
            job_id = %job_id,
            next_attempt = message.attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "Job re-queued for retry"
        );
        sleep(delay).await;

        // A manual retry during the backoff owns the job now.
        match self.jobs.get_job(job_id).await {
            Ok(Some(job)) if job.retry_count == generation && job.status != JobStatus::Completed => {}
            Ok(Some(job)) => {
                tracing::info!(
                    job_id = %job_id,
                    status = %job.status,
                    retry_count = job.retry_count,
                    "Job moved on during backoff, dropping queue retry"
                );
                return MessageOutcome::Skipped;
            }
            Ok(None) => return MessageOutcome::Skipped,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Could not re-check job before re-queueing");
            }
        }

        let next = message.next_attempt(generation);
        if let Err(e) = self.queue.enqueue(&next).await {
            tracing::error!(job_id = %job_id, error = %e, "Failed to re-queue job");
            self.abandon(job_id, generation).await;
            return MessageOutcome::Failed;
        }

        metrics::counter!("analysis_job_retries_total", "kind" => "queue").increment(1);
        MessageOutcome::RetryScheduled {
            next_attempt: next.attempt,
        }
    }

    /// The queue tier is giving up. A job still `processing` for this
    /// generation would otherwise never leave it.
    async fn abandon(&self, job_id: Uuid, generation: i32) {
        let job = match self.jobs.get_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Could not load job to mark it failed");
                return;
            }
        };

        if job.status != JobStatus::Processing || job.retry_count != generation {
            return;
        }

        match self.jobs.fail_job(job_id, ABANDONED_MESSAGE).await {
            Ok(_) => {
                metrics::counter!("analysis_jobs_failed_total").increment(1);
                tracing::warn!(job_id = %job_id, "Marked abandoned job as failed");
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Could not mark abandoned job as failed");
            }
        }
    }
}
