use std::sync::Arc;
use uuid::Uuid;

use crate::config::ExecutionMode;
use crate::db::{JobStore, StoreError};
use crate::models::job::{AnalysisJob, JobStatus};
use crate::services::pipeline::AnalysisPipeline;
use crate::services::queue::{JobQueue, QueueError, QueueMessage};

/// Queue availability, probed once at startup.
pub enum QueueState {
    Ready(Arc<dyn JobQueue>),
    Unavailable,
}

impl QueueState {
    pub async fn probe(queue: Option<Arc<dyn JobQueue>>) -> Self {
        let Some(queue) = queue else {
            return QueueState::Unavailable;
        };
        match queue.health_check().await {
            Ok(()) => QueueState::Ready(queue),
            Err(e) => {
                tracing::warn!(error = %e, "Job queue health check failed");
                QueueState::Unavailable
            }
        }
    }
}

/// How submitted jobs are executed. Chosen once, never per request.
#[derive(Clone)]
pub enum ExecutionStrategy {
    /// The submitting request blocks until the job completes or fails.
    Inline,
    /// The job is handed to the queue and the request returns immediately.
    Queued(Arc<dyn JobQueue>),
}

impl ExecutionStrategy {
    /// Queued mode without a reachable queue falls back to inline rather than
    /// accepting jobs nothing will process.
    pub fn select(mode: ExecutionMode, queue: QueueState) -> Self {
        match (mode, queue) {
            (ExecutionMode::Inline, _) => ExecutionStrategy::Inline,
            (ExecutionMode::Queued, QueueState::Ready(queue)) => ExecutionStrategy::Queued(queue),
            (ExecutionMode::Queued, QueueState::Unavailable) => {
                tracing::warn!("Queued execution configured but queue unavailable, falling back to inline");
                ExecutionStrategy::Inline
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExecutionStrategy::Inline => "inline",
            ExecutionStrategy::Queued(_) => "queued",
        }
    }

    pub fn queue(&self) -> Option<&Arc<dyn JobQueue>> {
        match self {
            ExecutionStrategy::Inline => None,
            ExecutionStrategy::Queued(queue) => Some(queue),
        }
    }
}

#[derive(Debug)]
pub enum SubmitOutcome {
    /// Ran to a terminal state within the call (inline).
    Finished(AnalysisJob),
    /// Handed to the queue; the job is `processing`.
    Accepted(AnalysisJob),
}

impl SubmitOutcome {
    pub fn job(&self) -> &AnalysisJob {
        match self {
            SubmitOutcome::Finished(job) | SubmitOutcome::Accepted(job) => job,
        }
    }
}

pub struct Executor {
    strategy: ExecutionStrategy,
    jobs: Arc<dyn JobStore>,
    pipeline: Arc<AnalysisPipeline>,
}

impl Executor {
    pub fn new(
        strategy: ExecutionStrategy,
        jobs: Arc<dyn JobStore>,
        pipeline: Arc<AnalysisPipeline>,
    ) -> Self {
        Self {
            strategy,
            jobs,
            pipeline,
        }
    }

    pub fn strategy(&self) -> &ExecutionStrategy {
        &self.strategy
    }

    /// Execute a job that is currently `uploaded`.
    pub async fn submit(
        &self,
        job: &AnalysisJob,
        is_retry: bool,
    ) -> Result<SubmitOutcome, ExecuteError> {
        match &self.strategy {
            ExecutionStrategy::Inline => {
                let outcome = self.pipeline.run(job.id, &job.input).await?;
                Ok(SubmitOutcome::Finished(outcome.into_job()))
            }
            ExecutionStrategy::Queued(queue) => {
                let processing = self.jobs.begin_attempt(job.id).await?;
                let message =
                    QueueMessage::new(job.id, job.owner_id.clone(), job.input.clone(), is_retry)
                        .with_retry_count(processing.retry_count);

                if let Err(e) = queue.enqueue(&message).await {
                    tracing::error!(job_id = %job.id, error = %e, "Failed to enqueue analysis job");
                    self.jobs
                        .fail_job(
                            job.id,
                            "The analysis queue is unavailable. Please retry later.",
                        )
                        .await?;
                    return Err(ExecuteError::QueueUnavailable(e));
                }

                tracing::info!(job_id = %job.id, is_retry, "Analysis job enqueued");
                Ok(SubmitOutcome::Accepted(processing))
            }
        }
    }

    /// Manual retry of a `failed` job owned by `owner_id`.
    ///
    /// Any other status is rejected without touching the record.
    pub async fn retry(&self, job_id: Uuid, owner_id: &str) -> Result<SubmitOutcome, ExecuteError> {
        let job = self
            .jobs
            .get_job(job_id)
            .await?
            .filter(|job| job.owner_id == owner_id)
            .ok_or(ExecuteError::NotFound(job_id))?;

        if job.status != JobStatus::Failed {
            return Err(ExecuteError::NotRetryable {
                job_id,
                status: job.status,
            });
        }

        let job = match self.jobs.reset_for_retry(job_id).await {
            Ok(job) => job,
            Err(StoreError::Transition(t)) => {
                return Err(ExecuteError::NotRetryable {
                    job_id,
                    status: t.from,
                })
            }
            Err(e) => return Err(e.into()),
        };

        metrics::counter!("analysis_job_retries_total", "kind" => "manual").increment(1);
        tracing::info!(job_id = %job_id, retry_count = job.retry_count, "Retrying analysis job");

        self.submit(&job, true).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("Analysis job {0} not found")]
    NotFound(Uuid),

    #[error("Analysis job {job_id} is {status}; only failed jobs can be retried")]
    NotRetryable { job_id: Uuid, status: JobStatus },

    #[error("Job queue unavailable: {0}")]
    QueueUnavailable(QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
