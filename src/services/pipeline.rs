use std::sync::Arc;
use uuid::Uuid;

use crate::db::{JobStore, StoreError};
use crate::models::job::{AnalysisJob, ImageInput};
use crate::services::fusion;
use crate::services::inference::{InferenceClient, InferenceError};
use crate::services::notify::{AnalysisEvent, EventPublisher};

/// Why an attempt ended in `failed`.
#[derive(Debug, thiserror::Error)]
pub enum FailureCause {
    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error("Failed to persist analysis result: {0}")]
    Persistence(StoreError),
}

impl FailureCause {
    pub fn is_transient(&self) -> bool {
        match self {
            FailureCause::Inference(e) => e.is_transient(),
            FailureCause::Persistence(_) => true,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            FailureCause::Inference(e) => e.user_message(),
            FailureCause::Persistence(_) => {
                "The analysis finished but its result could not be saved. Please retry.".to_string()
            }
        }
    }
}

#[derive(Debug)]
pub enum AnalysisOutcome {
    Completed(AnalysisJob),
    Failed { job: AnalysisJob, cause: FailureCause },
}

impl AnalysisOutcome {
    pub fn job(&self) -> &AnalysisJob {
        match self {
            AnalysisOutcome::Completed(job) => job,
            AnalysisOutcome::Failed { job, .. } => job,
        }
    }

    pub fn into_job(self) -> AnalysisJob {
        match self {
            AnalysisOutcome::Completed(job) => job,
            AnalysisOutcome::Failed { job, .. } => job,
        }
    }
}

/// One attempt at a job: `processing`, inference, fusion, then `completed`
/// or `failed`. Shared by inline execution and the queue worker.
pub struct AnalysisPipeline {
    jobs: Arc<dyn JobStore>,
    inference: Arc<InferenceClient>,
    events: EventPublisher,
}

impl AnalysisPipeline {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        inference: Arc<InferenceClient>,
        events: EventPublisher,
    ) -> Self {
        Self {
            jobs,
            inference,
            events,
        }
    }

    /// Drive `job_id` through one attempt.
    ///
    /// `Err` means the job could not be moved into `processing` or the
    /// failure could not be recorded; every other outcome is persisted.
    pub async fn run(
        &self,
        job_id: Uuid,
        input: &ImageInput,
    ) -> Result<AnalysisOutcome, StoreError> {
        let job = self.jobs.begin_attempt(job_id).await?;
        self.attempt(job, input).await
    }

    /// Continue with a job the caller already moved into `processing`.
    pub async fn attempt(
        &self,
        job: AnalysisJob,
        input: &ImageInput,
    ) -> Result<AnalysisOutcome, StoreError> {
        let job_id = job.id;
        tracing::info!(
            job_id = %job_id,
            owner_id = %job.owner_id,
            scan_type = %input.scan_type,
            retry_count = job.retry_count,
            "Starting analysis attempt"
        );

        let report = match self.inference.analyze(input).await {
            Ok(report) => report,
            Err(e) => return self.record_failure(job_id, e.into()).await,
        };

        let result = fusion::fuse(report.output, report.elapsed);
        let job = match self.jobs.complete_job(job_id, &result).await {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to persist analysis result");
                return self.record_failure(job_id, FailureCause::Persistence(e)).await;
            }
        };

        metrics::counter!("analysis_jobs_completed_total").increment(1);
        tracing::info!(
            job_id = %job_id,
            inference_attempts = report.attempts,
            primary = ?result.primary.as_ref().map(|p| p.label.as_str()),
            "Analysis completed"
        );

        self.events.publish(AnalysisEvent::Completed {
            job_id,
            owner_id: job.owner_id.clone(),
            scan_type: job.input.scan_type.clone(),
            primary_prediction: result.primary.clone(),
            model_version: result.model_version.clone(),
        });

        Ok(AnalysisOutcome::Completed(job))
    }

    async fn record_failure(
        &self,
        job_id: Uuid,
        cause: FailureCause,
    ) -> Result<AnalysisOutcome, StoreError> {
        let job = match self.jobs.fail_job(job_id, &cause.user_message()).await {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(
                    job_id = %job_id,
                    error = %e,
                    cause = %cause,
                    "Could not mark job as failed"
                );
                return Err(e);
            }
        };

        metrics::counter!("analysis_jobs_failed_total").increment(1);
        tracing::warn!(
            job_id = %job_id,
            transient = cause.is_transient(),
            error = %cause,
            "Analysis attempt failed"
        );

        Ok(AnalysisOutcome::Failed { job, cause })
    }
}
