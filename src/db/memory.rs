use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{JobStore, StoreError};
use crate::models::inference::AnalysisResult;
use crate::models::job::{AnalysisJob, NewAnalysisJob, TransitionError};

/// In-process job store. Applies the same transition rules as the
/// Postgres store through the model's state-machine methods.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, AnalysisJob>>,
    uploads: RwLock<HashMap<String, i64>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn upload_count(&self, owner_id: &str) -> i64 {
        self.uploads.read().await.get(owner_id).copied().unwrap_or(0)
    }

    async fn update<F>(&self, job_id: Uuid, apply: F) -> Result<AnalysisJob, StoreError>
    where
        F: FnOnce(&mut AnalysisJob) -> Result<(), TransitionError> + Send,
    {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;

        // Apply to a copy so a rejected transition leaves the record untouched.
        let mut next = job.clone();
        apply(&mut next)?;
        *job = next.clone();
        Ok(next)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, new: NewAnalysisJob) -> Result<AnalysisJob, StoreError> {
        let job = AnalysisJob::new(new, Utc::now());
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<AnalysisJob>, StoreError> {
        Ok(self.jobs.read().await.get(&job_id).cloned())
    }

    async fn begin_attempt(&self, job_id: Uuid) -> Result<AnalysisJob, StoreError> {
        self.update(job_id, |job| job.begin_attempt(Utc::now())).await
    }

    async fn claim_attempt(
        &self,
        job_id: Uuid,
        retry_count: i32,
    ) -> Result<AnalysisJob, StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        if job.retry_count != retry_count {
            return Err(StoreError::Superseded {
                job_id,
                expected: retry_count,
                current: job.retry_count,
            });
        }

        let mut next = job.clone();
        next.begin_attempt(Utc::now())?;
        *job = next.clone();
        Ok(next)
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        result: &AnalysisResult,
    ) -> Result<AnalysisJob, StoreError> {
        let result = result.clone();
        self.update(job_id, move |job| job.complete(result, Utc::now()))
            .await
    }

    async fn fail_job(&self, job_id: Uuid, message: &str) -> Result<AnalysisJob, StoreError> {
        self.update(job_id, |job| job.fail(message, Utc::now())).await
    }

    async fn reset_for_retry(&self, job_id: Uuid) -> Result<AnalysisJob, StoreError> {
        self.update(job_id, |job| job.reset_for_retry(Utc::now())).await
    }

    async fn record_upload(&self, owner_id: &str) -> Result<i64, StoreError> {
        let mut uploads = self.uploads.write().await;
        let count = uploads.entry(owner_id.to_string()).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
