use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use uuid::Uuid;

use crate::models::inference::AnalysisResult;
use crate::models::job::{AnalysisJob, JobStatus, NewAnalysisJob, TransitionError};

pub mod memory;
pub mod queries;

pub use memory::MemoryJobStore;
pub use queries::PgJobStore;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

/// Persistence for analysis jobs.
///
/// Every transition is a single atomic update keyed by job id that replaces
/// the result/failure payload wholesale.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job in `uploaded`.
    async fn create_job(&self, new: NewAnalysisJob) -> Result<AnalysisJob, StoreError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<AnalysisJob>, StoreError>;

    /// Move into `processing`. Leaving `failed` increments `retry_count` and
    /// clears the error.
    async fn begin_attempt(&self, job_id: Uuid) -> Result<AnalysisJob, StoreError>;

    /// `begin_attempt`, but only while the job's `retry_count` still equals
    /// `retry_count`. A queue message is only valid for the generation it
    /// was issued for; anything newer fails with [`StoreError::Superseded`].
    async fn claim_attempt(
        &self,
        job_id: Uuid,
        retry_count: i32,
    ) -> Result<AnalysisJob, StoreError>;

    /// `processing → completed`, replacing any stored payload.
    async fn complete_job(
        &self,
        job_id: Uuid,
        result: &AnalysisResult,
    ) -> Result<AnalysisJob, StoreError>;

    /// `processing → failed`, clearing any result.
    async fn fail_job(&self, job_id: Uuid, message: &str) -> Result<AnalysisJob, StoreError>;

    /// Manual retry: `failed → uploaded`, incrementing `retry_count`.
    async fn reset_for_retry(&self, job_id: Uuid) -> Result<AnalysisJob, StoreError>;

    /// Bump the informational per-owner upload counter, returning the new total.
    async fn record_upload(&self, owner_id: &str) -> Result<i64, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Analysis job {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Analysis job {job_id} moved on to retry {current}, message was for retry {expected}")]
    Superseded {
        job_id: Uuid,
        expected: i32,
        current: i32,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt job record {job_id}: {reason}")]
    Corrupt { job_id: Uuid, reason: String },
}

impl StoreError {
    pub fn invalid_transition(from: JobStatus, to: JobStatus) -> Self {
        StoreError::Transition(TransitionError { from, to })
    }
}
