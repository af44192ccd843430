use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{JobStore, StoreError};
use crate::models::inference::AnalysisResult;
use crate::models::job::{AnalysisJob, ImageInput, JobStatus, NewAnalysisJob};

const JOB_COLUMNS: &str = r#"
    id, owner_id, storage_key, original_filename, byte_size, mime_type, scan_type,
    notes, status, result, error, retry_count, created_at, updated_at, processed_at
"#;

// SET expressions see the pre-update row, so the CASEs test the old status.
const BEGIN_ATTEMPT_SET: &str = "status = 'processing', \
     retry_count = retry_count + CASE WHEN status = 'failed' THEN 1 ELSE 0 END, \
     error = CASE WHEN status = 'failed' THEN $4::text ELSE error END, \
     result = COALESCE($3::jsonb, result)";

/// Postgres-backed job store.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Guarded transition. `set_clause` must reference `$3` (result JSONB)
    /// and `$4` (error text). A miss means the job is gone, not in one of
    /// the statuses `to` may be entered from, or past `expected_retry`.
    async fn transition(
        &self,
        job_id: Uuid,
        to: JobStatus,
        set_clause: &str,
        bind_result: Option<serde_json::Value>,
        bind_error: Option<&str>,
        expected_retry: Option<i32>,
    ) -> Result<AnalysisJob, StoreError> {
        let sources: Vec<&'static str> = JobStatus::sources_of(to)
            .into_iter()
            .map(JobStatus::as_str)
            .collect();

        let sql = format!(
            "UPDATE analysis_jobs SET {set_clause}, updated_at = NOW() \
             WHERE id = $1 AND status = ANY($2) \
               AND ($5::int IS NULL OR retry_count = $5) \
             RETURNING {JOB_COLUMNS}"
        );

        let row = sqlx::query(&sql)
            .bind(job_id)
            .bind(&sources)
            .bind(bind_result)
            .bind(bind_error)
            .bind(expected_retry)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => job_from_row(&row),
            None => match self.get_job(job_id).await? {
                Some(current) => match expected_retry {
                    Some(expected) if current.retry_count != expected => {
                        Err(StoreError::Superseded {
                            job_id,
                            expected,
                            current: current.retry_count,
                        })
                    }
                    _ => Err(StoreError::invalid_transition(current.status, to)),
                },
                None => Err(StoreError::NotFound(job_id)),
            },
        }
    }
}

fn job_from_row(row: &PgRow) -> Result<AnalysisJob, StoreError> {
    let job_id: Uuid = row.try_get("id")?;
    let status_str: String = row.try_get("status")?;
    let status = status_str.parse::<JobStatus>().map_err(|_| StoreError::Corrupt {
        job_id,
        reason: format!("unknown status '{status_str}'"),
    })?;

    let result = row
        .try_get::<Option<serde_json::Value>, _>("result")?
        .map(serde_json::from_value::<AnalysisResult>)
        .transpose()
        .map_err(|e| StoreError::Corrupt {
            job_id,
            reason: format!("unreadable result payload: {e}"),
        })?;

    Ok(AnalysisJob {
        id: job_id,
        owner_id: row.try_get("owner_id")?,
        input: ImageInput {
            storage_key: row.try_get("storage_key")?,
            original_filename: row.try_get("original_filename")?,
            byte_size: row.try_get("byte_size")?,
            mime_type: row.try_get("mime_type")?,
            scan_type: row.try_get("scan_type")?,
        },
        notes: row.try_get("notes")?,
        status,
        result,
        error: row.try_get("error")?,
        retry_count: row.try_get("retry_count")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        processed_at: row.try_get("processed_at")?,
    })
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_job(&self, new: NewAnalysisJob) -> Result<AnalysisJob, StoreError> {
        let sql = format!(
            "INSERT INTO analysis_jobs \
               (owner_id, storage_key, original_filename, byte_size, mime_type, scan_type, notes, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, 'uploaded') \
             RETURNING {JOB_COLUMNS}"
        );

        let row = sqlx::query(&sql)
            .bind(&new.owner_id)
            .bind(&new.input.storage_key)
            .bind(&new.input.original_filename)
            .bind(new.input.byte_size)
            .bind(&new.input.mime_type)
            .bind(&new.input.scan_type)
            .bind(&new.notes)
            .fetch_one(&self.pool)
            .await?;

        job_from_row(&row)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<AnalysisJob>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn begin_attempt(&self, job_id: Uuid) -> Result<AnalysisJob, StoreError> {
        self.transition(job_id, JobStatus::Processing, BEGIN_ATTEMPT_SET, None, None, None)
            .await
    }

    async fn claim_attempt(
        &self,
        job_id: Uuid,
        retry_count: i32,
    ) -> Result<AnalysisJob, StoreError> {
        self.transition(
            job_id,
            JobStatus::Processing,
            BEGIN_ATTEMPT_SET,
            None,
            None,
            Some(retry_count),
        )
        .await
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        result: &AnalysisResult,
    ) -> Result<AnalysisJob, StoreError> {
        let payload = serde_json::to_value(result).map_err(|e| StoreError::Corrupt {
            job_id,
            reason: format!("result not serializable: {e}"),
        })?;

        self.transition(
            job_id,
            JobStatus::Completed,
            "status = 'completed', result = $3::jsonb, error = $4::text, processed_at = NOW()",
            Some(payload),
            None,
            None,
        )
        .await
    }

    async fn fail_job(&self, job_id: Uuid, message: &str) -> Result<AnalysisJob, StoreError> {
        self.transition(
            job_id,
            JobStatus::Failed,
            "status = 'failed', result = $3::jsonb, error = $4::text, processed_at = NOW()",
            None,
            Some(message),
            None,
        )
        .await
    }

    async fn reset_for_retry(&self, job_id: Uuid) -> Result<AnalysisJob, StoreError> {
        self.transition(
            job_id,
            JobStatus::Uploaded,
            "status = 'uploaded', retry_count = retry_count + 1, \
             error = $4::text, result = $3::jsonb",
            None,
            None,
            None,
        )
        .await
    }

    async fn record_upload(&self, owner_id: &str) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO owner_upload_stats (owner_id, upload_count, last_upload_at)
            VALUES ($1, 1, NOW())
            ON CONFLICT (owner_id) DO UPDATE
            SET upload_count = owner_upload_stats.upload_count + 1,
                last_upload_at = NOW()
            RETURNING upload_count
            "#,
        )
        .bind(owner_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("upload_count")?)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
