use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::models::inference::PrimaryFinding;
use crate::models::job::{AnalysisJob, JobStatus};

/// Metadata submitted alongside an image.
#[derive(Debug, Deserialize, Validate)]
pub struct SubmitMetadata {
    #[garde(length(min = 1, max = 64), custom(scan_type_chars))]
    pub scan_type: String,

    #[garde(length(max = 2000))]
    pub notes: Option<String>,
}

fn scan_type_chars(value: &str, _ctx: &()) -> garde::Result {
    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        Ok(())
    } else {
        Err(garde::Error::new(
            "may only contain letters, digits, '_' and '-'",
        ))
    }
}

/// Response when a job was handed to the queue.
#[derive(Debug, Serialize)]
pub struct SubmitAccepted {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub message: String,
}

/// Completed-job payload as exposed over HTTP.
#[derive(Debug, Serialize)]
pub struct ResultView {
    pub predictions: BTreeMap<String, f64>,
    pub primary_prediction: Option<PrimaryFinding>,
    pub model_version: String,
    pub inference_id: Option<String>,
    pub inference_time_ms: f64,
    pub warnings: Vec<String>,
    pub auxiliary: Value,
}

/// Response for querying job status.
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub scan_type: String,
    pub original_filename: String,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub result: Option<ResultView>,
    pub error: Option<String>,
}

impl From<&AnalysisJob> for JobStatusResponse {
    fn from(job: &AnalysisJob) -> Self {
        let result = match job.status {
            JobStatus::Completed => job.result.as_ref().map(|r| ResultView {
                predictions: r.findings.clone(),
                primary_prediction: r.primary.clone(),
                model_version: r.model_version.clone(),
                inference_id: r.inference_id.clone(),
                inference_time_ms: r.inference_ms,
                warnings: r.warnings.clone(),
                auxiliary: r.auxiliary.clone(),
            }),
            _ => None,
        };

        Self {
            job_id: job.id,
            status: job.status,
            scan_type: job.input.scan_type.clone(),
            original_filename: job.input.original_filename.clone(),
            retry_count: job.retry_count,
            created_at: job.created_at,
            processed_at: job.processed_at,
            result,
            error: job.failure().map(|f| f.message),
        }
    }
}
