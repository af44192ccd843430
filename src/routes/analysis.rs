use axum::extract::multipart::{Field, MultipartError};
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::analysis::{JobStatusResponse, SubmitAccepted, SubmitMetadata};
use crate::models::job::JobStatus;
use crate::routes::auth::Owner;
use crate::routes::error::{ApiError, ApiResult};
use crate::services::executor::SubmitOutcome;
use crate::services::ingest::{IngestError, Upload};

/// Inline runs answer with the finished job: 200 when completed, 502 when
/// the analysis failed. Queued runs answer 202 with the job id.
fn submission_response(outcome: SubmitOutcome) -> Response {
    match outcome {
        SubmitOutcome::Finished(job) => {
            let status = if job.status == JobStatus::Completed {
                StatusCode::OK
            } else {
                StatusCode::BAD_GATEWAY
            };
            (status, Json(JobStatusResponse::from(&job))).into_response()
        }
        SubmitOutcome::Accepted(job) => (
            StatusCode::ACCEPTED,
            Json(SubmitAccepted {
                job_id: job.id,
                status: job.status,
                message: "Scan accepted for analysis".to_string(),
            }),
        )
            .into_response(),
    }
}

fn multipart_error(e: MultipartError) -> ApiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge(e.body_text())
    } else {
        ApiError::BadRequest(e.body_text())
    }
}

/// Buffer a file field, giving up as soon as it passes `max` bytes.
async fn read_capped(mut field: Field<'_>, max: usize) -> ApiResult<Vec<u8>> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        if bytes.len() + chunk.len() > max {
            return Err(IngestError::TooLarge {
                size: bytes.len() + chunk.len(),
                max,
            }
            .into());
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

/// POST /api/v1/analyses: upload a scan for analysis.
pub async fn submit_analysis(
    State(state): State<AppState>,
    owner: Owner,
    mut multipart: Multipart,
) -> ApiResult<Response> {
    let max = state.ingestor.max_upload_bytes();
    let mut upload: Option<Upload> = None;
    let mut scan_type = String::new();
    let mut notes: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("image") | Some("file") => {
                let filename = field.file_name().map(str::to_string);
                let content_type = field.content_type().map(str::to_string);
                let bytes = read_capped(field, max).await?;
                upload = Some(Upload {
                    filename,
                    content_type,
                    bytes,
                });
            }
            Some("scan_type") | Some("scanType") => {
                scan_type = field.text().await.map_err(multipart_error)?.trim().to_string();
            }
            Some("notes") => {
                notes = Some(field.text().await.map_err(multipart_error)?);
            }
            _ => {}
        }
    }

    let job = state
        .ingestor
        .ingest(&owner.owner_id, upload, SubmitMetadata { scan_type, notes })
        .await?;

    let outcome = state.executor.submit(&job, false).await?;
    Ok(submission_response(outcome))
}

/// GET /api/v1/analyses/{job_id}: current status, result or failure.
pub async fn get_analysis(
    State(state): State<AppState>,
    owner: Owner,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<JobStatusResponse>> {
    // Other owners' jobs are indistinguishable from missing ones.
    let job = state
        .jobs
        .get_job(job_id)
        .await?
        .filter(|job| job.owner_id == owner.owner_id)
        .ok_or(crate::db::StoreError::NotFound(job_id))?;

    Ok(Json(JobStatusResponse::from(&job)))
}

/// POST /api/v1/analyses/{job_id}/retry: re-run a failed job.
pub async fn retry_analysis(
    State(state): State<AppState>,
    owner: Owner,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Response> {
    let outcome = state.executor.retry(job_id, &owner.owner_id).await?;
    Ok(submission_response(outcome))
}
