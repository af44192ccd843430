use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use uuid::Uuid;

use crate::models::inference::AnalysisResult;

/// Lifecycle of an analysis job.
///
/// `uploaded → processing → completed | failed`, with `failed` re-entering
/// either `processing` (automatic retry) or `uploaded` (manual retry).
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Uploaded,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Uploaded,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    /// `processing → processing` covers queue redelivery of a job the
    /// submitting request already marked as processing.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Uploaded, Processing)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Failed, Processing)
                | (Failed, Uploaded)
        )
    }

    /// Every status from which `next` is reachable in one step.
    pub fn sources_of(next: JobStatus) -> Vec<JobStatus> {
        Self::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }

    pub fn as_str(self) -> &'static str {
        self.into()
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Everything needed to run inference without re-reading the job record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageInput {
    pub storage_key: String,
    pub original_filename: String,
    pub byte_size: i64,
    pub mime_type: String,
    pub scan_type: String,
}

/// Failure payload. Present only while the job is `failed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureInfo {
    pub message: String,
}

/// The persisted record for one uploaded image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub id: Uuid,
    pub owner_id: String,
    pub input: ImageInput,
    pub notes: Option<String>,
    pub status: JobStatus,
    pub result: Option<AnalysisResult>,
    pub error: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Insert payload for a freshly ingested image.
#[derive(Debug, Clone)]
pub struct NewAnalysisJob {
    pub owner_id: String,
    pub input: ImageInput,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Invalid job transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

impl AnalysisJob {
    pub fn new(new: NewAnalysisJob, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: new.owner_id,
            input: new.input,
            notes: new.notes,
            status: JobStatus::Uploaded,
            result: None,
            error: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            processed_at: None,
        }
    }

    fn guard(&self, to: JobStatus) -> Result<(), TransitionError> {
        if self.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(TransitionError {
                from: self.status,
                to,
            })
        }
    }

    /// Enter `processing`. Leaving `failed` counts as a retry and clears the
    /// prior failure.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.guard(JobStatus::Processing)?;
        if self.status == JobStatus::Failed {
            self.retry_count += 1;
            self.error = None;
        }
        self.status = JobStatus::Processing;
        self.updated_at = now;
        Ok(())
    }

    /// Replace any prior payload with `result`.
    pub fn complete(
        &mut self,
        result: AnalysisResult,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.guard(JobStatus::Completed)?;
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.updated_at = now;
        self.processed_at = Some(now);
        Ok(())
    }

    pub fn fail(&mut self, message: &str, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.guard(JobStatus::Failed)?;
        self.status = JobStatus::Failed;
        self.result = None;
        self.error = Some(message.to_string());
        self.updated_at = now;
        self.processed_at = Some(now);
        Ok(())
    }

    /// Manual retry: `failed → uploaded`.
    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.guard(JobStatus::Uploaded)?;
        self.status = JobStatus::Uploaded;
        self.retry_count += 1;
        self.error = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn failure(&self) -> Option<FailureInfo> {
        match (self.status, &self.error) {
            (JobStatus::Failed, Some(message)) => Some(FailureInfo {
                message: message.clone(),
            }),
            _ => None,
        }
    }
}
