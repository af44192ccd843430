use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

use crate::models::inference::InferenceOutput;
use crate::models::job::ImageInput;
use crate::services::retry::RetryPolicy;
use crate::services::storage::{ImageStore, StorageError};

const PREDICT_PATH: &str = "/api/v1/predict";
const API_KEY_HEADER: &str = "X-ML-API-Key";

#[derive(Debug, Clone)]
pub struct InferenceSettings {
    pub base_url: String,
    pub api_key: String,
    /// Per-attempt timeout, covering connect, upload and response body.
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

/// A validated inference response plus client-side timing.
#[derive(Debug, Clone)]
pub struct InferenceReport {
    pub output: InferenceOutput,
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Client for the external inference service.
///
/// Owns the fine-grained retry tier: transient failures are retried with
/// exponential backoff, permanent ones are surfaced on the first attempt.
pub struct InferenceClient {
    http: Client,
    settings: InferenceSettings,
    storage: Arc<ImageStore>,
}

impl InferenceClient {
    pub fn new(settings: InferenceSettings, storage: Arc<ImageStore>) -> Result<Self, InferenceError> {
        let http = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| InferenceError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            settings,
            storage,
        })
    }

    /// Run inference for one stored image.
    ///
    /// A missing or empty image fails before the service is contacted.
    pub async fn analyze(&self, input: &ImageInput) -> Result<InferenceReport, InferenceError> {
        let image = match self.storage.get(&input.storage_key).await {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound(key)) => return Err(InferenceError::MissingInput(key)),
            Err(e) => return Err(InferenceError::Storage(e)),
        };
        if image.is_empty() {
            return Err(InferenceError::EmptyInput(input.storage_key.clone()));
        }

        let policy = self.settings.retry;
        let started = Instant::now();
        let mut attempt = 1;

        loop {
            metrics::counter!("inference_attempts_total").increment(1);

            match self.call_once(input, &image).await {
                Ok(output) => {
                    let elapsed = started.elapsed();
                    metrics::histogram!("inference_duration_seconds").record(elapsed.as_secs_f64());
                    tracing::debug!(
                        storage_key = %input.storage_key,
                        attempt,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Inference call succeeded"
                    );
                    return Ok(InferenceReport {
                        output,
                        attempts: attempt,
                        elapsed,
                    });
                }
                Err(e) if e.is_transient() && policy.allows_another(attempt) => {
                    let delay = policy.delay_for(attempt);
                    tracing::warn!(
                        storage_key = %input.storage_key,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Inference attempt failed, backing off"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        storage_key = %input.storage_key,
                        attempt,
                        transient = e.is_transient(),
                        error = %e,
                        "Inference failed"
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn call_once(&self, input: &ImageInput, image: &[u8]) -> Result<InferenceOutput, InferenceError> {
        let url = format!(
            "{}{}",
            self.settings.base_url.trim_end_matches('/'),
            PREDICT_PATH
        );

        let part = Part::bytes(image.to_vec())
            .file_name(input.original_filename.clone())
            .mime_str(&input.mime_type)
            .map_err(|e| InferenceError::Transport(e.to_string()))?;
        let form = Form::new()
            .part("file", part)
            .text("scan_type", input.scan_type.clone());

        let response = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, &self.settings.api_key)
            .query(&[("scan_type", input.scan_type.as_str())])
            .multipart(form)
            .send()
            .await
            .map_err(InferenceError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::from_status(status, body));
        }

        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(InferenceError::from_transport)?;

        InferenceOutput::from_raw(raw).map_err(InferenceError::InvalidResponse)
    }
}

/// Classified inference failure.
///
/// `Display` keeps the underlying cause for logs; [`user_message`] is what
/// gets persisted and shown.
///
/// [`user_message`]: InferenceError::user_message
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Input image not found: {0}")]
    MissingInput(String),

    #[error("Input image is empty: {0}")]
    EmptyInput(String),

    #[error("Could not read input image: {0}")]
    Storage(StorageError),

    #[error("Inference service rejected credentials ({status}): {body}")]
    Unauthorized { status: u16, body: String },

    #[error("Inference service rejected payload as too large: {0}")]
    PayloadTooLarge(String),

    #[error("Inference service rejected media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Inference service rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Inference service error ({status}): {body}")]
    Server { status: u16, body: String },

    #[error("Inference service unreachable: {0}")]
    ConnectionRefused(String),

    #[error("Inference service timed out: {0}")]
    Timeout(String),

    #[error("Inference transport error: {0}")]
    Transport(String),

    #[error("Inference service returned an invalid response: {0}")]
    InvalidResponse(String),
}

impl InferenceError {
    fn from_transport(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            InferenceError::Timeout(e.to_string())
        } else if e.is_connect() {
            InferenceError::ConnectionRefused(e.to_string())
        } else {
            InferenceError::Transport(e.to_string())
        }
    }

    fn from_status(status: StatusCode, body: String) -> Self {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => InferenceError::Unauthorized {
                status: status.as_u16(),
                body,
            },
            StatusCode::PAYLOAD_TOO_LARGE => InferenceError::PayloadTooLarge(body),
            StatusCode::UNSUPPORTED_MEDIA_TYPE => InferenceError::UnsupportedMediaType(body),
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                InferenceError::Timeout(format!("status {}", status.as_u16()))
            }
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                InferenceError::Server {
                    status: s.as_u16(),
                    body,
                }
            }
            s => InferenceError::Rejected {
                status: s.as_u16(),
                body,
            },
        }
    }

    /// Worth another attempt: network, timeout and 5xx failures, plus
    /// storage backends that failed to answer.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            InferenceError::Server { .. }
                | InferenceError::ConnectionRefused(_)
                | InferenceError::Timeout(_)
                | InferenceError::Transport(_)
                | InferenceError::Storage(StorageError::S3(_) | StorageError::Io(_))
        )
    }

    pub fn user_message(&self) -> String {
        match self {
            InferenceError::MissingInput(_) => {
                "The uploaded image could not be found. Please upload it again.".to_string()
            }
            InferenceError::EmptyInput(_) => {
                "The uploaded image is empty. Please upload a valid scan.".to_string()
            }
            InferenceError::Storage(_) => {
                "The uploaded image could not be read from storage.".to_string()
            }
            InferenceError::Unauthorized { .. } => {
                "Authentication with the analysis service failed. Please contact an administrator."
                    .to_string()
            }
            InferenceError::PayloadTooLarge(_) => {
                "The image is too large for the analysis service. Please upload a smaller file."
                    .to_string()
            }
            InferenceError::UnsupportedMediaType(_) => {
                "The analysis service does not support this image format.".to_string()
            }
            InferenceError::Rejected { status, .. } => {
                format!("The analysis service rejected the image (status {status}).")
            }
            InferenceError::Server { .. } => {
                "The analysis service encountered an internal error. Please try again later."
                    .to_string()
            }
            InferenceError::ConnectionRefused(_) => {
                "The analysis service is unavailable. Please try again later.".to_string()
            }
            InferenceError::Timeout(_) => {
                "The analysis service timed out. Please try again later.".to_string()
            }
            InferenceError::Transport(_) => {
                "Could not communicate with the analysis service. Please try again later."
                    .to_string()
            }
            InferenceError::InvalidResponse(_) => {
                "The analysis service returned an unreadable result.".to_string()
            }
        }
    }
}
