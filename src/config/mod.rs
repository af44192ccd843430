use serde::Deserialize;
use std::time::Duration;

use crate::services::inference::InferenceSettings;
use crate::services::retry::RetryPolicy;

/// How accepted jobs are executed. Chosen once per deployment.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Inline,
    Queued,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Local,
    R2,
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Inline (request blocks on inference) or queued (worker process).
    #[serde(default)]
    pub execution_mode: ExecutionMode,

    /// Redis connection string for the job queue. Required for queued mode.
    pub redis_url: Option<String>,

    /// Base URL of the inference service
    pub inference_url: String,

    /// API key sent to the inference service
    pub inference_api_key: String,

    #[serde(default = "default_inference_timeout_secs")]
    pub inference_timeout_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub inference_max_attempts: u32,

    #[serde(default = "default_inference_base_delay_ms")]
    pub inference_base_delay_ms: u64,

    /// Job-level retry budget applied by the queue worker, on top of the
    /// inference client's own attempts.
    #[serde(default = "default_max_attempts")]
    pub queue_max_attempts: u32,

    #[serde(default = "default_queue_base_delay_ms")]
    pub queue_base_delay_ms: u64,

    /// In-flight queue entries older than this are handed back to the queue,
    /// covering workers that died mid-job. Must exceed the longest attempt.
    #[serde(default = "default_queue_visibility_timeout_secs")]
    pub queue_visibility_timeout_secs: u64,

    /// Max jobs a single worker process runs at once
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,

    #[serde(default)]
    pub storage_backend: StorageBackend,

    /// Root directory for local image storage
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,

    /// R2 bucket name
    pub r2_bucket: Option<String>,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: Option<String>,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: Option<String>,

    /// R2 endpoint URL
    pub r2_endpoint: Option<String>,

    /// AES-256-GCM encryption key (base64-encoded, 32 bytes). Images are
    /// stored in the clear when unset.
    pub encryption_key: Option<String>,

    /// HS256 secret for owner bearer tokens
    pub jwt_secret: String,

    /// Where "results are ready" summaries are POSTed. Log-only when unset.
    pub notify_webhook_url: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_inference_timeout_secs() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_inference_base_delay_ms() -> u64 {
    1000
}

fn default_queue_base_delay_ms() -> u64 {
    5000
}

fn default_queue_visibility_timeout_secs() -> u64 {
    900
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_upload_dir() -> String {
    "./uploads".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn inference_settings(&self) -> InferenceSettings {
        InferenceSettings {
            base_url: self.inference_url.clone(),
            api_key: self.inference_api_key.clone(),
            timeout: Duration::from_secs(self.inference_timeout_secs),
            retry: RetryPolicy::new(
                self.inference_max_attempts,
                Duration::from_millis(self.inference_base_delay_ms),
            ),
        }
    }

    pub fn queue_visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_visibility_timeout_secs)
    }

    pub fn queue_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.queue_max_attempts,
            Duration::from_millis(self.queue_base_delay_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> AppConfig {
        let vars = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()));
        envy::from_iter(vars).unwrap()
    }

    #[test]
    fn test_defaults_apply() {
        let config = from_pairs(&[
            ("DATABASE_URL", "postgres://localhost/medscan"),
            ("INFERENCE_URL", "http://localhost:8000"),
            ("INFERENCE_API_KEY", "key"),
            ("JWT_SECRET", "secret"),
        ]);

        assert_eq!(config.execution_mode, ExecutionMode::Inline);
        assert_eq!(config.storage_backend, StorageBackend::Local);
        assert_eq!(config.inference_max_attempts, 3);
        assert_eq!(config.queue_max_attempts, 3);
        assert_eq!(config.queue_visibility_timeout(), Duration::from_secs(900));
        assert_eq!(config.max_upload_bytes, 10 * 1024 * 1024);
        assert!(config.redis_url.is_none());

        let settings = config.inference_settings();
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.retry.delay_for(1), Duration::from_secs(1));
    }

    #[test]
    fn test_queued_mode_parses() {
        let config = from_pairs(&[
            ("DATABASE_URL", "postgres://localhost/medscan"),
            ("INFERENCE_URL", "http://localhost:8000"),
            ("INFERENCE_API_KEY", "key"),
            ("JWT_SECRET", "secret"),
            ("EXECUTION_MODE", "queued"),
            ("REDIS_URL", "redis://localhost:6379"),
            ("QUEUE_MAX_ATTEMPTS", "5"),
        ]);

        assert_eq!(config.execution_mode, ExecutionMode::Queued);
        assert_eq!(config.queue_retry_policy().max_attempts, 5);
    }
}
