//! Test harness: in-memory store and queue, temp-dir image storage, and a
//! wiremock server standing in for the inference service.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use tempfile::TempDir;
use tokio::sync::mpsc;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use medscan_analysis::app_state::AppState;
use medscan_analysis::db::{JobStore, MemoryJobStore, StoreError};
use medscan_analysis::models::analysis::SubmitMetadata;
use medscan_analysis::models::inference::AnalysisResult;
use medscan_analysis::models::job::{AnalysisJob, NewAnalysisJob};
use medscan_analysis::routes::auth::TokenVerifier;
use medscan_analysis::services::executor::{ExecutionStrategy, Executor};
use medscan_analysis::services::inference::{InferenceClient, InferenceSettings};
use medscan_analysis::services::ingest::{Ingestor, Upload};
use medscan_analysis::services::notify::{AnalysisEvent, EventPublisher};
use medscan_analysis::services::pipeline::AnalysisPipeline;
use medscan_analysis::services::queue::{Delivery, JobQueue, MemoryQueue, QueueError, QueueMessage};
use medscan_analysis::services::retry::RetryPolicy;
use medscan_analysis::services::storage::ImageStore;
use medscan_analysis::services::worker::QueueWorker;

use crate::fixtures::PNG_SCAN;

pub const API_KEY: &str = "test-ml-key";
pub const JWT_SECRET: &str = "test-jwt-secret";
pub const MAX_UPLOAD_BYTES: usize = 64 * 1024;
pub const PREDICT_PATH: &str = "/api/v1/predict";

/// Fast inference retries so failure tests stay quick.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(10))
}

pub struct Harness {
    pub server: MockServer,
    pub jobs: Arc<MemoryJobStore>,
    pub storage: Arc<ImageStore>,
    pub queue: Arc<MemoryQueue>,
    pub pipeline: Arc<AnalysisPipeline>,
    pub events: mpsc::UnboundedReceiver<AnalysisEvent>,
    _dir: TempDir,
}

impl Harness {
    pub async fn start() -> Self {
        Self::with_inference(fast_retry(), Duration::from_secs(5)).await
    }

    pub async fn with_inference(retry: RetryPolicy, timeout: Duration) -> Self {
        let server = MockServer::start().await;
        let base_url = server.uri();
        Self::build(server, base_url, retry, timeout).await
    }

    /// Point the inference client at `base_url` instead of the mock server.
    pub async fn with_inference_url(base_url: &str, retry: RetryPolicy) -> Self {
        let server = MockServer::start().await;
        Self::build(server, base_url.to_string(), retry, Duration::from_secs(2)).await
    }

    async fn build(server: MockServer, base_url: String, retry: RetryPolicy, timeout: Duration) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let jobs = Arc::new(MemoryJobStore::new());
        let storage = Arc::new(ImageStore::local(dir.path()));
        let settings = InferenceSettings {
            base_url,
            api_key: API_KEY.to_string(),
            timeout,
            retry,
        };
        let inference = Arc::new(InferenceClient::new(settings, storage.clone()).unwrap());
        let (publisher, events) = EventPublisher::channel();
        let pipeline = Arc::new(AnalysisPipeline::new(jobs.clone(), inference, publisher));

        Self {
            server,
            jobs,
            storage,
            queue: Arc::new(MemoryQueue::new()),
            pipeline,
            events,
            _dir: dir,
        }
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        self.jobs.clone()
    }

    pub fn ingestor(&self) -> Ingestor {
        Ingestor::new(self.store(), self.storage.clone(), MAX_UPLOAD_BYTES)
    }

    pub fn inline_executor(&self) -> Executor {
        Executor::new(ExecutionStrategy::Inline, self.store(), self.pipeline.clone())
    }

    pub fn queued_executor(&self) -> Executor {
        Executor::new(
            ExecutionStrategy::Queued(self.queue.clone()),
            self.store(),
            self.pipeline.clone(),
        )
    }

    pub fn worker(&self, retry: RetryPolicy) -> QueueWorker {
        QueueWorker::new(self.queue.clone(), self.store(), self.pipeline.clone(), retry)
    }

    pub fn app_state(&self, strategy: ExecutionStrategy) -> AppState {
        AppState::new(
            self.store(),
            self.ingestor(),
            Executor::new(strategy, self.store(), self.pipeline.clone()),
            TokenVerifier::new(JWT_SECRET),
        )
    }

    /// Ingest a PNG scan for `owner_id`, leaving the job `uploaded`.
    pub async fn upload_scan(&self, owner_id: &str) -> AnalysisJob {
        self.ingestor()
            .ingest(
                owner_id,
                Some(Upload {
                    filename: Some("chest.png".to_string()),
                    content_type: Some("image/png".to_string()),
                    bytes: PNG_SCAN.to_vec(),
                }),
                SubmitMetadata {
                    scan_type: "chest_xray".to_string(),
                    notes: None,
                },
            )
            .await
            .unwrap()
    }

    pub async fn job(&self, job: &AnalysisJob) -> AnalysisJob {
        self.jobs.get_job(job.id).await.unwrap().unwrap()
    }

    /// Every event published so far.
    pub fn drain_events(&mut self) -> Vec<AnalysisEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Answer every predict call with `status` and `body`, expecting `calls` calls.
    pub async fn mock_predict(&self, status: u16, body: Value, calls: u64) {
        Mock::given(method("POST"))
            .and(path(PREDICT_PATH))
            .and(header("X-ML-API-Key", API_KEY))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .expect(calls)
            .mount(&self.server)
            .await;
    }

    /// Fail the first `failures` predict calls with `status`, then answer `body`.
    pub async fn mock_flaky_predict(&self, failures: u64, status: u16, body: Value) {
        Mock::given(method("POST"))
            .and(path(PREDICT_PATH))
            .respond_with(ResponseTemplate::new(status).set_body_string("upstream exploded"))
            .up_to_n_times(failures)
            .with_priority(1)
            .expect(failures)
            .mount(&self.server)
            .await;

        Mock::given(method("POST"))
            .and(path(PREDICT_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .with_priority(2)
            .expect(1)
            .mount(&self.server)
            .await;
    }

    pub fn token(&self, owner_id: &str) -> String {
        TokenVerifier::new(JWT_SECRET)
            .issue(owner_id, chrono::Duration::minutes(10))
            .unwrap()
    }
}

/// A queue whose backend is down.
pub struct UnreachableQueue;

fn unreachable() -> QueueError {
    QueueError::Redis(redis::RedisError::from((
        redis::ErrorKind::IoError,
        "connection refused",
    )))
}

#[async_trait]
impl JobQueue for UnreachableQueue {
    async fn enqueue(&self, _message: &QueueMessage) -> Result<(), QueueError> {
        Err(unreachable())
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        Err(unreachable())
    }

    async fn ack(&self, _delivery: &Delivery) -> Result<(), QueueError> {
        Err(unreachable())
    }

    async fn requeue_stale(&self, _visibility_timeout: Duration) -> Result<u64, QueueError> {
        Err(unreachable())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Err(unreachable())
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Err(unreachable())
    }
}

/// A store whose claims fail while the database is "down"; everything else
/// goes to the in-memory store.
pub struct FlakyClaims {
    inner: Arc<MemoryJobStore>,
    failures_left: AtomicU32,
}

impl FlakyClaims {
    pub fn new(inner: Arc<MemoryJobStore>, failures: u32) -> Self {
        Self {
            inner,
            failures_left: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl JobStore for FlakyClaims {
    async fn create_job(&self, new: NewAnalysisJob) -> Result<AnalysisJob, StoreError> {
        self.inner.create_job(new).await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<AnalysisJob>, StoreError> {
        self.inner.get_job(job_id).await
    }

    async fn begin_attempt(&self, job_id: Uuid) -> Result<AnalysisJob, StoreError> {
        self.inner.begin_attempt(job_id).await
    }

    async fn claim_attempt(
        &self,
        job_id: Uuid,
        retry_count: i32,
    ) -> Result<AnalysisJob, StoreError> {
        let down = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if down {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.claim_attempt(job_id, retry_count).await
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        result: &AnalysisResult,
    ) -> Result<AnalysisJob, StoreError> {
        self.inner.complete_job(job_id, result).await
    }

    async fn fail_job(&self, job_id: Uuid, message: &str) -> Result<AnalysisJob, StoreError> {
        self.inner.fail_job(job_id, message).await
    }

    async fn reset_for_retry(&self, job_id: Uuid) -> Result<AnalysisJob, StoreError> {
        self.inner.reset_for_retry(job_id).await
    }

    async fn record_upload(&self, owner_id: &str) -> Result<i64, StoreError> {
        self.inner.record_upload(owner_id).await
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.inner.health_check().await
    }
}

/// Hand-rolled multipart body: `(field name, filename, content type, bytes)`.
pub fn multipart_body(parts: &[(&str, Option<&str>, Option<&str>, &[u8])]) -> (String, Vec<u8>) {
    let boundary = "medscan-test-boundary";
    let mut body = Vec::new();
    for (name, filename, content_type, bytes) in parts {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        match filename {
            Some(filename) => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n")
                    .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{name}\"\r\n").as_bytes(),
            ),
        }
        if let Some(content_type) = content_type {
            body.extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
        }
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    (format!("multipart/form-data; boundary={boundary}"), body)
}
