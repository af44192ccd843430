//! Best-effort "results are ready" notifications.
//!
//! The pipeline publishes an [`AnalysisEvent`] once the completed state has
//! been committed; a separate [`Notifier`] task delivers it. Delivery
//! failures are logged and counted, never reported back to the job.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::models::inference::PrimaryFinding;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AnalysisEvent {
    Completed {
        job_id: Uuid,
        owner_id: String,
        scan_type: String,
        primary_prediction: Option<PrimaryFinding>,
        model_version: String,
    },
}

/// Publishing half. Cheap to clone; never blocks or fails the caller.
#[derive(Clone)]
pub struct EventPublisher {
    tx: Option<mpsc::UnboundedSender<AnalysisEvent>>,
}

impl EventPublisher {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AnalysisEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A publisher that drops every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn publish(&self, event: AnalysisEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                tracing::warn!("Notifier is not running, dropping analysis event");
            }
        }
    }
}

/// Transport for owner summaries.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send_summary(&self, event: &AnalysisEvent) -> Result<(), NotifyError>;
}

/// POSTs the event as JSON.
pub struct WebhookSink {
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: String) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn send_summary(&self, event: &AnalysisEvent) -> Result<(), NotifyError> {
        let response = self.client.post(&self.url).json(event).send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Used when no webhook is configured.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send_summary(&self, event: &AnalysisEvent) -> Result<(), NotifyError> {
        let AnalysisEvent::Completed { job_id, owner_id, .. } = event;
        tracing::info!(job_id = %job_id, owner_id = %owner_id, "Analysis results ready");
        Ok(())
    }
}

/// Webhook delivery when a URL is configured, log-only otherwise.
pub fn sink_from_config(
    webhook_url: Option<&str>,
) -> Result<Arc<dyn NotificationSink>, NotifyError> {
    match webhook_url {
        Some(url) => Ok(Arc::new(WebhookSink::new(url.to_string())?)),
        None => Ok(Arc::new(LogSink)),
    }
}

pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    /// Drain events until every publisher is dropped.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<AnalysisEvent>) {
        while let Some(event) = events.recv().await {
            self.deliver(&event).await;
        }
        tracing::debug!("Notifier stopped");
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn spawn(
        self,
        events: mpsc::UnboundedReceiver<AnalysisEvent>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(events))
    }

    pub async fn deliver(&self, event: &AnalysisEvent) {
        let AnalysisEvent::Completed { job_id, .. } = event;
        if let Err(e) = self.sink.send_summary(event).await {
            metrics::counter!("notifications_failed_total").increment(1);
            tracing::warn!(job_id = %job_id, error = %e, "Failed to send analysis notification");
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Notification endpoint returned status {0}")]
    Status(u16),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event() -> AnalysisEvent {
        AnalysisEvent::Completed {
            job_id: Uuid::new_v4(),
            owner_id: "owner-1".to_string(),
            scan_type: "chest_xray".to_string(),
            primary_prediction: None,
            model_version: "v1".to_string(),
        }
    }

    struct FailingSink(AtomicUsize);

    #[async_trait]
    impl NotificationSink for FailingSink {
        async fn send_summary(&self, _event: &AnalysisEvent) -> Result<(), NotifyError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(NotifyError::Status(503))
        }
    }

    #[tokio::test]
    async fn test_failures_are_swallowed() {
        let sink = Arc::new(FailingSink(AtomicUsize::new(0)));
        let (publisher, rx) = EventPublisher::channel();
        let handle = Notifier::new(sink.clone()).spawn(rx);

        publisher.publish(event());
        publisher.publish(event());
        drop(publisher);

        handle.await.unwrap();
        assert_eq!(sink.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_webhook_posts_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/notify"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sink = WebhookSink::new(format!("{}/notify", server.uri())).unwrap();
        sink.send_summary(&event()).await.unwrap();
    }

    #[tokio::test]
    async fn test_webhook_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let sink = WebhookSink::new(server.uri()).unwrap();
        assert!(matches!(
            sink.send_summary(&event()).await,
            Err(NotifyError::Status(500))
        ));
    }

    #[test]
    fn test_disabled_publisher_drops_silently() {
        EventPublisher::disabled().publish(event());
    }
}
