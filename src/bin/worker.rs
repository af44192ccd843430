use std::sync::Arc;

use medscan_analysis::{
    config::AppConfig,
    db::{self, JobStore, PgJobStore},
    init_tracing,
    services::{
        inference::InferenceClient,
        notify::{self, EventPublisher, Notifier},
        pipeline::AnalysisPipeline,
        queue::{JobQueue, RedisQueue},
        storage::ImageStore,
        worker::QueueWorker,
    },
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
    init_tracing();

    tracing::info!("Starting analysis worker");

    if let Err(e) = run().await {
        tracing::error!(error = %e, "Worker failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), BoxError> {
    let config = AppConfig::from_env()?;

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url).await?;
    let jobs: Arc<dyn JobStore> = Arc::new(PgJobStore::new(db_pool));

    tracing::info!("Connecting to Redis job queue");
    let redis_url = config
        .redis_url
        .as_deref()
        .ok_or("REDIS_URL is required to run the worker")?;
    let queue: Arc<dyn JobQueue> = Arc::new(RedisQueue::new(redis_url)?);
    queue.health_check().await?;

    tracing::info!("Initializing services");
    let storage = Arc::new(ImageStore::from_config(&config)?);
    let inference = Arc::new(InferenceClient::new(config.inference_settings(), storage)?);

    let (events, receiver) = EventPublisher::channel();
    let notifier =
        Notifier::new(notify::sink_from_config(config.notify_webhook_url.as_deref())?).spawn(receiver);

    let pipeline = Arc::new(AnalysisPipeline::new(jobs.clone(), inference, events));
    let worker = QueueWorker::new(queue, jobs, pipeline, config.queue_retry_policy())
        .with_concurrency(config.worker_concurrency)
        .with_visibility_timeout(config.queue_visibility_timeout());

    tracing::info!(
        concurrency = config.worker_concurrency,
        queue_max_attempts = config.queue_max_attempts,
        "Worker ready, starting job processing loop"
    );

    Arc::new(worker).run(shutdown_signal()).await;

    // Pipeline (and with it the publisher) is gone; let pending notifications drain.
    notifier.await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}
