use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;

use medscan_analysis::{
    app_state::AppState,
    config::AppConfig,
    db::{self, JobStore, PgJobStore},
    init_tracing, routes,
    routes::auth::TokenVerifier,
    services::{
        executor::{ExecutionStrategy, Executor, QueueState},
        inference::InferenceClient,
        ingest::Ingestor,
        notify::{self, EventPublisher, Notifier},
        pipeline::AnalysisPipeline,
        queue::{JobQueue, RedisQueue},
        storage::ImageStore,
    },
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
    init_tracing();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "Server failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), BoxError> {
    let config = AppConfig::from_env()?;

    tracing::info!("Initializing medscan-analysis server");

    let prometheus_handle = Arc::new(PrometheusBuilder::new().install_recorder()?);
    routes::metrics::describe();

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url).await?;

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool).await?;
    let jobs: Arc<dyn JobStore> = Arc::new(PgJobStore::new(db_pool));

    tracing::info!(backend = ?config.storage_backend, encrypted = config.encryption_key.is_some(), "Initializing image storage");
    let storage = Arc::new(ImageStore::from_config(&config)?);

    let inference = Arc::new(InferenceClient::new(
        config.inference_settings(),
        storage.clone(),
    )?);

    let (events, receiver) = EventPublisher::channel();
    Notifier::new(notify::sink_from_config(config.notify_webhook_url.as_deref())?).spawn(receiver);

    let pipeline = Arc::new(AnalysisPipeline::new(jobs.clone(), inference, events));

    let queue = match &config.redis_url {
        Some(url) => match RedisQueue::new(url) {
            Ok(queue) => Some(Arc::new(queue) as Arc<dyn JobQueue>),
            Err(e) => {
                tracing::warn!(error = %e, "Invalid Redis configuration");
                None
            }
        },
        None => None,
    };
    let strategy = ExecutionStrategy::select(config.execution_mode, QueueState::probe(queue).await);
    tracing::info!(strategy = strategy.name(), "Execution strategy selected");

    let executor = Executor::new(strategy, jobs.clone(), pipeline);
    let ingestor = Ingestor::new(jobs.clone(), storage, config.max_upload_bytes);
    let state = AppState::new(jobs, ingestor, executor, TokenVerifier::new(&config.jwt_secret));

    let app = routes::router(state, Some(prometheus_handle));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}
