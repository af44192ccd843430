use std::sync::Arc;

use crate::db::JobStore;
use crate::routes::auth::TokenVerifier;
use crate::services::{executor::Executor, ingest::Ingestor};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<dyn JobStore>,
    pub ingestor: Arc<Ingestor>,
    pub executor: Arc<Executor>,
    pub auth: Arc<TokenVerifier>,
}

impl AppState {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        ingestor: Ingestor,
        executor: Executor,
        auth: TokenVerifier,
    ) -> Self {
        Self {
            jobs,
            ingestor: Arc::new(ingestor),
            executor: Arc::new(executor),
            auth: Arc::new(auth),
        }
    }
}
