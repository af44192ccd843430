//! Medical-image analysis job pipeline
//!
//! Accepts scan uploads, runs them through an external inference service
//! either inline or via a Redis-backed worker queue, and tracks each upload
//! as a job with a guarded `uploaded → processing → completed | failed`
//! lifecycle in PostgreSQL.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;

use tracing_subscriber::EnvFilter;

/// Structured JSON logging, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();
}
