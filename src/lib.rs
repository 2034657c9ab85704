//! Resumind Library
//!
//! This library contains all the core modules for the Resumind application.

use sqlx::SqlitePool;
use std::sync::Arc;

pub mod config;
pub mod db;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use config::Config;
pub use services::pipeline::{PipelineContext, PipelineOrchestrator, PipelineRequest};
pub use services::{
    AnalystService, DatabaseService, EmbeddingService, ErrorCode, FeatureFlagStore, LlmClient,
    MetricsService, PrivacyService, QueueService, StorageService, ValidatorService,
    WebhookService, WorkerPool,
};

/// Application shared state
///
/// Design Philosophy: Keep it simple - Rust's type system IS our DI container.
/// All services are wrapped in Arc for cheap cloning and thread safety.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub config: Arc<Config>,

    pub llm: Arc<LlmClient>,
    pub router: Arc<services::RouterService>,
    pub parsers: Arc<services::ParserDispatch>,

    pub orchestrator: Arc<PipelineOrchestrator>,
    pub database_service: Arc<DatabaseService>,
    pub storage: Arc<StorageService>,
    pub queue: Arc<QueueService>,
    pub metrics: Arc<MetricsService>,
    pub flags: Arc<FeatureFlagStore>,
}
