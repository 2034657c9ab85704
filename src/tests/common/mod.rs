// Common test utilities and helpers

use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ChunkingConfig, LlmConfig, WebhookConfig};
use crate::services::feature_flags::{FeatureFlagStore, FeatureFlags};
use crate::services::pipeline::PipelineOrchestrator;
use crate::services::{
    AnalystService, DatabaseService, EmbeddingService, LlmClient, MetricsService, PrivacyService,
    ValidatorService, WebhookService,
};

/// Create an in-memory SQLite database for testing
pub async fn create_test_db() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(3))
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create test database");

    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// Insert a user row with the given spare credits on the starter plan.
pub async fn seed_user(pool: &SqlitePool, user_id: &str, credits: i64) {
    sqlx::query("INSERT INTO users (id, plan, credits, credits_used_this_month) VALUES (?, 'starter', ?, 0)")
        .bind(user_id)
        .bind(credits)
        .execute(pool)
        .await
        .expect("Failed to seed user");
}

/// Insert a minimal latest candidate row for dedup tests.
pub async fn seed_candidate(
    pool: &SqlitePool,
    id: &str,
    user_id: &str,
    phone_hash: Option<&str>,
    email_hash: Option<&str>,
) {
    sqlx::query(
        r#"
        INSERT INTO candidates (id, user_id, name, phone_hash, email_hash, careers, status, is_latest)
        VALUES (?, ?, '기존후보', ?, ?, '[{"company":"Acme"}]', 'completed', 1)
        "#,
    )
    .bind(id)
    .bind(user_id)
    .bind(phone_hash)
    .bind(email_hash)
    .execute(pool)
    .await
    .expect("Failed to seed candidate");
}

/// Build a full orchestrator over the given pool with no LLM keys, no
/// webhook URL and no storage endpoint: everything external is inert, so
/// only pre-analysis paths run to completion.
pub fn build_orchestrator(pool: &SqlitePool) -> Arc<PipelineOrchestrator> {
    let http = reqwest::Client::new();
    let llm_config = LlmConfig::default();
    let llm = Arc::new(LlmClient::new(http.clone(), llm_config.clone()));

    Arc::new(PipelineOrchestrator::new(
        Arc::new(AnalystService::new(Arc::clone(&llm), 0.85, true, true)),
        Arc::new(ValidatorService::new(Arc::clone(&llm), false)),
        Arc::new(PrivacyService::new(&"ab".repeat(32)).expect("valid test key")),
        Arc::new(EmbeddingService::new(http.clone(), &llm_config, ChunkingConfig::default())),
        Arc::new(DatabaseService::new(pool.clone())),
        Arc::new(WebhookService::new(http.clone(), WebhookConfig::default())),
        Arc::new(MetricsService::new()),
        Arc::new(FeatureFlagStore::new(FeatureFlags::default())),
        100,
    ))
}

