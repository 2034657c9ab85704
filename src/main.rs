use axum::Router;
use axum::http::{HeaderValue, Method};
use axum::middleware as axum_middleware;
use axum::routing::{delete, get, post};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use resumind::config::Config;
use resumind::services::{
    AnalystService, DatabaseService, EmbeddingService, FeatureFlagStore, LlmClient,
    MetricsService, ParserDispatch, PrivacyService, QueueService, RouterService, StorageService,
    ValidatorService, WebhookService, WorkerPool,
    feature_flags::FeatureFlags,
    pipeline::PipelineOrchestrator,
};
use resumind::{AppState, db, handlers, middleware};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let config = Config::load()?;

    let log_filter = tracing_subscriber::EnvFilter::new(&config.logging.level);
    let registry = tracing_subscriber::registry().with(log_filter);

    if let Some(log_file) = &config.logging.file {
        let log_path = std::path::Path::new(log_file);
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let log_dir = log_path.parent().and_then(|p| p.to_str()).unwrap_or("logs");
        let file_name = log_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("resumind.log");
        let file_prefix = file_name.strip_suffix(".log").unwrap_or(file_name);

        let file_appender = tracing_appender::rolling::daily(log_dir, file_prefix);
        let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
    tracing::info!("Resumind starting up");

    let pool = db::create_pool(&config.database.url).await?;
    tracing::info!("Database pool created and migrations applied");

    // One process-wide HTTP pool shared by LLM, embedding, webhook and
    // storage traffic
    let http_client = reqwest::Client::builder()
        .pool_max_idle_per_host(5)
        .connect_timeout(std::time::Duration::from_secs(config.llm.connect_timeout_secs))
        .build()?;

    let llm = Arc::new(LlmClient::new(http_client.clone(), config.llm.clone()));
    let analyst = Arc::new(AnalystService::new(
        Arc::clone(&llm),
        config.llm.confidence_threshold,
        config.llm.use_parallel_llm,
        config.llm.use_conditional_llm,
    ));
    let validator =
        Arc::new(ValidatorService::new(Arc::clone(&llm), config.llm.use_llm_validation));
    let privacy = Arc::new(PrivacyService::new(&config.privacy.encryption_key)?);
    let embedder = Arc::new(EmbeddingService::new(
        http_client.clone(),
        &config.llm,
        config.chunking.clone(),
    ));
    let database_service = Arc::new(DatabaseService::new(pool.clone()));
    let storage = Arc::new(StorageService::new(http_client.clone(), config.storage.clone()));
    let webhooks = Arc::new(WebhookService::new(http_client.clone(), config.webhook.clone()));
    let metrics = Arc::new(MetricsService::new());
    let flags = Arc::new(FeatureFlagStore::new(FeatureFlags::from_env()));
    let queue = Arc::new(QueueService::connect(&config.redis.url).await);

    let orchestrator = Arc::new(PipelineOrchestrator::new(
        Arc::clone(&analyst),
        Arc::clone(&validator),
        Arc::clone(&privacy),
        Arc::clone(&embedder),
        Arc::clone(&database_service),
        Arc::clone(&webhooks),
        Arc::clone(&metrics),
        Arc::clone(&flags),
        config.analysis.min_text_length,
    ));
    tracing::info!("Pipeline orchestrator initialized");

    // Worker pools: separately sized so HWP conversion load cannot starve
    // the fast path
    if queue.is_available() {
        let workers = Arc::new(WorkerPool::new(
            Arc::clone(&queue),
            Arc::clone(&storage),
            Arc::clone(&orchestrator),
        ));
        workers.spawn(4, 2);
    } else {
        tracing::warn!("Queue disabled - running API-only mode");
    }

    // Daily maintenance: purge aged soft-deleted rows, prune metrics
    {
        let database_service = Arc::clone(&database_service);
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(24 * 60 * 60));
            loop {
                ticker.tick().await;
                match database_service.purge_soft_deleted(7).await {
                    Ok(purged) if purged > 0 => {
                        tracing::info!("Purged {} soft-deleted candidates", purged)
                    },
                    Ok(_) => {},
                    Err(e) => tracing::error!("Soft-delete purge failed: {}", e),
                }
                metrics.prune(24 * 60);
            }
        });
    }

    let app_state = Arc::new(AppState {
        db: pool.clone(),
        config: Arc::new(config.clone()),
        llm: Arc::clone(&llm),
        router: Arc::new(RouterService::new()),
        parsers: Arc::new(ParserDispatch::new()),
        orchestrator: Arc::clone(&orchestrator),
        database_service: Arc::clone(&database_service),
        storage: Arc::clone(&storage),
        queue: Arc::clone(&queue),
        metrics: Arc::clone(&metrics),
        flags: Arc::clone(&flags),
    });

    let auth_state = middleware::AuthState {
        api_key: config.auth.api_key.clone(),
        webhook_secret: config.webhook.secret.clone(),
    };

    let protected_routes = Router::new()
        .route("/parse", post(handlers::parse::parse_file))
        .route("/analyze", post(handlers::analyze::analyze))
        .route("/process", post(handlers::analyze::process))
        .route("/pipeline", post(handlers::pipeline::run_pipeline))
        .route("/queue/enqueue", post(handlers::queue::enqueue))
        .route("/queue/status", get(handlers::queue::status))
        .route("/dlq/stats", get(handlers::queue::dlq_stats))
        .route("/dlq/entries", get(handlers::queue::dlq_entries))
        .route(
            "/dlq/entry/:id",
            get(handlers::queue::dlq_entry).delete(handlers::queue::dlq_delete),
        )
        .route("/dlq/retry/:id", post(handlers::queue::dlq_retry))
        .route("/dlq/clear", delete(handlers::queue::dlq_clear))
        .route("/metrics", get(handlers::metrics::summary))
        .route("/metrics/health", get(handlers::metrics::health))
        .route("/metrics/recent", get(handlers::metrics::recent))
        .route("/metrics/llm-cost", get(handlers::metrics::llm_cost))
        .route("/feature-flags", get(handlers::system::feature_flags))
        .route("/feature-flags/check", get(handlers::system::feature_flags_check))
        .route("/feature-flags/reload", post(handlers::system::feature_flags_reload))
        .route("/debug", get(handlers::system::debug))
        .with_state(Arc::clone(&app_state))
        .layer(axum_middleware::from_fn_with_state(auth_state, middleware::auth_middleware));

    let public_routes = Router::new()
        .route("/health", get(handlers::system::health))
        .with_state(Arc::clone(&app_state));

    let cors = build_cors_layer(&config.server.allowed_origins);

    let app = Router::new()
        .merge(protected_routes)
        .merge(public_routes)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(cors);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on http://{}", addr);
    tracing::info!("Resumind is ready to serve requests");

    axum::serve(listener, app).await?;

    Ok(())
}

fn build_cors_layer(allowed_origins: &str) -> CorsLayer {
    let methods = [Method::GET, Method::POST, Method::PUT, Method::DELETE];
    if allowed_origins.trim() == "*" {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .filter_map(|o| o.parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(methods)
        .allow_headers(tower_http::cors::Any)
}
