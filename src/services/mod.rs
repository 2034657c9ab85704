pub mod analyst_service;
pub mod database_service;
pub mod embedding_service;
pub mod errors;
pub mod feature_flags;
pub mod llm;
pub mod metrics_service;
pub mod parser_dispatch;
pub mod pii_service;
pub mod pipeline;
pub mod privacy_service;
pub mod queue_service;
pub mod router_service;
pub mod storage_service;
pub mod validator_service;
pub mod webhook_service;
pub mod worker;

pub use analyst_service::{AnalysisResult, AnalystService};
pub use database_service::{CompensationLog, DatabaseService, DedupKeys, DuplicateMatchType};
pub use embedding_service::{Chunk, ChunkType, EmbeddingOutcome, EmbeddingService};
pub use errors::ErrorCode;
pub use feature_flags::{FeatureFlagStore, FeatureFlags};
pub use llm::{LlmClient, LlmProvider};
pub use metrics_service::MetricsService;
pub use parser_dispatch::{ParserDispatch, TextExtractor};
pub use pipeline::{OrchestratorOutcome, PipelineContext, PipelineOrchestrator, PipelineRequest};
pub use privacy_service::PrivacyService;
pub use queue_service::{JobType, PipelineJob, QueueService};
pub use router_service::{FileType, RouterResult, RouterService};
pub use storage_service::StorageService;
pub use validator_service::ValidatorService;
pub use webhook_service::{WebhookService, WebhookStatus};
pub use worker::WorkerPool;
