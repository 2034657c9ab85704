use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub llm: LlmConfig,
    pub analysis: AnalysisConfig,
    pub chunking: ChunkingConfig,
    pub privacy: PrivacyConfig,
    pub webhook: WebhookConfig,
    pub queue: QueueConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Comma separated list of allowed CORS origins ("*" for any)
    pub allowed_origins: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Empty string disables the queue subsystem
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Object storage endpoint (résumé files are downloaded from here)
    pub base_url: String,
    pub service_key: String,
    pub bucket: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared secret accepted via X-API-Key
    pub api_key: String,
}

/// Analysis mode: phase_1 is the 2-way cross-check, phase_2 adds a third
/// provider for deep verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum AnalysisMode {
    #[serde(rename = "phase_1")]
    Phase1,
    #[serde(rename = "phase_2")]
    Phase2,
}

impl AnalysisMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Phase1 => "phase_1",
            Self::Phase2 => "phase_2",
        }
    }

    pub fn parse_mode(s: &str) -> Self {
        match s {
            "phase_2" => Self::Phase2,
            _ => Self::Phase1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub openai_api_key: String,
    pub gemini_api_key: String,
    pub anthropic_api_key: String,

    pub openai_model: String,
    pub gemini_model: String,
    pub anthropic_model: String,
    pub embedding_model: String,

    pub openai_base_url: String,
    pub gemini_base_url: String,
    pub anthropic_base_url: String,

    /// Total per-request deadline
    pub timeout_secs: u64,
    /// TCP connect deadline
    pub connect_timeout_secs: u64,
    pub max_retries: u32,
    pub base_delay_secs: f64,
    pub max_delay_secs: f64,

    /// Progressive strategy accepts a single-provider answer at or above this
    pub confidence_threshold: f64,
    pub analysis_mode: AnalysisMode,
    pub use_conditional_llm: bool,
    pub use_parallel_llm: bool,
    pub use_llm_validation: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Parsed text shorter than this is rejected as TEXT_TOO_SHORT
    pub min_text_length: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub raw_section_chunk_size: usize,
    pub raw_section_overlap: usize,
    pub korean_chunk_size: usize,
    pub korean_overlap: usize,
    /// Hangul share of non-whitespace chars that triggers the wide window
    pub korean_threshold: f64,
    pub max_raw_full_chars: usize,
    pub max_structured_chunk_chars: usize,
    pub raw_text_min_length: usize,
    pub raw_section_min_length: usize,
    pub max_embedding_retries: u32,
    pub retry_base_wait_secs: f64,
    pub retry_max_wait_secs: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    /// AES-256-GCM master key: 64 hex chars or a 32 byte string. Empty
    /// disables field encryption.
    pub encryption_key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub url: String,
    pub secret: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_secs: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub use_split_queues: bool,
    /// slow-queue depth above which admission control rejects HWP uploads
    pub backpressure_threshold: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

/// Command line arguments for configuration overrides
#[derive(Parser, Debug, Clone)]
#[command(name = "resumind")]
#[command(version, about = "Resumind - Resume Processing Pipeline")]
pub struct CommandLineArgs {
    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Server host (overrides config file)
    #[arg(long, value_name = "HOST")]
    pub server_host: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Database URL (overrides config file)
    #[arg(long, value_name = "URL")]
    pub database_url: Option<String>,

    /// Redis URL (overrides config file)
    #[arg(long, value_name = "URL")]
    pub redis_url: Option<String>,

    /// Logging level (overrides config file, e.g., "info,resumind=debug")
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Analysis mode: phase_1 or phase_2 (overrides config file)
    #[arg(long, value_name = "MODE")]
    pub analysis_mode: Option<String>,
}

impl Config {
    /// Load configuration with command line, environment variable, and file support
    ///
    /// Loading order (priority from highest to lowest):
    /// 1. Command line arguments
    /// 2. Environment variables
    /// 3. Configuration file (config.toml)
    /// 4. Default values
    pub fn load() -> Result<Self, anyhow::Error> {
        let cli_args = CommandLineArgs::parse();
        Self::load_with_args(&cli_args)
    }

    pub fn load_with_args(cli_args: &CommandLineArgs) -> Result<Self, anyhow::Error> {
        // 1. Load from config file (use CLI --config if provided, otherwise find default)
        let config_path = cli_args.config.clone().or_else(Self::find_config_file);
        let mut config = if let Some(config_path) = config_path {
            Self::from_toml(&config_path)?
        } else {
            tracing::warn!("Configuration file not found, using defaults");
            Config::default()
        };

        // 2. Override with environment variables
        config.apply_env_overrides();

        // 3. Override with command line arguments (highest priority)
        config.apply_cli_overrides(cli_args);

        // 4. Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - DATABASE_URL: sqlx database URL
    /// - SUPABASE_URL / SUPABASE_SERVICE_ROLE_KEY: object storage endpoint
    /// - REDIS_URL: queue backend
    /// - OPENAI_API_KEY / GEMINI_API_KEY / ANTHROPIC_API_KEY
    /// - WEBHOOK_URL / WEBHOOK_SECRET
    /// - ALLOWED_ORIGINS: CSV of CORS origins
    /// - API_KEY: inbound shared secret
    /// - ANALYSIS_MODE: phase_1 | phase_2
    /// - MIN_TEXT_LENGTH
    /// - LLM_CONFIDENCE_THRESHOLD
    /// - USE_CONDITIONAL_LLM / USE_PARALLEL_LLM / USE_LLM_VALIDATION / USE_SPLIT_QUEUES
    /// - LOG_LEVEL
    /// - ENCRYPTION_KEY: 64 hex chars or 32 byte string
    /// - LLM_TIMEOUT_SECONDS / LLM_CONNECT_TIMEOUT / LLM_MAX_RETRIES
    /// - STORAGE_MAX_RETRIES / WEBHOOK_MAX_RETRIES
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database.url = url;
            tracing::info!("Override database.url from env");
        }

        if let Ok(url) = std::env::var("SUPABASE_URL") {
            self.storage.base_url = url;
            tracing::info!("Override storage.base_url from env");
        }

        if let Ok(key) = std::env::var("SUPABASE_SERVICE_ROLE_KEY") {
            self.storage.service_key = key;
            tracing::info!("Override storage.service_key from env");
        }

        if let Ok(url) = std::env::var("REDIS_URL") {
            self.redis.url = url;
            tracing::info!("Override redis.url from env");
        }

        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            self.llm.openai_api_key = key;
        }
        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            self.llm.gemini_api_key = key;
        }
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            self.llm.anthropic_api_key = key;
        }

        if let Ok(url) = std::env::var("WEBHOOK_URL") {
            self.webhook.url = url;
            tracing::info!("Override webhook.url from env");
        }
        if let Ok(secret) = std::env::var("WEBHOOK_SECRET") {
            self.webhook.secret = secret;
            tracing::info!("Override webhook.secret from env");
        }

        if let Ok(origins) = std::env::var("ALLOWED_ORIGINS") {
            self.server.allowed_origins = origins;
            tracing::info!(
                "Override server.allowed_origins from env: {}",
                self.server.allowed_origins
            );
        }

        if let Ok(key) = std::env::var("API_KEY") {
            self.auth.api_key = key;
            tracing::info!("Override auth.api_key from env");
        }

        if let Ok(mode) = std::env::var("ANALYSIS_MODE") {
            self.llm.analysis_mode = AnalysisMode::parse_mode(&mode);
            tracing::info!(
                "Override llm.analysis_mode from env: {}",
                self.llm.analysis_mode.as_str()
            );
        }

        if let Ok(len) = std::env::var("MIN_TEXT_LENGTH") {
            match len.parse() {
                Ok(val) => {
                    self.analysis.min_text_length = val;
                    tracing::info!("Override analysis.min_text_length from env: {}", val);
                },
                Err(e) => tracing::warn!(
                    "Invalid MIN_TEXT_LENGTH '{}': {} (keep {})",
                    len,
                    e,
                    self.analysis.min_text_length
                ),
            }
        }

        if let Ok(threshold) = std::env::var("LLM_CONFIDENCE_THRESHOLD") {
            match threshold.parse() {
                Ok(val) => {
                    self.llm.confidence_threshold = val;
                    tracing::info!("Override llm.confidence_threshold from env: {}", val);
                },
                Err(e) => tracing::warn!(
                    "Invalid LLM_CONFIDENCE_THRESHOLD '{}': {} (keep {})",
                    threshold,
                    e,
                    self.llm.confidence_threshold
                ),
            }
        }

        if let Ok(v) = std::env::var("USE_CONDITIONAL_LLM") {
            self.llm.use_conditional_llm = parse_bool(&v, self.llm.use_conditional_llm);
        }
        if let Ok(v) = std::env::var("USE_PARALLEL_LLM") {
            self.llm.use_parallel_llm = parse_bool(&v, self.llm.use_parallel_llm);
        }
        if let Ok(v) = std::env::var("USE_LLM_VALIDATION") {
            self.llm.use_llm_validation = parse_bool(&v, self.llm.use_llm_validation);
        }
        if let Ok(v) = std::env::var("USE_SPLIT_QUEUES") {
            self.queue.use_split_queues = parse_bool(&v, self.queue.use_split_queues);
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.logging.level = level;
            tracing::info!("Override logging.level from env: {}", self.logging.level);
        }

        if let Ok(key) = std::env::var("ENCRYPTION_KEY") {
            self.privacy.encryption_key = key;
            tracing::info!("Override privacy.encryption_key from env");
        }

        if let Ok(secs) = std::env::var("LLM_TIMEOUT_SECONDS") {
            match parse_duration_to_secs(&secs) {
                Ok(val) => self.llm.timeout_secs = val,
                Err(e) => tracing::warn!("Invalid LLM_TIMEOUT_SECONDS '{}': {}", secs, e),
            }
        }
        if let Ok(secs) = std::env::var("LLM_CONNECT_TIMEOUT") {
            match parse_duration_to_secs(&secs) {
                Ok(val) => self.llm.connect_timeout_secs = val,
                Err(e) => tracing::warn!("Invalid LLM_CONNECT_TIMEOUT '{}': {}", secs, e),
            }
        }
        if let Ok(n) = std::env::var("LLM_MAX_RETRIES") {
            match n.parse() {
                Ok(val) => self.llm.max_retries = val,
                Err(e) => tracing::warn!("Invalid LLM_MAX_RETRIES '{}': {}", n, e),
            }
        }
        if let Ok(n) = std::env::var("STORAGE_MAX_RETRIES") {
            match n.parse() {
                Ok(val) => self.storage.max_retries = val,
                Err(e) => tracing::warn!("Invalid STORAGE_MAX_RETRIES '{}': {}", n, e),
            }
        }
        if let Ok(n) = std::env::var("WEBHOOK_MAX_RETRIES") {
            match n.parse() {
                Ok(val) => self.webhook.max_retries = val,
                Err(e) => tracing::warn!("Invalid WEBHOOK_MAX_RETRIES '{}': {}", n, e),
            }
        }
    }

    /// Apply command line argument overrides (highest priority)
    fn apply_cli_overrides(&mut self, args: &CommandLineArgs) {
        if let Some(host) = &args.server_host {
            self.server.host = host.clone();
            tracing::info!("Override server.host from CLI: {}", self.server.host);
        }

        if let Some(port) = args.server_port {
            self.server.port = port;
            tracing::info!("Override server.port from CLI: {}", self.server.port);
        }

        if let Some(db_url) = &args.database_url {
            self.database.url = db_url.clone();
            tracing::info!("Override database.url from CLI");
        }

        if let Some(redis_url) = &args.redis_url {
            self.redis.url = redis_url.clone();
            tracing::info!("Override redis.url from CLI");
        }

        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
            tracing::info!("Override logging.level from CLI: {}", self.logging.level);
        }

        if let Some(mode) = &args.analysis_mode {
            self.llm.analysis_mode = AnalysisMode::parse_mode(mode);
            tracing::info!(
                "Override llm.analysis_mode from CLI: {}",
                self.llm.analysis_mode.as_str()
            );
        }
    }

    /// Validate configuration
    fn validate(&self) -> Result<(), anyhow::Error> {
        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be 0");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.llm.max_retries > 10 {
            anyhow::bail!("llm.max_retries must be <= 10");
        }

        if !(0.0..=1.0).contains(&self.llm.confidence_threshold) {
            anyhow::bail!("llm.confidence_threshold must be within [0, 1]");
        }

        if self.chunking.raw_section_overlap >= self.chunking.raw_section_chunk_size {
            anyhow::bail!("chunking.raw_section_overlap must be smaller than the chunk size");
        }
        if self.chunking.korean_overlap >= self.chunking.korean_chunk_size {
            anyhow::bail!("chunking.korean_overlap must be smaller than the chunk size");
        }

        // Key format is checked at startup so a bad deployment fails here,
        // not on the first encrypt call
        let key = &self.privacy.encryption_key;
        if !key.is_empty() && key.len() != 32 && !(key.len() == 64 && hex::decode(key).is_ok()) {
            anyhow::bail!("privacy.encryption_key must be 64 hex chars or 32 bytes");
        }

        if self.auth.api_key.is_empty() && self.webhook.secret.is_empty() {
            tracing::warn!("No auth.api_key or webhook.secret configured - API is unauthenticated");
        }

        Ok(())
    }

    fn find_config_file() -> Option<String> {
        let possible_paths =
            ["conf/config.toml", "config.toml", "./conf/config.toml", "./config.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                return Some(path.to_string());
            }
        }
        None
    }

    fn from_toml(path: &str) -> Result<Self, anyhow::Error> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8080, allowed_origins: "*".to_string() }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: "sqlite://data/resumind.db".to_string() }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self { url: String::new() }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            service_key: String::new(),
            bucket: "resumes".to_string(),
            timeout_secs: 30,
            max_retries: 3,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { api_key: String::new() }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            openai_api_key: String::new(),
            gemini_api_key: String::new(),
            anthropic_api_key: String::new(),
            openai_model: "gpt-4o".to_string(),
            gemini_model: "gemini-2.0-flash".to_string(),
            anthropic_model: "claude-sonnet-4-20250514".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            gemini_base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            anthropic_base_url: "https://api.anthropic.com/v1".to_string(),
            timeout_secs: 120,
            connect_timeout_secs: 10,
            max_retries: 3,
            base_delay_secs: 1.0,
            max_delay_secs: 8.0,
            confidence_threshold: 0.85,
            analysis_mode: AnalysisMode::Phase1,
            use_conditional_llm: true,
            use_parallel_llm: true,
            use_llm_validation: false,
        }
    }
}

impl Default for AnalysisMode {
    fn default() -> Self {
        Self::Phase1
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self { min_text_length: 100 }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            raw_section_chunk_size: 1500,
            raw_section_overlap: 300,
            korean_chunk_size: 2000,
            korean_overlap: 500,
            korean_threshold: 0.5,
            max_raw_full_chars: 8000,
            max_structured_chunk_chars: 2000,
            raw_text_min_length: 50,
            raw_section_min_length: 100,
            max_embedding_retries: 3,
            retry_base_wait_secs: 1.0,
            retry_max_wait_secs: 8.0,
        }
    }
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self { encryption_key: String::new() }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            secret: String::new(),
            timeout_secs: 30,
            max_retries: 3,
            retry_delay_secs: 1.0,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { use_split_queues: true, backpressure_threshold: 50 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,resumind=debug".to_string(),
            file: Some("logs/resumind.log".to_string()),
        }
    }
}

// =========================
// Helpers for parsing values
// =========================

fn parse_bool(input: &str, default: bool) -> bool {
    match input.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => true,
        "false" | "0" | "no" | "off" => false,
        _ => default,
    }
}

fn parse_duration_to_secs(input: &str) -> Result<u64, String> {
    // Accept plain numbers (treated as seconds)
    if let Ok(val) = input.parse::<u64>() {
        return Ok(val);
    }

    let s = input.trim().to_lowercase();
    let (num_str, unit) = s.split_at(s.chars().take_while(|c| c.is_ascii_digit()).count());
    if num_str.is_empty() || unit.is_empty() {
        return Err("missing number or unit".into());
    }
    let n: u64 = num_str.parse().map_err(|_| "invalid number".to_string())?;
    match unit {
        "s" | "sec" | "secs" | "second" | "seconds" => Ok(n),
        "m" | "min" | "mins" | "minute" | "minutes" => Ok(n * 60),
        "h" | "hr" | "hour" | "hours" => Ok(n * 60 * 60),
        _ => Err(format!("unsupported unit: {}", unit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration_to_secs("30").unwrap(), 30);
        assert_eq!(parse_duration_to_secs("30s").unwrap(), 30);
        assert_eq!(parse_duration_to_secs("5m").unwrap(), 300);
        assert_eq!(parse_duration_to_secs("2h").unwrap(), 7200);
        assert!(parse_duration_to_secs("abc").is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true", false));
        assert!(parse_bool("1", false));
        assert!(!parse_bool("off", true));
        assert!(parse_bool("garbage", true));
    }

    #[test]
    fn test_analysis_mode_roundtrip() {
        assert_eq!(AnalysisMode::parse_mode("phase_2"), AnalysisMode::Phase2);
        assert_eq!(AnalysisMode::parse_mode("phase_1"), AnalysisMode::Phase1);
        assert_eq!(AnalysisMode::parse_mode("unknown"), AnalysisMode::Phase1);
        assert_eq!(AnalysisMode::Phase2.as_str(), "phase_2");
    }

    #[test]
    fn test_default_config_validates() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_encryption_key_rejected() {
        let mut config = Config::default();
        config.privacy.encryption_key = "too-short".to_string();
        assert!(config.validate().is_err());

        config.privacy.encryption_key = "0123456789abcdef0123456789abcdef".to_string(); // 32 bytes
        assert!(config.validate().is_ok());

        config.privacy.encryption_key = "00".repeat(32); // 64 hex
        assert!(config.validate().is_ok());
    }
}
