//! Configuration management for kbforge
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default, config/{APP_ENV}, config/local)
//! - Default values

use crate::errors::{AppError, Result};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Embedding service configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Chunker configuration
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Retrieval and ranking configuration
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Background job queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    /// Embedding provider: openai, mock
    #[serde(default = "default_embedding_provider")]
    pub provider: String,

    /// API key for embedding service
    pub api_key: Option<String>,

    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,

    /// Model to use
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Embedding dimension
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Request timeout in seconds
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,

    /// Maximum retries
    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,

    /// Texts per embedding request
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChunkingConfig {
    /// Maximum characters per chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Characters carried from the end of one chunk into the next
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    /// Documents chunked and embedded per pass
    #[serde(default = "default_embed_batch_size")]
    pub embed_batch_size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrievalConfig {
    /// System-wide default for results returned across all knowledge bases
    #[serde(default = "default_max_results")]
    pub max_results: usize,

    /// System-wide default minimum backend score
    #[serde(default = "default_min_score")]
    pub min_score: f32,

    /// Upper bound for one knowledge base (resolve + search) in milliseconds
    #[serde(default = "default_backend_timeout")]
    pub backend_timeout_ms: u64,

    /// Score multipliers for structurally de-emphasized content
    #[serde(default)]
    pub boost: BoostConfig,

    /// Nearest chunks considered when building a compliance context
    #[serde(default = "default_candidate_pool")]
    pub candidate_pool: usize,

    /// Chunks kept in a compliance context
    #[serde(default = "default_context_limit")]
    pub context_limit: usize,

    /// Chunks this short or shorter are left out of a context
    #[serde(default = "default_min_context_chars")]
    pub min_context_chars: usize,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct BoostConfig {
    #[serde(default = "default_footer_boost")]
    pub footer: f32,

    #[serde(default = "default_legal_boost")]
    pub legal: f32,

    #[serde(default = "default_navigation_boost")]
    pub navigation: f32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Redis URL of the durable broker; absent disables background jobs
    pub redis_url: Option<String>,

    /// Key prefix for namespacing broker keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Broker connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Hard upper bound for closing the broker connection
    #[serde(default = "default_close_timeout")]
    pub close_timeout_ms: u64,

    /// Compliance evaluation jobs
    #[serde(default = "JobSettings::compliance")]
    pub compliance: JobSettings,

    /// Research collection jobs
    #[serde(default = "JobSettings::research")]
    pub research: JobSettings,
}

/// Per-task retry, retention and worker settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobSettings {
    /// Total attempts including the first
    pub attempts: u32,

    /// Delay before the first retry; doubles on every further retry
    pub backoff_ms: u64,

    /// Failed jobs retained for inspection
    pub keep_failed: usize,

    /// Jobs processed in parallel by one worker
    pub concurrency: usize,

    /// Jobs started per rate window
    pub rate_limit_max: u32,

    /// Rate window in milliseconds
    pub rate_limit_window_ms: u64,

    /// Sleep between polls of an empty queue
    pub poll_interval_ms: u64,

    /// Hard upper bound for draining a worker
    pub shutdown_timeout_ms: u64,

    /// How long a claimed job may stay active before another worker
    /// reclaims it as a failed attempt
    pub lease_ms: u64,
}

impl JobSettings {
    pub fn compliance() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 5_000,
            keep_failed: 100,
            concurrency: 1,
            rate_limit_max: 1,
            rate_limit_window_ms: 1_000,
            poll_interval_ms: 500,
            shutdown_timeout_ms: 10_000,
            lease_ms: 300_000,
        }
    }

    pub fn research() -> Self {
        Self {
            attempts: 2,
            backoff_ms: 10_000,
            keep_failed: 50,
            concurrency: 2,
            rate_limit_max: 2,
            rate_limit_window_ms: 5_000,
            poll_interval_ms: 1_000,
            shutdown_timeout_ms: 15_000,
            lease_ms: 900_000,
        }
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Service name attached to log lines
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

// Default value functions
fn default_embedding_provider() -> String { "openai".to_string() }
fn default_embedding_model() -> String { "text-embedding-3-small".to_string() }
fn default_embedding_dimension() -> usize { 1536 }
fn default_embedding_timeout() -> u64 { 30 }
fn default_embedding_retries() -> u32 { 3 }
fn default_batch_size() -> usize { 100 }
fn default_chunk_size() -> usize { 512 }
fn default_chunk_overlap() -> usize { 150 }
fn default_embed_batch_size() -> usize { 5 }
fn default_max_results() -> usize { 10 }
fn default_min_score() -> f32 { 0.4 }
fn default_backend_timeout() -> u64 { 15_000 }
fn default_footer_boost() -> f32 { 1.25 }
fn default_legal_boost() -> f32 { 1.15 }
fn default_navigation_boost() -> f32 { 1.10 }
fn default_candidate_pool() -> usize { 20 }
fn default_context_limit() -> usize { 10 }
fn default_min_context_chars() -> usize { 30 }
fn default_key_prefix() -> String { "kbforge".to_string() }
fn default_connect_timeout() -> u64 { 2_000 }
fn default_close_timeout() -> u64 { 10_000 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_service_name() -> String { "kbforge".to_string() }

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            api_key: None,
            api_base: None,
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            timeout_secs: default_embedding_timeout(),
            max_retries: default_embedding_retries(),
            batch_size: default_batch_size(),
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            embed_batch_size: default_embed_batch_size(),
        }
    }
}

impl Default for BoostConfig {
    fn default() -> Self {
        Self {
            footer: default_footer_boost(),
            legal: default_legal_boost(),
            navigation: default_navigation_boost(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
            min_score: default_min_score(),
            backend_timeout_ms: default_backend_timeout(),
            boost: BoostConfig::default(),
            candidate_pool: default_candidate_pool(),
            context_limit: default_context_limit(),
            min_context_chars: default_min_context_chars(),
        }
    }
}

impl RetrievalConfig {
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: default_key_prefix(),
            connect_timeout_ms: default_connect_timeout(),
            close_timeout_ms: default_close_timeout(),
            compliance: JobSettings::compliance(),
            research: JobSettings::research(),
        }
    }
}

impl QueueConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            service_name: default_service_name(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            embedding: EmbeddingConfig::default(),
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            queue: QueueConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> std::result::Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Built-in defaults, so partial tables only override what they name
            .add_source(default_layer()?)

            // Load base config file
            .add_source(File::with_name("config/default").required(false))

            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))

            // Load local overrides
            .add_source(File::with_name("config/local").required(false))

            // Load from environment variables with APP__ prefix
            // e.g., APP__RETRIEVAL__MAX_RESULTS=20
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )

            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific TOML file
    pub fn from_file(path: &str) -> std::result::Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(default_layer()?)
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?;

        config.try_deserialize()
    }

    /// Reject values that would produce silently wrong behavior
    pub fn validate(&self) -> Result<()> {
        let chunking = &self.chunking;
        if chunking.chunk_size == 0 {
            return Err(AppError::configuration("chunking.chunk_size must be positive"));
        }
        if chunking.chunk_overlap >= chunking.chunk_size {
            return Err(AppError::configuration(format!(
                "chunking.chunk_overlap ({}) must be smaller than chunking.chunk_size ({})",
                chunking.chunk_overlap, chunking.chunk_size
            )));
        }
        if chunking.embed_batch_size == 0 {
            return Err(AppError::configuration("chunking.embed_batch_size must be positive"));
        }

        let boost = &self.retrieval.boost;
        for (name, value) in [
            ("footer", boost.footer),
            ("legal", boost.legal),
            ("navigation", boost.navigation),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(AppError::configuration(format!(
                    "retrieval.boost.{} must be a positive number",
                    name
                )));
            }
        }
        if self.retrieval.max_results == 0 {
            return Err(AppError::configuration("retrieval.max_results must be positive"));
        }

        for (name, job) in [
            ("compliance", &self.queue.compliance),
            ("research", &self.queue.research),
        ] {
            if job.attempts == 0 {
                return Err(AppError::configuration(format!(
                    "queue.{}.attempts must be at least 1",
                    name
                )));
            }
            if job.lease_ms == 0 {
                return Err(AppError::configuration(format!(
                    "queue.{}.lease_ms must be positive",
                    name
                )));
            }
            if job.concurrency == 0 || job.rate_limit_max == 0 {
                return Err(AppError::configuration(format!(
                    "queue.{}.concurrency and rate_limit_max must be positive",
                    name
                )));
            }
        }

        Ok(())
    }
}

fn default_layer() -> std::result::Result<Config, ConfigError> {
    Config::try_from(&AppConfig::default())
}
