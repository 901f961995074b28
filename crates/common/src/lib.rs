//! kbforge Common Library
//!
//! Shared code for the kbforge crates including:
//! - Document and chunk data model
//! - Embedding client abstraction
//! - Error types and handling
//! - Configuration management
//! - Background job queue (brokers, providers, workers)
//! - Metrics and tracing setup

pub mod config;
pub mod embeddings;
pub mod errors;
pub mod metrics;
pub mod models;
pub mod queue;
pub mod telemetry;

// Re-export commonly used types
pub use config::AppConfig;
pub use embeddings::Embedder;
pub use errors::{AppError, Result};
pub use models::{ChunkMetadata, Document, SemanticSource, TextChunk};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
