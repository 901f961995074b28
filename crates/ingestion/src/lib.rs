//! kbforge Ingestion
//!
//! Turns raw documents into bounded, overlapping chunks:
//! - Markup walking with region classification (body, footer, legal, navigation)
//! - Boundary-aware splitting with configurable overlap
//! - Positional metadata for every chunk

pub mod chunker;
pub mod errors;
pub mod markup;

pub use chunker::{Chunker, ChunkerConfig};
pub use errors::IngestionError;
