//! Ingestion error types

use kbforge_common::errors::AppError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestionError {
    #[error("Invalid chunker configuration: {0}")]
    InvalidConfig(String),
}

impl From<IngestionError> for AppError {
    fn from(e: IngestionError) -> Self {
        match e {
            IngestionError::InvalidConfig(message) => AppError::Configuration { message },
        }
    }
}
