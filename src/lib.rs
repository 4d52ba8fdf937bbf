use thiserror::Error;

pub type Result<T> = std::result::Result<T, FeedbackError>;

#[derive(Error, Debug)]
pub enum FeedbackError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Vector store error: {0}")]
    Store(String),

    #[error("Vector store is not ready: {0}")]
    StoreNotReady(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Timed out during {operation}")]
    Timeout { operation: String },

    #[error("Pattern not found: {0}")]
    PatternNotFound(String),

    #[error("Import rejected: {0}")]
    Import(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<similarity::SimilarityError> for FeedbackError {
    #[inline]
    fn from(err: similarity::SimilarityError) -> Self {
        match err {
            similarity::SimilarityError::DimensionMismatch { left, right } => {
                Self::DimensionMismatch {
                    expected: left,
                    actual: right,
                }
            }
        }
    }
}

pub mod analysis;
pub mod anonymizer;
pub mod commands;
pub mod config;
pub mod database;
pub mod embeddings;
pub mod feedback;
pub mod metrics;
pub mod service;
pub mod similarity;
pub mod store;
