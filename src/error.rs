//! Error types for the surveillance pipeline.

use std::path::PathBuf;

use thiserror::Error;

use crate::sarima::ModelError;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// No weekly series exists for the code.
    #[error("insufficient data: no weekly cases recorded for {code}")]
    InsufficientData { code: String },

    #[error("model not found: {code} version {version}")]
    ModelNotFound { code: String, version: String },

    /// Storage failure while recomputing weekly totals.
    #[error("aggregation failed: {0}")]
    Aggregation(#[source] sqlx::Error),

    /// Write failure for predictions or notifications.
    #[error("persistence failed: {0}")]
    Persistence(#[source] sqlx::Error),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("invalid yearweek '{0}': expected YYYYWW naming an existing ISO week")]
    InvalidYearWeek(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("artifact I/O failed at {path}: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}
