//! Error types for the labourlake-pipeline crate.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for pipeline, lineage and catalog operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Unsupported source format '{extension}' for {}", .path.display())]
    UnsupportedFormat { path: PathBuf, extension: String },

    #[error("Source error: {0}")]
    Source(String),

    #[error("Invalid transform: {0}")]
    InvalidTransform(String),

    #[error("Missing column '{column}'")]
    MissingColumn { column: String },

    #[error("Cannot cast {value} in column '{column}' to {target}")]
    CastFailed {
        column: String,
        value: String,
        target: String,
    },

    #[error("Provenance column '{column}' already exists with type {existing}")]
    ProvenanceCollision { column: String, existing: String },

    #[error("Missing provenance: {0}")]
    MissingProvenance(String),

    #[error("Table '{table}' is locked by {holder}")]
    TableLocked { table: String, holder: String },

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub fn source_read(msg: impl Into<String>) -> Self {
        Self::Source(msg.into())
    }

    pub fn invalid_transform(msg: impl Into<String>) -> Self {
        Self::InvalidTransform(msg.into())
    }

    pub fn missing_column(column: impl Into<String>) -> Self {
        Self::MissingColumn {
            column: column.into(),
        }
    }

    pub fn missing_provenance(msg: impl Into<String>) -> Self {
        Self::MissingProvenance(msg.into())
    }

    pub fn catalog(msg: impl Into<String>) -> Self {
        Self::Catalog(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}
