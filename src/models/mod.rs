pub mod entry;
pub mod run;
pub mod run_config;

pub use entry::*;
pub use run::*;
pub use run_config::*;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum IngestionError {
    #[error("Database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Forms API error: {0}")]
    FormsApi(String),

    #[error("Unrecognized unread payload: {0}")]
    InvalidPayload(String),

    #[error("Warehouse error: {0}")]
    Warehouse(String),

    #[error("Warehouse table not found: {0}")]
    TableNotFound(String),

    #[error("Warehouse rejected {failed} row(s) for {table_id}: {sample}")]
    InsertRejected {
        table_id: String,
        failed: usize,
        sample: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("A run is already in progress for '{0}'")]
    RunInProgress(String),

    #[error("Sync error: {0}")]
    Sync(String),
}

pub type Result<T> = std::result::Result<T, IngestionError>;

/// Outcome of one pipeline run, as persisted and as returned to callers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunStatus {
    NoData,
    Ingested,
    Error,
}

/// What happened to the post-ingestion metadata step (external-list sync).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MetadataStatus {
    Skipped,
    Ok(String),
    Failed,
    Error,
}

/// Sink for unexpected exceptions. The default impl logs through tracing;
/// deployments wanting mail/webhook alerting provide their own.
pub trait ExceptionSink: Send + Sync {
    fn report(&self, scope: &str, error: &IngestionError, context: serde_json::Value);
}

pub struct TracingExceptionSink;

impl ExceptionSink for TracingExceptionSink {
    fn report(&self, scope: &str, error: &IngestionError, context: serde_json::Value) {
        tracing::error!(scope = %scope, error = %error, context = %context, "Unhandled pipeline exception");
    }
}
