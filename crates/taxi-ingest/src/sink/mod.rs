//! Batch sinks
//!
//! A [`Sink`] is told the schema of the target once, then receives every batch
//! of the run in order, and is finally closed with the outcome of the run.

pub mod memory;
pub mod parquet;
pub mod postgres;

use crate::batch::{Batch, BatchError, Schema};
use async_trait::async_trait;
use std::fmt;

pub use self::memory::MemorySink;
pub use self::parquet::ParquetSink;
pub use self::postgres::PostgresSink;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Schema mismatch for '{target}': declared {expected}, got {found}")]
    SchemaMismatch {
        target: String,
        expected: String,
        found: String,
    },

    #[error("Target '{0}' has not been declared")]
    Undeclared(String),

    #[error("{sink} sink does not support {operation}")]
    Unsupported {
        sink: &'static str,
        operation: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] ::parquet::errors::ParquetError),

    #[error("Batch conversion failed: {0}")]
    Batch(#[from] BatchError),

    #[error("Storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

impl SinkError {
    pub fn schema_mismatch(target: &str, expected: &Schema, found: &Schema) -> Self {
        SinkError::SchemaMismatch {
            target: target.to_string(),
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }
}

/// What to do when the target already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WritePolicy {
    /// Drop the existing target and recreate it empty
    #[default]
    Replace,
    /// Create the target only if missing and keep its rows
    Append,
}

impl fmt::Display for WritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WritePolicy::Replace => write!(f, "replace"),
            WritePolicy::Append => write!(f, "append"),
        }
    }
}

/// How the run ended, passed to [`Sink::close`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed,
}

/// Consumer of batches
#[async_trait]
pub trait Sink: Send {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Create (or with `Append`, reuse) `target` with zero rows and `schema`
    async fn declare_schema(
        &mut self,
        target: &str,
        schema: &Schema,
        policy: WritePolicy,
    ) -> Result<(), SinkError>;

    /// Add the rows of `batch` to `target`, in order
    ///
    /// A batch whose schema differs from the declared one is rejected with
    /// [`SinkError::SchemaMismatch`].
    async fn append_batch(&mut self, target: &str, batch: &Batch) -> Result<(), SinkError>;

    /// Release resources; called exactly once per run
    async fn close(&mut self, outcome: RunOutcome) -> Result<(), SinkError>;
}

#[async_trait]
impl<K: Sink + ?Sized> Sink for Box<K> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn declare_schema(
        &mut self,
        target: &str,
        schema: &Schema,
        policy: WritePolicy,
    ) -> Result<(), SinkError> {
        (**self).declare_schema(target, schema, policy).await
    }

    async fn append_batch(&mut self, target: &str, batch: &Batch) -> Result<(), SinkError> {
        (**self).append_batch(target, batch).await
    }

    async fn close(&mut self, outcome: RunOutcome) -> Result<(), SinkError> {
        (**self).close(outcome).await
    }
}
