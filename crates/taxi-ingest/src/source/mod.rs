//! Batch sources
//!
//! A [`Source`] turns a staged dataset file into a lazy, finite sequence of
//! [`Batch`]es. Every batch of one source shares the same schema and holds at
//! most `batch_size` rows; only the last may be smaller.

pub mod csv;
pub mod parquet;

use crate::batch::{Batch, BatchError, ColumnType};
use crate::config::DEFAULT_BATCH_SIZE;
use crate::transform::TransformError;
use std::collections::VecDeque;
use std::path::Path;
use tracing::info;

pub use self::csv::CsvSource;
pub use self::parquet::ParquetSource;

/// Errors raised while producing batches
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] ::csv::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] ::parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] ::arrow::error::ArrowError),

    #[error("Invalid batch: {0}")]
    Batch(#[from] BatchError),

    #[error("Line {line}, column '{column}': cannot read '{value}' as {expected}")]
    Parse {
        line: u64,
        column: String,
        value: String,
        expected: ColumnType,
    },

    #[error("Unsupported dataset format: {0}. Expected .csv, .csv.gz or .parquet")]
    UnsupportedFormat(String),

    #[error("Transform failed: {0}")]
    Transform(#[from] TransformError),
}

/// Producer of batches
///
/// `Ok(None)` signals exhaustion; callers must not pull again afterwards.
pub trait Source: Send {
    fn next_batch(&mut self) -> Result<Option<Batch>, SourceError>;
}

impl<S: Source + ?Sized> Source for Box<S> {
    fn next_batch(&mut self) -> Result<Option<Batch>, SourceError> {
        (**self).next_batch()
    }
}

/// Options shared by the file-backed sources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceOptions {
    /// Maximum rows per batch
    pub batch_size: usize,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl SourceOptions {
    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }
}

/// On-disk layout of a staged dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetFormat {
    Csv { gzip: bool },
    Parquet,
}

impl DatasetFormat {
    /// Detect the format from the file extension
    pub fn from_path(path: &Path) -> Result<Self, SourceError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        if name.ends_with(".parquet") {
            Ok(DatasetFormat::Parquet)
        } else if name.ends_with(".csv.gz") {
            Ok(DatasetFormat::Csv { gzip: true })
        } else if name.ends_with(".csv") {
            Ok(DatasetFormat::Csv { gzip: false })
        } else {
            Err(SourceError::UnsupportedFormat(path.display().to_string()))
        }
    }
}

/// Open the right reader for a staged file
pub fn open_source(path: &Path, options: SourceOptions) -> Result<Box<dyn Source>, SourceError> {
    let format = DatasetFormat::from_path(path)?;
    info!(
        "Opening {} as {:?} (batch size {})",
        path.display(),
        format,
        options.batch_size
    );

    match format {
        DatasetFormat::Csv { .. } => Ok(Box::new(CsvSource::open(path, options)?)),
        DatasetFormat::Parquet => Ok(Box::new(ParquetSource::open(path, options)?)),
    }
}

/// Source over batches already held in memory
#[derive(Debug, Default)]
pub struct MemorySource {
    batches: VecDeque<Batch>,
}

impl MemorySource {
    pub fn new(batches: impl IntoIterator<Item = Batch>) -> Self {
        Self {
            batches: batches.into_iter().collect(),
        }
    }
}

impl Source for MemorySource {
    fn next_batch(&mut self) -> Result<Option<Batch>, SourceError> {
        Ok(self.batches.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_format_detection() {
        let cases = [
            ("yellow_tripdata_2021-01.csv.gz", DatasetFormat::Csv { gzip: true }),
            ("output.csv", DatasetFormat::Csv { gzip: false }),
            ("YELLOW_TRIPDATA_2021-01.PARQUET", DatasetFormat::Parquet),
        ];
        for (name, expected) in cases {
            assert_eq!(DatasetFormat::from_path(&PathBuf::from(name)).unwrap(), expected);
        }

        let err = DatasetFormat::from_path(&PathBuf::from("trips.json")).unwrap_err();
        assert!(matches!(err, SourceError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_batch_size_is_never_zero() {
        assert_eq!(SourceOptions::with_batch_size(0).batch_size, 1);
        assert_eq!(SourceOptions::default().batch_size, 100_000);
    }
}
