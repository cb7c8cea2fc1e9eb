//! Parquet source

use super::{Source, SourceError, SourceOptions};
use crate::batch::arrow::{batch_from_record_batch, schema_from_arrow};
use crate::batch::{Batch, Schema};
use ::parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Reads a Parquet file as record batches of at most `batch_size` rows
pub struct ParquetSource {
    reader: ParquetRecordBatchReader,
    schema: Arc<Schema>,
    total_rows: i64,
}

impl ParquetSource {
    pub fn open(path: &Path, options: SourceOptions) -> Result<Self, SourceError> {
        let file = File::open(path)?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;

        let total_rows = builder.metadata().file_metadata().num_rows();
        let schema = Arc::new(schema_from_arrow(builder.schema()));

        info!(
            "Parquet file {} holds {} rows in {} row groups",
            path.display(),
            total_rows,
            builder.metadata().num_row_groups()
        );

        let reader = builder.with_batch_size(options.batch_size.max(1)).build()?;

        Ok(Self {
            reader,
            schema,
            total_rows,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Row count recorded in the file footer
    pub fn total_rows(&self) -> i64 {
        self.total_rows
    }
}

impl Source for ParquetSource {
    fn next_batch(&mut self) -> Result<Option<Batch>, SourceError> {
        match self.reader.next() {
            Some(record) => {
                let record = record?;
                Ok(Some(batch_from_record_batch(&self.schema, &record)?))
            },
            None => Ok(None),
        }
    }
}
