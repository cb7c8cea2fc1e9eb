//! Parquet file sink with optional upload to object storage

use super::{RunOutcome, Sink, SinkError, WritePolicy};
use crate::batch::arrow::{record_batch_from_batch, to_arrow_schema};
use crate::batch::{Batch, Schema};
use crate::storage::Storage;
use ::arrow::datatypes::SchemaRef;
use ::parquet::arrow::ArrowWriter;
use ::parquet::basic::{Compression, GzipLevel};
use ::parquet::file::properties::WriterProperties;
use async_trait::async_trait;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

struct OpenFile {
    key: String,
    path: PathBuf,
    schema: Schema,
    arrow_schema: SchemaRef,
    writer: ArrowWriter<File>,
    rows: usize,
}

/// Writes the run to `{staging_dir}/{target}` as gzip-compressed Parquet
///
/// The target name doubles as the object key; with storage configured the
/// finished file is uploaded to that key when the run completes.
pub struct ParquetSink {
    staging_dir: PathBuf,
    storage: Option<Storage>,
    open: Option<OpenFile>,
    written: Option<PathBuf>,
}

impl ParquetSink {
    /// Local-only sink
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            storage: None,
            open: None,
            written: None,
        }
    }

    /// Sink that uploads the finished file
    pub fn with_storage(staging_dir: impl Into<PathBuf>, storage: Storage) -> Self {
        Self {
            storage: Some(storage),
            ..Self::new(staging_dir)
        }
    }

    /// Local path for an object key
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.staging_dir.join(key)
    }

    /// File finished by the last completed run
    pub fn written_path(&self) -> Option<&Path> {
        self.written.as_deref()
    }
}

#[async_trait]
impl Sink for ParquetSink {
    fn name(&self) -> &'static str {
        "parquet"
    }

    async fn declare_schema(
        &mut self,
        target: &str,
        schema: &Schema,
        policy: WritePolicy,
    ) -> Result<(), SinkError> {
        if policy == WritePolicy::Append {
            return Err(SinkError::Unsupported {
                sink: "parquet",
                operation: "append to an existing file".to_string(),
            });
        }

        let path = self.path_for(target);
        if let Some(parent) = path.parent() {
            if parent.is_dir() {
                info!("Directory '{}' already exists and will be re-used.", parent.display());
            } else {
                std::fs::create_dir_all(parent)?;
            }
        }

        let arrow_schema = to_arrow_schema(schema);
        let props = WriterProperties::builder()
            .set_compression(Compression::GZIP(GzipLevel::default()))
            .build();
        let writer = ArrowWriter::try_new(File::create(&path)?, arrow_schema.clone(), Some(props))?;

        if let Some(previous) = self.open.replace(OpenFile {
            key: target.to_string(),
            path,
            schema: schema.clone(),
            arrow_schema,
            writer,
            rows: 0,
        }) {
            warn!("Discarding unfinished file {}", previous.path.display());
        }
        Ok(())
    }

    async fn append_batch(&mut self, target: &str, batch: &Batch) -> Result<(), SinkError> {
        let open = match self.open.as_mut() {
            Some(open) if open.key == target => open,
            _ => return Err(SinkError::Undeclared(target.to_string())),
        };

        if open.schema != *batch.schema() {
            return Err(SinkError::schema_mismatch(target, &open.schema, batch.schema()));
        }
        if batch.is_empty() {
            return Ok(());
        }

        let record = record_batch_from_batch(batch, open.arrow_schema.clone())?;
        open.writer.write(&record)?;
        open.rows += batch.num_rows();
        Ok(())
    }

    async fn close(&mut self, outcome: RunOutcome) -> Result<(), SinkError> {
        let Some(open) = self.open.take() else {
            return Ok(());
        };

        if outcome == RunOutcome::Failed {
            warn!(
                "Run failed; leaving partial file {} without upload",
                open.path.display()
            );
            return Ok(());
        }

        open.writer.close()?;
        info!("Wrote {} rows to {}", open.rows, open.path.display());

        if let Some(storage) = &self.storage {
            storage
                .upload_file(&open.key, &open.path)
                .await
                .map_err(SinkError::Storage)?;
        }

        self.written = Some(open.path);
        Ok(())
    }
}
