//! End-to-end flows
//!
//! Each flow stages its input, opens a source, adds the cleaning transforms
//! and hands everything to the [`Pipeline`].

use crate::config::IngestConfig;
use crate::dataset::{TaxiColor, TripDataset};
use crate::fetch::{stager_for, BucketStager, Locator, Retrying, Stage};
use crate::pipeline::{Pipeline, PipelineConfig, RunReport};
use crate::sink::{MemorySink, ParquetSink, PostgresSink, Sink, WritePolicy};
use crate::source::{open_source, Source, SourceOptions};
use crate::storage::Storage;
use crate::transform::{FillMissingPassengerCount, ParseDatetimes, PassengerPolicy, TransformChain, TransformedSource};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

/// Suffix shared by the pickup and dropoff columns of every fleet
const DATETIME_SUFFIX: &str = "_datetime";

fn source_options(config: &IngestConfig) -> SourceOptions {
    SourceOptions::with_batch_size(config.batch_size)
}

fn open_transformed(
    path: &Path,
    config: &IngestConfig,
    chain: TransformChain,
) -> Result<TransformedSource<Box<dyn Source>>> {
    let source = open_source(path, source_options(config))
        .with_context(|| format!("Failed to open {}", path.display()))?;
    info!("Transforms: {:?}", chain.names());
    Ok(TransformedSource::new(source, chain))
}

/// Storage for `s3://` locators, pointed at the locator's bucket
async fn storage_for(config: &IngestConfig, locator: &str) -> Result<Option<Storage>> {
    match Locator::parse(locator)? {
        Locator::Bucket { bucket, .. } => {
            let mut storage = config.storage.clone();
            if let Some(bucket) = bucket {
                storage.bucket = bucket;
            }
            Ok(Some(Storage::new(storage).await?))
        },
        Locator::Http(_) | Locator::File(_) => Ok(None),
    }
}

/// Stage any supported locator and return the local path
async fn stage_input(config: &IngestConfig, locator: &str) -> Result<PathBuf> {
    let storage = storage_for(config, locator).await?;
    let path = stager_for(locator, config, storage.as_ref())?
        .stage(locator)
        .await
        .with_context(|| format!("Failed to stage {}", locator))?;
    Ok(path)
}

/// Run the pipeline and attach the flow's context to failures
pub async fn load<S, K>(source: &mut S, sink: &mut K, target: &str, policy: WritePolicy) -> Result<RunReport>
where
    S: Source + ?Sized,
    K: Sink + ?Sized,
{
    let pipeline = Pipeline::new(PipelineConfig::new(target).with_write_policy(policy));
    let report = pipeline
        .run(source, sink)
        .await
        .with_context(|| format!("Loading into {} sink '{}' failed", sink.name(), target))?;
    Ok(report)
}

/// Stage a CSV or Parquet file (URL, `s3://` URI or path) and load it into a PostgreSQL table
#[instrument(skip(config))]
pub async fn ingest_to_postgres(
    config: &IngestConfig,
    locator: &str,
    table: &str,
    passengers: PassengerPolicy,
) -> Result<RunReport> {
    info!("Starting ingestion of {} into {}", locator, table);

    let path = stage_input(config, locator).await?;

    let mut chain = TransformChain::new().with(ParseDatetimes::by_suffix(DATETIME_SUFFIX));
    if let Some(transform) = passengers.transform() {
        chain.push(transform);
    }
    let mut source = open_transformed(&path, config, chain)?;

    info!("Connecting to {}", config.database.display_target());
    let mut sink = PostgresSink::connect(config.database.connect_options()?).await?;

    load(&mut source, &mut sink, table, WritePolicy::Replace).await
}

/// Download one month of CSV trips and store it in the bucket as Parquet
#[instrument(skip(config, storage, dataset), fields(dataset = %dataset))]
pub async fn web_to_bucket(
    config: &IngestConfig,
    storage: &Storage,
    dataset: &TripDataset,
) -> Result<RunReport> {
    let url = dataset.csv_url();
    let path = stager_for(&url, config, Some(storage))?
        .stage(&url)
        .await
        .with_context(|| format!("Failed to stage {}", url))?;

    let chain = TransformChain::new().with(ParseDatetimes::new(dataset.datetime_columns()));
    let mut source = open_transformed(&path, config, chain)?;

    let mut sink = ParquetSink::with_storage(config.staging_dir(), storage.clone());
    let report = load(&mut source, &mut sink, &dataset.object_key(), WritePolicy::Replace).await?;

    info!(
        "Stored {} rows of {} at {} (local copy {})",
        report.total_rows,
        dataset,
        storage.object_url(&dataset.object_key()),
        dataset.local_path(&config.staging_dir()).display()
    );
    Ok(report)
}

/// Run [`web_to_bucket`] for several months in order, stopping at the first failure
pub async fn web_to_bucket_months(
    config: &IngestConfig,
    color: TaxiColor,
    year: i32,
    months: &[u32],
) -> Result<Vec<RunReport>> {
    let datasets = months
        .iter()
        .map(|month| TripDataset::new(color, year, *month))
        .collect::<Result<Vec<_>, _>>()?;

    let storage = Storage::new(config.storage.clone()).await?;

    let mut reports = Vec::with_capacity(datasets.len());
    for dataset in &datasets {
        reports.push(web_to_bucket(config, &storage, dataset).await?);
    }
    Ok(reports)
}

/// Load one month of Parquet trips from the bucket into PostgreSQL, appending
#[instrument(skip(config, dataset), fields(dataset = %dataset))]
pub async fn bucket_to_postgres(config: &IngestConfig, dataset: &TripDataset, table: &str) -> Result<RunReport> {
    let storage = Storage::new(config.storage.clone()).await?;
    let key = dataset.object_key();
    if !storage.exists(&key).await? {
        anyhow::bail!(
            "{} not found; run web-to-bucket for {} first",
            storage.object_url(&key),
            dataset
        );
    }

    let stager = Retrying::new(
        BucketStager::new(storage, config.staging_dir()),
        config.stage_retries,
    );
    let path = stager
        .stage(&key)
        .await
        .with_context(|| format!("Failed to download {}", key))?;

    let chain = TransformChain::new().with(FillMissingPassengerCount);
    let mut source = open_transformed(&path, config, chain)?;

    let mut sink = PostgresSink::connect(config.database.connect_options()?).await?;
    load(&mut source, &mut sink, table, WritePolicy::Append).await
}

/// Read a dataset into memory without writing anywhere
#[instrument(skip(config))]
pub async fn inspect(config: &IngestConfig, locator: &str) -> Result<RunReport> {
    let path = stage_input(config, locator).await?;

    let chain = TransformChain::new().with(ParseDatetimes::by_suffix(DATETIME_SUFFIX));
    let mut source = open_transformed(&path, config, chain)?;
    let mut sink = MemorySink::new();

    let report = load(&mut source, &mut sink, "inspect", WritePolicy::Replace).await?;
    if let Some(table) = sink.table("inspect") {
        info!("Schema: {}", table.schema);
    }
    Ok(report)
}
