//! Taxi Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Batched, resumable loading of NYC taxi trip data.
//!
//! A run pulls batches from a [`source::Source`], passes them through a chain
//! of [`transform::Transform`]s and writes them to a [`sink::Sink`]. Inputs are
//! staged to local disk first by the [`fetch`] module, which adds retries and a
//! time-limited cache around HTTP, local and bucket locators.
//!
//! # Supported Targets
//!
//! - **PostgreSQL**: tables created from the first batch's schema
//! - **Parquet**: local files, optionally uploaded to an S3-compatible bucket
//!
//! # Example
//!
//! ```no_run
//! use taxi_ingest::config::IngestConfig;
//! use taxi_ingest::flows;
//! use taxi_ingest::transform::PassengerPolicy;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     config.validate()?;
//!     flows::ingest_to_postgres(
//!         &config,
//!         "https://github.com/DataTalksClub/nyc-tlc-data/releases/download/yellow/yellow_tripdata_2021-01.csv.gz",
//!         "yellow_taxi_data",
//!         PassengerPolicy::Keep,
//!     )
//!     .await?;
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod config;
pub mod dataset;
pub mod fetch;
pub mod flows;
pub mod pipeline;
pub mod sink;
pub mod source;
pub mod storage;
pub mod transform;

pub use batch::{Batch, Schema, Value};
pub use pipeline::{Pipeline, PipelineConfig, PipelineError, RunReport};
