//! Batched ingestion pipeline
//!
//! Moves every row of a [`Source`] into a [`Sink`] one batch at a time:
//!
//! 1. pull the first batch (an exhausted source is [`PipelineError::EmptyDataset`]
//!    and the sink is never touched),
//! 2. declare the target with the first batch's schema,
//! 3. append the first batch, then every following batch until the source is
//!    exhausted.
//!
//! Each append is timed and logged as `{rows} rows inserted in {secs:.3}s`.
//! Nothing is retried; the first error ends the run. The sink is closed
//! exactly once, whatever the outcome.

use crate::batch::Batch;
use crate::sink::{RunOutcome, Sink, SinkError, WritePolicy};
use crate::source::{Source, SourceError};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Source produced no batches; nothing was written to '{target}'")]
    EmptyDataset { target: String },

    #[error("Sink rejected schema declaration for '{target}': {source}")]
    SchemaDeclaration {
        target: String,
        #[source]
        source: SinkError,
    },

    #[error("Append of batch {batch_index} failed after {rows_committed} rows were committed: {source}")]
    Append {
        batch_index: usize,
        rows_committed: u64,
        #[source]
        source: SinkError,
    },

    #[error("Batch {batch_index} does not match the declared schema: {source}")]
    SchemaMismatch {
        batch_index: usize,
        rows_committed: u64,
        #[source]
        source: SinkError,
    },

    #[error("Reading batch {batch_index} failed: {source}")]
    Source {
        batch_index: usize,
        #[source]
        source: SourceError,
    },

    #[error("Sink failed to close after a successful run: {0}")]
    Close(#[source] SinkError),
}

impl PipelineError {
    /// Rows durably appended before the failure, when known
    pub fn rows_committed(&self) -> Option<u64> {
        match self {
            PipelineError::EmptyDataset { .. } | PipelineError::SchemaDeclaration { .. } => Some(0),
            PipelineError::Append { rows_committed, .. }
            | PipelineError::SchemaMismatch { rows_committed, .. } => Some(*rows_committed),
            PipelineError::Source { .. } | PipelineError::Close(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Destination table or object name
    pub target: String,
    pub write_policy: WritePolicy,
}

impl PipelineConfig {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            write_policy: WritePolicy::Replace,
        }
    }

    pub fn with_write_policy(mut self, write_policy: WritePolicy) -> Self {
        self.write_policy = write_policy;
        self
    }
}

/// Timing of one appended batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    /// Zero-based position in the run
    pub index: usize,
    pub rows: usize,
    /// Offset of the append from the start of the run
    pub started_at: Duration,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub target: String,
    pub total_rows: u64,
    pub elapsed: Duration,
    pub batches: Vec<BatchReport>,
}

impl RunReport {
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.iter().map(|b| b.rows).collect()
    }
}

/// Mutable state of one run
struct RunState {
    started: Instant,
    batch_index: usize,
    rows_committed: u64,
    exhausted: bool,
    batches: Vec<BatchReport>,
}

impl RunState {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            batch_index: 0,
            rows_committed: 0,
            exhausted: false,
            batches: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run to completion, closing the sink on every path
    pub async fn run<S, K>(&self, source: &mut S, sink: &mut K) -> Result<RunReport, PipelineError>
    where
        S: Source + ?Sized,
        K: Sink + ?Sized,
    {
        let mut state = RunState::new();
        let result = self.drive(source, sink, &mut state).await;

        let outcome = if result.is_ok() {
            RunOutcome::Completed
        } else {
            RunOutcome::Failed
        };
        let closed = sink.close(outcome).await;

        match (result, closed) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(_), Err(e)) => Err(PipelineError::Close(e)),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(close_err)) => {
                warn!("{} sink also failed to close: {}", sink.name(), close_err);
                Err(e)
            },
        }
    }

    async fn drive<S, K>(
        &self,
        source: &mut S,
        sink: &mut K,
        state: &mut RunState,
    ) -> Result<RunReport, PipelineError>
    where
        S: Source + ?Sized,
        K: Sink + ?Sized,
    {
        let target = self.config.target.as_str();

        let first = pull(source, state)?.ok_or_else(|| PipelineError::EmptyDataset {
            target: target.to_string(),
        })?;

        sink.declare_schema(target, first.schema(), self.config.write_policy)
            .await
            .map_err(|e| PipelineError::SchemaDeclaration {
                target: target.to_string(),
                source: e,
            })?;

        info!(
            "Created schema for {} in {} sink ({}). Commencing data loading...",
            target,
            sink.name(),
            self.config.write_policy
        );

        let mut next = Some(first);
        while let Some(batch) = next {
            let rows = batch.num_rows();
            let started_at = state.started.elapsed();
            let timer = Instant::now();

            if let Err(e) = sink.append_batch(target, &batch).await {
                return Err(append_error(state, e));
            }

            let elapsed = timer.elapsed();
            info!("{} rows inserted in {:.3}s", rows, elapsed.as_secs_f64());

            state.batches.push(BatchReport {
                index: state.batch_index,
                rows,
                started_at,
                elapsed,
            });
            state.rows_committed += rows as u64;
            state.batch_index += 1;

            drop(batch);
            next = pull(source, state)?;
        }

        let elapsed = state.started.elapsed();
        info!(
            "Finished ingesting {} rows in {} batches into {} ({:.3}s)",
            state.rows_committed,
            state.batches.len(),
            target,
            elapsed.as_secs_f64()
        );

        Ok(RunReport {
            target: target.to_string(),
            total_rows: state.rows_committed,
            elapsed,
            batches: std::mem::take(&mut state.batches),
        })
    }
}

fn pull<S: Source + ?Sized>(
    source: &mut S,
    state: &mut RunState,
) -> Result<Option<Batch>, PipelineError> {
    if state.exhausted {
        return Ok(None);
    }
    match source.next_batch() {
        Ok(Some(batch)) => Ok(Some(batch)),
        Ok(None) => {
            state.exhausted = true;
            Ok(None)
        },
        Err(e) => Err(PipelineError::Source {
            batch_index: state.batch_index,
            source: e,
        }),
    }
}

fn append_error(state: &RunState, source: SinkError) -> PipelineError {
    match source {
        SinkError::SchemaMismatch { .. } => PipelineError::SchemaMismatch {
            batch_index: state.batch_index,
            rows_committed: state.rows_committed,
            source,
        },
        source => PipelineError::Append {
            batch_index: state.batch_index,
            rows_committed: state.rows_committed,
            source,
        },
    }
}
