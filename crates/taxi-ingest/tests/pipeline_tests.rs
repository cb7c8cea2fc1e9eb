//! Pipeline behavior against in-memory sources and sinks
//!
//! These tests cover:
//! - Batch boundaries and row totals
//! - Schema bootstrap from the first batch
//! - Failure handling (empty input, append failure, schema mismatch, close)
//! - Replace and append re-runs
//! - CSV input through the transform chain
//! - Progress lines written to the log

use async_trait::async_trait;
use std::io::Write;
use std::sync::{Arc, Mutex};
use taxi_ingest::batch::{Batch, Column, ColumnType, Schema, Value};
use taxi_ingest::pipeline::{Pipeline, PipelineConfig, PipelineError};
use taxi_ingest::sink::{MemorySink, RunOutcome, Sink, SinkError, WritePolicy};
use taxi_ingest::source::{CsvSource, MemorySource, Source, SourceError, SourceOptions};
use taxi_ingest::transform::{DropZeroPassengers, ParseDatetimes, TransformChain, TransformedSource};

// ============================================================================
// Helpers
// ============================================================================

fn trip_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Column::new("VendorID", ColumnType::BigInt),
        Column::new("trip_distance", ColumnType::Double),
    ]))
}

/// Generates `total` rows in batches of `batch_size`, counting pulls
struct CountingSource {
    schema: Arc<Schema>,
    total: usize,
    batch_size: usize,
    produced: usize,
    pulls: usize,
}

impl CountingSource {
    fn new(total: usize, batch_size: usize) -> Self {
        Self {
            schema: trip_schema(),
            total,
            batch_size,
            produced: 0,
            pulls: 0,
        }
    }
}

impl Source for CountingSource {
    fn next_batch(&mut self) -> Result<Option<Batch>, SourceError> {
        self.pulls += 1;
        if self.produced >= self.total {
            return Ok(None);
        }

        let rows = self.batch_size.min(self.total - self.produced);
        let values = (self.produced..self.produced + rows)
            .map(|i| vec![Value::Int(i as i64), Value::Float(1.5)])
            .collect();
        self.produced += rows;
        Ok(Some(Batch::try_new(self.schema.clone(), values)?))
    }
}

/// Memory sink that records calls and can fail on demand
#[derive(Default)]
struct RecordingSink {
    inner: MemorySink,
    declares: usize,
    fail_on_append: Option<usize>,
    fail_close: bool,
}

impl RecordingSink {
    fn failing_on(append: usize) -> Self {
        Self {
            fail_on_append: Some(append),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Sink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn declare_schema(
        &mut self,
        target: &str,
        schema: &Schema,
        policy: WritePolicy,
    ) -> Result<(), SinkError> {
        self.declares += 1;
        self.inner.declare_schema(target, schema, policy).await
    }

    async fn append_batch(&mut self, target: &str, batch: &Batch) -> Result<(), SinkError> {
        if self.fail_on_append == Some(self.inner.appends().len()) {
            return Err(SinkError::Io(std::io::Error::other("connection reset")));
        }
        self.inner.append_batch(target, batch).await
    }

    async fn close(&mut self, outcome: RunOutcome) -> Result<(), SinkError> {
        self.inner.close(outcome).await?;
        if self.fail_close {
            return Err(SinkError::Io(std::io::Error::other("flush failed")));
        }
        Ok(())
    }
}

fn pipeline(target: &str) -> Pipeline {
    Pipeline::new(PipelineConfig::new(target))
}

// ============================================================================
// Batching
// ============================================================================

#[tokio::test]
async fn test_batches_follow_batch_size() {
    let mut source = CountingSource::new(250_000, 100_000);
    let mut sink = RecordingSink::default();

    let report = pipeline("yellow_taxi_data").run(&mut source, &mut sink).await.unwrap();

    assert_eq!(report.batch_sizes(), vec![100_000, 100_000, 50_000]);
    assert_eq!(report.total_rows, 250_000);
    assert_eq!(sink.inner.row_count("yellow_taxi_data"), 250_000);
    assert_eq!(sink.declares, 1);
    assert_eq!(sink.inner.closed(), &[RunOutcome::Completed]);
}

#[tokio::test]
async fn test_append_count_is_ceiling_of_rows_over_batch_size() {
    for (total, batch_size) in [(1, 1), (10, 3), (9, 3), (7, 100)] {
        let mut source = CountingSource::new(total, batch_size);
        let mut sink = MemorySink::new();

        let report = pipeline("trips").run(&mut source, &mut sink).await.unwrap();

        assert_eq!(report.batches.len(), total.div_ceil(batch_size));
        assert_eq!(report.batch_sizes().iter().sum::<usize>(), total);
        assert_eq!(sink.row_count("trips"), total);
    }
}

#[tokio::test]
async fn test_rows_arrive_in_source_order() {
    let mut source = CountingSource::new(25, 10);
    let mut sink = MemorySink::new();

    pipeline("trips").run(&mut source, &mut sink).await.unwrap();

    let ids: Vec<_> = sink.table("trips").unwrap().rows.iter().map(|r| r[0].clone()).collect();
    let expected: Vec<_> = (0..25).map(Value::Int).collect();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn test_declared_schema_is_first_batch_schema() {
    let mut source = CountingSource::new(5, 2);
    let mut sink = MemorySink::new();

    pipeline("trips").run(&mut source, &mut sink).await.unwrap();

    assert_eq!(sink.table("trips").unwrap().schema, *trip_schema());
}

#[tokio::test]
async fn test_batch_timings_are_ordered() {
    let mut source = CountingSource::new(50, 10);
    let mut sink = MemorySink::new();

    let report = pipeline("trips").run(&mut source, &mut sink).await.unwrap();

    let starts: Vec<_> = report.batches.iter().map(|b| b.started_at).collect();
    assert!(starts.windows(2).all(|w| w[0] <= w[1]));
    let indices: Vec<_> = report.batches.iter().map(|b| b.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    assert!(report.batches.iter().all(|b| b.started_at <= report.elapsed));
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_empty_source_never_touches_sink() {
    let mut source = CountingSource::new(0, 100);
    let mut sink = RecordingSink::default();

    let err = pipeline("trips").run(&mut source, &mut sink).await.unwrap_err();

    assert!(matches!(err, PipelineError::EmptyDataset { ref target } if target == "trips"));
    assert_eq!(err.rows_committed(), Some(0));
    assert_eq!(sink.declares, 0);
    assert!(sink.inner.appends().is_empty());
    assert!(sink.inner.table("trips").is_none());
    assert_eq!(sink.inner.closed(), &[RunOutcome::Failed]);
}

#[tokio::test]
async fn test_append_failure_stops_the_run() {
    let mut source = CountingSource::new(250_000, 100_000);
    let mut sink = RecordingSink::failing_on(1);

    let err = pipeline("trips").run(&mut source, &mut sink).await.unwrap_err();

    match err {
        PipelineError::Append {
            batch_index,
            rows_committed,
            ..
        } => {
            assert_eq!(batch_index, 1);
            assert_eq!(rows_committed, 100_000);
        },
        other => panic!("expected append failure, got {:?}", other),
    }
    assert_eq!(sink.inner.row_count("trips"), 100_000);
    // third batch never pulled
    assert_eq!(source.pulls, 2);
    assert_eq!(source.produced, 200_000);
    assert_eq!(sink.inner.closed(), &[RunOutcome::Failed]);
}

#[tokio::test]
async fn test_mismatched_batch_is_rejected() {
    let other_schema = Arc::new(Schema::new(vec![Column::new("VendorID", ColumnType::Text)]));
    let first = Batch::try_new(trip_schema(), vec![vec![Value::Int(1), Value::Float(2.0)]]).unwrap();
    let second = Batch::try_new(other_schema, vec![vec![Value::Text("2".into())]]).unwrap();

    let mut source = MemorySource::new([first, second]);
    let mut sink = MemorySink::new();

    let err = pipeline("trips").run(&mut source, &mut sink).await.unwrap_err();

    assert!(matches!(
        err,
        PipelineError::SchemaMismatch {
            batch_index: 1,
            rows_committed: 1,
            ..
        }
    ));
    assert_eq!(sink.row_count("trips"), 1);
}

#[tokio::test]
async fn test_source_error_carries_batch_index() {
    let csv = "VendorID,passenger_count\n1,1\n2,2\n3,oops\n";
    let mut source = CsvSource::from_reader(csv.as_bytes(), SourceOptions::with_batch_size(2)).unwrap();
    let mut sink = MemorySink::new();

    let err = pipeline("trips").run(&mut source, &mut sink).await.unwrap_err();

    assert!(matches!(err, PipelineError::Source { batch_index: 1, .. }));
    assert_eq!(sink.row_count("trips"), 2);
    assert_eq!(sink.closed(), &[RunOutcome::Failed]);
}

#[tokio::test]
async fn test_close_failure_after_success_is_an_error() {
    let mut source = CountingSource::new(10, 5);
    let mut sink = RecordingSink {
        fail_close: true,
        ..Default::default()
    };

    let err = pipeline("trips").run(&mut source, &mut sink).await.unwrap_err();

    assert!(matches!(err, PipelineError::Close(_)));
    assert_eq!(sink.inner.closed(), &[RunOutcome::Completed]);
}

#[tokio::test]
async fn test_close_failure_after_failure_keeps_original_error() {
    let mut source = CountingSource::new(0, 5);
    let mut sink = RecordingSink {
        fail_close: true,
        ..Default::default()
    };

    let err = pipeline("trips").run(&mut source, &mut sink).await.unwrap_err();

    assert!(matches!(err, PipelineError::EmptyDataset { .. }));
}

// ============================================================================
// Re-runs
// ============================================================================

#[tokio::test]
async fn test_replace_reruns_keep_one_copy() {
    let mut sink = MemorySink::new();
    let pipeline = pipeline("trips");

    for _ in 0..2 {
        let mut source = CountingSource::new(30, 7);
        pipeline.run(&mut source, &mut sink).await.unwrap();
        assert_eq!(sink.row_count("trips"), 30);
    }
}

#[tokio::test]
async fn test_append_reruns_accumulate() {
    let mut sink = MemorySink::new();
    let pipeline = Pipeline::new(PipelineConfig::new("trips").with_write_policy(WritePolicy::Append));

    for _ in 0..2 {
        let mut source = CountingSource::new(30, 7);
        pipeline.run(&mut source, &mut sink).await.unwrap();
    }
    assert_eq!(sink.row_count("trips"), 60);
    assert_eq!(sink.closed(), &[RunOutcome::Completed, RunOutcome::Completed]);
}

// ============================================================================
// Transforms
// ============================================================================

#[tokio::test]
async fn test_csv_through_transforms() {
    let csv = "\
VendorID,tpep_pickup_datetime,tpep_dropoff_datetime,passenger_count,trip_distance
1,2021-01-01 00:30:10,2021-01-01 00:36:12,1,2.10
1,2021-01-01 00:51:20,2021-01-01 00:52:19,0,0.20
2,2021-01-01 00:43:30,2021-01-01 01:11:06,,14.70
2,2021-01-01 00:15:48,2021-01-01 00:31:01,2,10.60
";
    let source = CsvSource::from_reader(csv.as_bytes(), SourceOptions::with_batch_size(3)).unwrap();
    let chain = TransformChain::new()
        .with(ParseDatetimes::by_suffix("_datetime"))
        .with(DropZeroPassengers);
    let mut source = TransformedSource::new(source, chain);
    let mut sink = MemorySink::new();

    let report = pipeline("trips").run(&mut source, &mut sink).await.unwrap();

    assert_eq!(report.total_rows, 3);
    assert_eq!(report.batch_sizes(), vec![2, 1]);

    let table = sink.table("trips").unwrap();
    assert_eq!(
        table.schema.column("tpep_pickup_datetime").unwrap().data_type,
        ColumnType::Timestamp
    );
    assert_eq!(table.schema.column("passenger_count").unwrap().data_type, ColumnType::BigInt);
    assert!(table.rows[1][3].is_null());
}

#[tokio::test]
async fn test_csv_file_schema_does_not_depend_on_batch_size() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tolls.csv");
    // the first decimal toll only shows up after two integer-looking rows
    std::fs::write(&path, "VendorID,tolls_amount\n1,0\n2,0\n1,6.12\n2,0\n").unwrap();

    let mut runs = Vec::new();
    for batch_size in [2, 100] {
        let mut source = CsvSource::open(&path, SourceOptions::with_batch_size(batch_size)).unwrap();
        let mut sink = MemorySink::new();

        let report = pipeline("tolls").run(&mut source, &mut sink).await.unwrap();

        let table = sink.table("tolls").unwrap();
        runs.push((table.schema.clone(), report.total_rows, table.rows.clone()));
    }

    assert_eq!(runs[0], runs[1]);
    let (schema, total_rows, rows) = &runs[0];
    assert_eq!(*total_rows, 4);
    assert_eq!(schema.column("tolls_amount").unwrap().data_type, ColumnType::Double);
    assert_eq!(rows[2][1], Value::Float(6.12));
}

// ============================================================================
// Logging
// ============================================================================

/// Formatted log output shared with the subscriber under test
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_progress_lines_are_logged() {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::INFO)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let mut source = CountingSource::new(5, 2);
    let mut sink = MemorySink::new();
    pipeline("trips").run(&mut source, &mut sink).await.unwrap();

    let output = logs.contents();
    let inserted: Vec<&str> = output.lines().filter(|l| l.contains(" rows inserted in ")).collect();
    assert_eq!(inserted.len(), 3, "{output}");
    assert!(inserted[0].contains("2 rows inserted in "));
    assert!(inserted[2].contains("1 rows inserted in "));
    assert!(inserted.iter().all(|l| l.trim_end().ends_with('s')));
    assert!(
        output.contains("Finished ingesting 5 rows in 3 batches into trips ("),
        "{output}"
    );
}
