//! CSV source (plain or gzip-compressed)
//!
//! Files opened from disk are scanned once up front so column types reflect
//! every row, then read again in batches. Sources built over an arbitrary
//! reader cannot rewind and infer from their first batch instead. Either way
//! the schema is fixed before the first batch is returned, and a later value
//! that does not fit its column is an error rather than a silent coercion.

use super::{DatasetFormat, Source, SourceError, SourceOptions};
use crate::batch::{parse_date, parse_timestamp, Batch, Column, ColumnType, Schema, Value};
use ::csv::{ReaderBuilder, StringRecord};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

type BoxedReader = Box<dyn Read + Send>;

/// Reads a headered CSV file in batches
pub struct CsvSource {
    reader: ::csv::Reader<BoxedReader>,
    headers: Vec<String>,
    schema: Option<Arc<Schema>>,
    batch_size: usize,
    records_read: u64,
}

impl CsvSource {
    /// Open a `.csv` or `.csv.gz` file, inferring column types from all of it
    pub fn open(path: &Path, options: SourceOptions) -> Result<Self, SourceError> {
        let (schema, records) = scan_schema(open_reader(path)?)?;
        match &schema {
            Some(schema) => info!("Inferred CSV schema from {} records: {}", records, schema),
            None => debug!("{} has a header but no records", path.display()),
        }

        let mut source = Self::from_reader(open_reader(path)?, options)?;
        source.schema = schema.map(Arc::new);
        Ok(source)
    }

    /// Read CSV text from any reader; the first record is the header
    ///
    /// Column types come from the first batch.
    pub fn from_reader<R: Read + Send + 'static>(
        reader: R,
        options: SourceOptions,
    ) -> Result<Self, SourceError> {
        let mut reader = csv_reader(Box::new(reader));
        let headers = read_headers(&mut reader)?;

        debug!("CSV header: {:?}", headers);

        Ok(Self {
            reader,
            headers,
            schema: None,
            batch_size: options.batch_size.max(1),
            records_read: 0,
        })
    }

    /// Schema of every batch, once known
    pub fn schema(&self) -> Option<&Schema> {
        self.schema.as_deref()
    }

    fn read_records(&mut self) -> Result<Vec<StringRecord>, SourceError> {
        let mut records = Vec::with_capacity(self.batch_size.min(16 * 1024));
        while records.len() < self.batch_size {
            let mut record = StringRecord::new();
            if !self.reader.read_record(&mut record)? {
                break;
            }
            records.push(record);
        }
        Ok(records)
    }
}

fn open_reader(path: &Path) -> Result<BoxedReader, SourceError> {
    let file = BufReader::new(File::open(path)?);
    match DatasetFormat::from_path(path)? {
        DatasetFormat::Csv { gzip: true } => Ok(Box::new(MultiGzDecoder::new(file))),
        DatasetFormat::Csv { gzip: false } => Ok(Box::new(file)),
        DatasetFormat::Parquet => Err(SourceError::UnsupportedFormat(format!(
            "{} is not a CSV file",
            path.display()
        ))),
    }
}

fn csv_reader(reader: BoxedReader) -> ::csv::Reader<BoxedReader> {
    ReaderBuilder::new().has_headers(true).from_reader(reader)
}

fn read_headers(reader: &mut ::csv::Reader<BoxedReader>) -> Result<Vec<String>, SourceError> {
    Ok(reader.headers()?.iter().map(|h| h.trim().to_string()).collect())
}

/// Stream every record once and infer the column types
///
/// Returns the schema (`None` when there are no records) and the number of
/// records seen. Only one record is held at a time.
fn scan_schema(reader: BoxedReader) -> Result<(Option<Schema>, u64), SourceError> {
    let mut reader = csv_reader(reader);
    let headers = read_headers(&mut reader)?;
    let mut votes = vec![TypeVote::default(); headers.len()];

    let mut record = StringRecord::new();
    let mut records = 0u64;
    while reader.read_record(&mut record)? {
        for (vote, raw) in votes.iter_mut().zip(record.iter()) {
            vote.observe(raw);
        }
        records += 1;
    }

    let schema = (records > 0).then(|| {
        Schema::new(
            headers
                .iter()
                .zip(&votes)
                .map(|(name, vote)| Column::new(name.clone(), vote.resolve()))
                .collect(),
        )
    });
    Ok((schema, records))
}

impl Source for CsvSource {
    fn next_batch(&mut self) -> Result<Option<Batch>, SourceError> {
        let records = self.read_records()?;
        if records.is_empty() {
            return Ok(None);
        }

        let schema = match &self.schema {
            Some(schema) => Arc::clone(schema),
            None => {
                let schema = Arc::new(infer_schema(&self.headers, &records));
                info!("Inferred CSV schema: {}", schema);
                self.schema = Some(Arc::clone(&schema));
                schema
            },
        };

        // header occupies line 1
        let first_line = self.records_read + 2;
        let rows = records
            .iter()
            .enumerate()
            .map(|(offset, record)| {
                let line = record
                    .position()
                    .map(|p| p.line())
                    .unwrap_or(first_line + offset as u64);
                parse_record(&schema, record, line)
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.records_read += records.len() as u64;

        Ok(Some(Batch::try_new(schema, rows)?))
    }
}

/// Infer a schema from a sample of records
pub fn infer_schema(headers: &[String], records: &[StringRecord]) -> Schema {
    Schema::new(
        headers
            .iter()
            .enumerate()
            .map(|(index, name)| {
                let values = records.iter().filter_map(|r| r.get(index));
                Column::new(name.clone(), infer_column_type(values))
            })
            .collect(),
    )
}

/// Narrowest type that every non-empty value parses as
///
/// Checked in order boolean, integer, float; anything else (or a column
/// with no values at all) is text.
pub fn infer_column_type<'a>(values: impl Iterator<Item = &'a str>) -> ColumnType {
    let mut vote = TypeVote::default();
    for raw in values {
        vote.observe(raw);
        if vote.is_text() {
            break;
        }
    }
    vote.resolve()
}

/// Which column types are still possible after the values seen so far
#[derive(Debug, Clone, Copy)]
struct TypeVote {
    seen: bool,
    bool_ok: bool,
    int_ok: bool,
    float_ok: bool,
}

impl Default for TypeVote {
    fn default() -> Self {
        Self {
            seen: false,
            bool_ok: true,
            int_ok: true,
            float_ok: true,
        }
    }
}

impl TypeVote {
    fn observe(&mut self, raw: &str) {
        let value = raw.trim();
        if value.is_empty() || self.is_text() {
            return;
        }
        self.seen = true;
        self.bool_ok = self.bool_ok && parse_bool(value).is_some();
        self.int_ok = self.int_ok && value.parse::<i64>().is_ok();
        self.float_ok = self.float_ok && value.parse::<f64>().is_ok();
    }

    fn is_text(&self) -> bool {
        !self.bool_ok && !self.int_ok && !self.float_ok
    }

    fn resolve(&self) -> ColumnType {
        match (self.seen, self.bool_ok, self.int_ok, self.float_ok) {
            (false, _, _, _) => ColumnType::Text,
            (true, true, _, _) => ColumnType::Boolean,
            (true, _, true, _) => ColumnType::BigInt,
            (true, _, _, true) => ColumnType::Double,
            _ => ColumnType::Text,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("true") {
        Some(true)
    } else if value.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

/// Parse one raw field as `data_type`; empty fields are null
pub fn parse_field(raw: &str, data_type: ColumnType) -> Option<Value> {
    let value = raw.trim();
    if value.is_empty() {
        return Some(Value::Null);
    }

    match data_type {
        ColumnType::Boolean => parse_bool(value).map(Value::Bool),
        ColumnType::BigInt => value.parse().ok().map(Value::Int),
        ColumnType::Double => value.parse().ok().map(Value::Float),
        ColumnType::Text => Some(Value::Text(raw.to_string())),
        ColumnType::Timestamp => parse_timestamp(value).map(Value::Timestamp),
        ColumnType::Date => parse_date(value).map(Value::Date),
    }
}

fn parse_record(schema: &Schema, record: &StringRecord, line: u64) -> Result<Vec<Value>, SourceError> {
    schema
        .columns()
        .iter()
        .enumerate()
        .map(|(index, column)| {
            let raw = record.get(index).unwrap_or("");
            parse_field(raw, column.data_type).ok_or_else(|| SourceError::Parse {
                line,
                column: column.name.clone(),
                value: raw.to_string(),
                expected: column.data_type,
            })
        })
        .collect()
}
