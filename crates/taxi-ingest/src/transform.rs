//! Row-level cleaning between a source and the pipeline
//!
//! Transforms are applied batch by batch through [`TransformedSource`], so the
//! pipeline never sees the untransformed rows. Each transform maps a schema to
//! a fixed output schema, which keeps every batch of a run identically typed.

use crate::batch::{parse_timestamp, Batch, ColumnType, Schema, Value};
use crate::source::{Source, SourceError};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// Column cleaned by the passenger transforms
pub const PASSENGER_COUNT: &str = "passenger_count";

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("Column '{0}' not found in batch")]
    MissingColumn(String),

    #[error("Column '{column}': cannot convert '{value}' to {expected}")]
    Value {
        column: String,
        value: String,
        expected: ColumnType,
    },

    #[error("Column '{column}' has type {found}, {transform} needs {expected}")]
    ColumnType {
        transform: &'static str,
        column: String,
        found: ColumnType,
        expected: &'static str,
    },

    #[error("Invalid batch after transform: {0}")]
    Batch(#[from] crate::batch::BatchError),
}

/// One cleaning step
pub trait Transform: Send {
    fn name(&self) -> &'static str;

    fn apply(&self, batch: Batch) -> Result<Batch, TransformError>;
}

fn column_index(schema: &Schema, name: &str) -> Result<usize, TransformError> {
    schema
        .index_of(name)
        .ok_or_else(|| TransformError::MissingColumn(name.to_string()))
}

// ============================================================================
// Datetime parsing
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum DatetimeColumns {
    /// These columns, each of which must exist
    Named(Vec<String>),
    /// Every text column whose name ends with the suffix
    Suffix(String),
}

/// Converts text columns to timestamps
#[derive(Debug, Clone)]
pub struct ParseDatetimes {
    columns: DatetimeColumns,
}

impl ParseDatetimes {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: DatetimeColumns::Named(columns.into_iter().map(Into::into).collect()),
        }
    }

    /// Parse every text column named `*{suffix}`, e.g. `_datetime`
    pub fn by_suffix(suffix: impl Into<String>) -> Self {
        Self {
            columns: DatetimeColumns::Suffix(suffix.into()),
        }
    }

    fn target_columns(&self, schema: &Schema) -> Result<Vec<usize>, TransformError> {
        match &self.columns {
            DatetimeColumns::Named(names) => names
                .iter()
                .map(|name| {
                    let index = column_index(schema, name)?;
                    match schema.columns()[index].data_type {
                        ColumnType::Text | ColumnType::Timestamp => Ok(index),
                        found => Err(TransformError::ColumnType {
                            transform: "parse_datetimes",
                            column: name.clone(),
                            found,
                            expected: "text or timestamp",
                        }),
                    }
                })
                .collect(),
            DatetimeColumns::Suffix(suffix) => Ok(schema
                .columns()
                .iter()
                .enumerate()
                .filter(|(_, c)| c.name.ends_with(suffix.as_str()))
                .map(|(index, _)| index)
                .collect()),
        }
    }
}

impl Transform for ParseDatetimes {
    fn name(&self) -> &'static str {
        "parse_datetimes"
    }

    fn apply(&self, batch: Batch) -> Result<Batch, TransformError> {
        let (schema, mut rows) = batch.into_parts();

        let mut output = (*schema).clone();
        let mut targets = Vec::new();
        for index in self.target_columns(&schema)? {
            if schema.columns()[index].data_type == ColumnType::Text {
                output = output.with_column_type(index, ColumnType::Timestamp);
                targets.push(index);
            }
        }
        if targets.is_empty() {
            return Ok(Batch::try_new(schema, rows)?);
        }

        for row in rows.iter_mut() {
            for &index in &targets {
                let parsed = match &row[index] {
                    Value::Text(raw) => match parse_timestamp(raw) {
                        Some(ts) => Value::Timestamp(ts),
                        None => {
                            return Err(TransformError::Value {
                                column: schema.columns()[index].name.clone(),
                                value: raw.clone(),
                                expected: ColumnType::Timestamp,
                            })
                        },
                    },
                    _ => Value::Null,
                };
                row[index] = parsed;
            }
        }

        Ok(Batch::try_new(Arc::new(output), rows)?)
    }
}

// ============================================================================
// Passenger count cleaning
// ============================================================================

fn passenger_index(schema: &Schema, transform: &'static str) -> Result<usize, TransformError> {
    let index = column_index(schema, PASSENGER_COUNT)?;
    match schema.columns()[index].data_type {
        ColumnType::BigInt | ColumnType::Double => Ok(index),
        found => Err(TransformError::ColumnType {
            transform,
            column: PASSENGER_COUNT.to_string(),
            found,
            expected: "a numeric column",
        }),
    }
}

fn is_zero(value: &Value) -> bool {
    value.as_f64() == Some(0.0)
}

/// Removes rides with zero passengers; rows with no count are kept
#[derive(Debug, Clone, Copy, Default)]
pub struct DropZeroPassengers;

impl Transform for DropZeroPassengers {
    fn name(&self) -> &'static str {
        "drop_zero_passengers"
    }

    fn apply(&self, batch: Batch) -> Result<Batch, TransformError> {
        let index = passenger_index(batch.schema(), self.name())?;
        let (schema, rows) = batch.into_parts();

        let before = rows.iter().filter(|row| is_zero(&row[index])).count();
        let kept: Vec<Vec<Value>> = rows.into_iter().filter(|row| !is_zero(&row[index])).collect();
        let after = kept.iter().filter(|row| is_zero(&row[index])).count();

        info!("Pre-cleaning count of records with zero passengers: {}", before);
        info!("Post-cleaning count of records with zero passengers: {}", after);

        Ok(Batch::try_new(schema, kept)?)
    }
}

/// Replaces a missing passenger count with zero
#[derive(Debug, Clone, Copy, Default)]
pub struct FillMissingPassengerCount;

impl Transform for FillMissingPassengerCount {
    fn name(&self) -> &'static str {
        "fill_missing_passenger_count"
    }

    fn apply(&self, batch: Batch) -> Result<Batch, TransformError> {
        let index = passenger_index(batch.schema(), self.name())?;
        let zero = match batch.schema().columns()[index].data_type {
            ColumnType::Double => Value::Float(0.0),
            _ => Value::Int(0),
        };
        let (schema, mut rows) = batch.into_parts();

        let before = rows.iter().filter(|row| row[index].is_null()).count();
        for row in rows.iter_mut().filter(|row| row[index].is_null()) {
            row[index] = zero.clone();
        }
        let after = rows.iter().filter(|row| row[index].is_null()).count();

        info!("Pre-cleaning: {} records without passenger count", before);
        info!("Post-cleaning: {} records without passenger count", after);

        Ok(Batch::try_new(schema, rows)?)
    }
}

/// How to treat the passenger count before loading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum PassengerPolicy {
    /// Load rows unchanged
    #[default]
    Keep,
    /// Drop rides with zero passengers
    DropZero,
    /// Fill missing counts with zero
    FillMissing,
}

impl PassengerPolicy {
    pub fn transform(self) -> Option<Box<dyn Transform>> {
        match self {
            PassengerPolicy::Keep => None,
            PassengerPolicy::DropZero => Some(Box::new(DropZeroPassengers)),
            PassengerPolicy::FillMissing => Some(Box::new(FillMissingPassengerCount)),
        }
    }
}

impl fmt::Display for PassengerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PassengerPolicy::Keep => write!(f, "keep"),
            PassengerPolicy::DropZero => write!(f, "drop-zero"),
            PassengerPolicy::FillMissing => write!(f, "fill-missing"),
        }
    }
}

impl FromStr for PassengerPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "keep" => Ok(PassengerPolicy::Keep),
            "drop-zero" | "drop_zero" => Ok(PassengerPolicy::DropZero),
            "fill-missing" | "fill_missing" => Ok(PassengerPolicy::FillMissing),
            _ => Err(format!("Invalid passenger policy: {}", s)),
        }
    }
}

// ============================================================================
// Chaining
// ============================================================================

/// Ordered list of transforms applied one after another
#[derive(Default)]
pub struct TransformChain {
    transforms: Vec<Box<dyn Transform>>,
}

impl TransformChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, transform: impl Transform + 'static) -> Self {
        self.transforms.push(Box::new(transform));
        self
    }

    pub fn push(&mut self, transform: Box<dyn Transform>) {
        self.transforms.push(transform);
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.transforms.iter().map(|t| t.name()).collect()
    }

    pub fn apply(&self, batch: Batch) -> Result<Batch, TransformError> {
        self.transforms
            .iter()
            .try_fold(batch, |batch, transform| transform.apply(batch))
    }
}

impl fmt::Debug for TransformChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformChain")
            .field("transforms", &self.names())
            .finish()
    }
}

/// A source whose batches pass through a transform chain
pub struct TransformedSource<S> {
    inner: S,
    chain: TransformChain,
}

impl<S: Source> TransformedSource<S> {
    pub fn new(inner: S, chain: TransformChain) -> Self {
        Self { inner, chain }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Source> Source for TransformedSource<S> {
    fn next_batch(&mut self) -> Result<Option<Batch>, SourceError> {
        match self.inner.next_batch()? {
            Some(batch) => Ok(Some(self.chain.apply(batch)?)),
            None => Ok(None),
        }
    }
}
