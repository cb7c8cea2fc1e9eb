//! In-memory batches of rows
//!
//! A [`Batch`] is the unit of transfer between a source and a sink: a bounded
//! chunk of rows that all share one [`Schema`]. Batches are validated on
//! construction so sinks can trust every value matches its column type.

pub mod arrow;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Column data types understood by every source and sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Boolean,
    BigInt,
    Double,
    Text,
    Timestamp,
    Date,
}

impl ColumnType {
    /// PostgreSQL column type used when declaring a table
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::BigInt => "BIGINT",
            ColumnType::Double => "DOUBLE PRECISION",
            ColumnType::Text => "TEXT",
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::Date => "DATE",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Boolean => "boolean",
            ColumnType::BigInt => "bigint",
            ColumnType::Double => "double",
            ColumnType::Text => "text",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Date => "date",
        };
        f.write_str(name)
    }
}

/// A single named, typed column
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Ordered column set shared by every batch of a run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Position of the column called `name`
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Copy of this schema with one column's type replaced
    pub fn with_column_type(&self, index: usize, data_type: ColumnType) -> Schema {
        let mut columns = self.columns.clone();
        if let Some(column) = columns.get_mut(index) {
            column.data_type = data_type;
        }
        Schema { columns }
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{} {}", c.name, c.data_type))
            .collect();
        write!(f, "({})", parts.join(", "))
    }
}

/// A single cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(NaiveDateTime),
    Date(NaiveDate),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Whether this value may be stored in a column of `data_type`
    ///
    /// Null fits every column.
    pub fn fits(&self, data_type: ColumnType) -> bool {
        matches!(
            (self, data_type),
            (Value::Null, _)
                | (Value::Bool(_), ColumnType::Boolean)
                | (Value::Int(_), ColumnType::BigInt)
                | (Value::Float(_), ColumnType::Double)
                | (Value::Text(_), ColumnType::Text)
                | (Value::Timestamp(_), ColumnType::Timestamp)
                | (Value::Date(_), ColumnType::Date)
        )
    }

    /// Numeric view used by the passenger-count transforms
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(v) => f.write_str(v),
            Value::Timestamp(v) => write!(f, "{}", v),
            Value::Date(v) => write!(f, "{}", v),
        }
    }
}

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// Parse the datetime layouts found in trip record files
///
/// Accepts `2021-01-01 00:30:10`, an ISO `T` separator, and optional
/// fractional seconds. A bare date is read as midnight.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .or_else(|| parse_date(raw).and_then(|d| d.and_hms_opt(0, 0, 0)))
}

/// Parse an ISO `YYYY-MM-DD` date
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

/// Errors raised while assembling a batch
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("Row {row} has {actual} values but the schema has {expected} columns")]
    RowWidth {
        row: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Row {row}, column '{column}': value {value} is not a {expected}")]
    ValueType {
        row: usize,
        column: String,
        expected: ColumnType,
        value: String,
    },

    #[error("Arrow conversion failed: {0}")]
    Arrow(#[from] ::arrow::error::ArrowError),

    #[error("Unsupported Arrow type for column '{column}': {data_type}")]
    UnsupportedArrowType { column: String, data_type: String },
}

/// Ordered, finite table of rows sharing one schema
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    schema: Arc<Schema>,
    rows: Vec<Vec<Value>>,
}

impl Batch {
    /// Build a batch, checking every row against the schema
    pub fn try_new(schema: Arc<Schema>, rows: Vec<Vec<Value>>) -> Result<Self, BatchError> {
        for (row_idx, row) in rows.iter().enumerate() {
            if row.len() != schema.len() {
                return Err(BatchError::RowWidth {
                    row: row_idx,
                    expected: schema.len(),
                    actual: row.len(),
                });
            }

            for (value, column) in row.iter().zip(schema.columns()) {
                if !value.fits(column.data_type) {
                    return Err(BatchError::ValueType {
                        row: row_idx,
                        column: column.name.clone(),
                        expected: column.data_type,
                        value: format!("{:?}", value),
                    });
                }
            }
        }

        Ok(Self { schema, rows })
    }

    /// Zero-row batch carrying only a schema
    pub fn empty(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            rows: Vec::new(),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn schema_ref(&self) -> Arc<Schema> {
        Arc::clone(&self.schema)
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn into_parts(self) -> (Arc<Schema>, Vec<Vec<Value>>) {
        (self.schema, self.rows)
    }

    /// Values of one column, top to bottom
    pub fn column_values(&self, index: usize) -> impl Iterator<Item = &Value> + '_ {
        self.rows.iter().filter_map(move |row| row.get(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trip_schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Column::new("VendorID", ColumnType::BigInt),
            Column::new("fare_amount", ColumnType::Double),
            Column::new("store_and_fwd_flag", ColumnType::Text),
        ]))
    }

    #[test]
    fn test_batch_accepts_matching_rows_and_nulls() {
        let batch = Batch::try_new(
            trip_schema(),
            vec![
                vec![Value::Int(1), Value::Float(7.5), Value::Text("N".into())],
                vec![Value::Null, Value::Null, Value::Null],
            ],
        )
        .unwrap();

        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.schema().index_of("fare_amount"), Some(1));
        let vendors: Vec<&Value> = batch.column_values(0).collect();
        assert_eq!(vendors, vec![&Value::Int(1), &Value::Null]);
    }

    #[test]
    fn test_batch_rejects_short_row() {
        let err = Batch::try_new(trip_schema(), vec![vec![Value::Int(1)]]).unwrap_err();
        assert!(matches!(
            err,
            BatchError::RowWidth {
                row: 0,
                expected: 3,
                actual: 1
            }
        ));
    }

    #[test]
    fn test_batch_rejects_mistyped_value() {
        let err = Batch::try_new(
            trip_schema(),
            vec![vec![Value::Text("1".into()), Value::Float(1.0), Value::Null]],
        )
        .unwrap_err();

        match err {
            BatchError::ValueType { column, expected, .. } => {
                assert_eq!(column, "VendorID");
                assert_eq!(expected, ColumnType::BigInt);
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_parse_timestamp_layouts() {
        let expected = NaiveDate::from_ymd_opt(2021, 1, 1)
            .unwrap()
            .and_hms_opt(0, 30, 10)
            .unwrap();
        assert_eq!(parse_timestamp("2021-01-01 00:30:10"), Some(expected));
        assert_eq!(parse_timestamp("2021-01-01T00:30:10"), Some(expected));
        assert_eq!(parse_timestamp(" 2021-01-01 00:30:10.000 "), Some(expected));
        assert_eq!(
            parse_timestamp("2021-01-01"),
            NaiveDate::from_ymd_opt(2021, 1, 1).unwrap().and_hms_opt(0, 0, 0)
        );
        assert_eq!(parse_timestamp("01/01/2021 00:30"), None);
    }

    #[test]
    fn test_schema_display_and_retype() {
        let schema = trip_schema();
        assert_eq!(
            schema.to_string(),
            "(VendorID bigint, fare_amount double, store_and_fwd_flag text)"
        );

        let retyped = schema.with_column_type(2, ColumnType::Boolean);
        assert_eq!(retyped.columns()[2].data_type, ColumnType::Boolean);
        assert_eq!(schema.columns()[2].data_type, ColumnType::Text);
    }
}
