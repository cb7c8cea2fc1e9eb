//! Conversions between [`Batch`] and Arrow record batches
//!
//! Parquet is read and written through Arrow, so both directions are needed:
//! the Parquet source decodes record batches into rows, and the Parquet sink
//! encodes rows back into columns.

use super::{Batch, BatchError, Column, ColumnType, Schema, Value};
use ::arrow::array::{
    Array, ArrayRef, AsArray, BooleanBuilder, Date32Builder, Float64Builder, Int64Builder,
    StringBuilder, TimestampMicrosecondBuilder,
};
use ::arrow::datatypes::{
    ArrowPrimitiveType, ArrowTemporalType, DataType, Date32Type, Date64Type, Field, Float32Type,
    Float64Type, Int16Type, Int32Type, Int64Type, Int8Type, Schema as ArrowSchema, SchemaRef, TimeUnit,
    TimestampMicrosecondType, TimestampMillisecondType, TimestampNanosecondType,
    TimestampSecondType, UInt16Type, UInt32Type, UInt64Type, UInt8Type,
};
use ::arrow::record_batch::RecordBatch;
use ::arrow::util::display::{ArrayFormatter, FormatOptions};
use chrono::{NaiveDate, NaiveDateTime};
use std::sync::Arc;

/// Column type used for an Arrow field
///
/// Types without a native counterpart are carried as text.
pub fn column_type_for(data_type: &DataType) -> ColumnType {
    match data_type {
        DataType::Boolean => ColumnType::Boolean,
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => ColumnType::BigInt,
        DataType::Float32 | DataType::Float64 => ColumnType::Double,
        DataType::Timestamp(_, _) => ColumnType::Timestamp,
        DataType::Date32 | DataType::Date64 => ColumnType::Date,
        _ => ColumnType::Text,
    }
}

/// Row schema for an Arrow schema
pub fn schema_from_arrow(schema: &ArrowSchema) -> Schema {
    Schema::new(
        schema
            .fields()
            .iter()
            .map(|field| Column::new(field.name().clone(), column_type_for(field.data_type())))
            .collect(),
    )
}

/// Arrow schema used when writing batches of `schema`
pub fn to_arrow_schema(schema: &Schema) -> SchemaRef {
    let fields: Vec<Field> = schema
        .columns()
        .iter()
        .map(|column| Field::new(&column.name, arrow_type(column.data_type), true))
        .collect();
    Arc::new(ArrowSchema::new(fields))
}

fn arrow_type(data_type: ColumnType) -> DataType {
    match data_type {
        ColumnType::Boolean => DataType::Boolean,
        ColumnType::BigInt => DataType::Int64,
        ColumnType::Double => DataType::Float64,
        ColumnType::Text => DataType::Utf8,
        ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, None),
        ColumnType::Date => DataType::Date32,
    }
}

/// Decode an Arrow record batch into rows of `schema`
pub fn batch_from_record_batch(
    schema: &Arc<Schema>,
    record: &RecordBatch,
) -> Result<Batch, BatchError> {
    if record.num_columns() != schema.len() {
        return Err(BatchError::RowWidth {
            row: 0,
            expected: schema.len(),
            actual: record.num_columns(),
        });
    }

    let mut rows: Vec<Vec<Value>> = (0..record.num_rows())
        .map(|_| Vec::with_capacity(schema.len()))
        .collect();

    for (index, column) in schema.columns().iter().enumerate() {
        let values = decode_column(record.column(index).as_ref(), column)?;
        for (row, value) in rows.iter_mut().zip(values) {
            row.push(value);
        }
    }

    Batch::try_new(Arc::clone(schema), rows)
}

/// Encode rows into an Arrow record batch with `arrow_schema`
pub fn record_batch_from_batch(
    batch: &Batch,
    arrow_schema: SchemaRef,
) -> Result<RecordBatch, BatchError> {
    let num_rows = batch.num_rows();
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(batch.schema().len());

    for (index, column) in batch.schema().columns().iter().enumerate() {
        let values = batch.column_values(index);
        let array: ArrayRef = match column.data_type {
            ColumnType::Boolean => {
                let mut builder = BooleanBuilder::with_capacity(num_rows);
                for value in values {
                    builder.append_option(match value {
                        Value::Bool(v) => Some(*v),
                        _ => None,
                    });
                }
                Arc::new(builder.finish())
            },
            ColumnType::BigInt => {
                let mut builder = Int64Builder::with_capacity(num_rows);
                for value in values {
                    builder.append_option(match value {
                        Value::Int(v) => Some(*v),
                        _ => None,
                    });
                }
                Arc::new(builder.finish())
            },
            ColumnType::Double => {
                let mut builder = Float64Builder::with_capacity(num_rows);
                for value in values {
                    builder.append_option(match value {
                        Value::Float(v) => Some(*v),
                        _ => None,
                    });
                }
                Arc::new(builder.finish())
            },
            ColumnType::Text => {
                let mut builder = StringBuilder::new();
                for value in values {
                    builder.append_option(match value {
                        Value::Text(v) => Some(v.as_str()),
                        _ => None,
                    });
                }
                Arc::new(builder.finish())
            },
            ColumnType::Timestamp => {
                let mut builder = TimestampMicrosecondBuilder::with_capacity(num_rows);
                for value in values {
                    builder.append_option(match value {
                        Value::Timestamp(v) => Some(v.and_utc().timestamp_micros()),
                        _ => None,
                    });
                }
                Arc::new(builder.finish())
            },
            ColumnType::Date => {
                let mut builder = Date32Builder::with_capacity(num_rows);
                for value in values {
                    builder.append_option(match value {
                        Value::Date(v) => Some(days_since_epoch(*v)),
                        _ => None,
                    });
                }
                Arc::new(builder.finish())
            },
        };
        arrays.push(array);
    }

    Ok(RecordBatch::try_new(arrow_schema, arrays)?)
}

fn days_since_epoch(date: NaiveDate) -> i32 {
    // NaiveDate::default() is 1970-01-01
    date.signed_duration_since(NaiveDate::default()).num_days() as i32
}

fn decode_column(array: &dyn Array, column: &Column) -> Result<Vec<Value>, BatchError> {
    let data_type = array.data_type().clone();
    match (column.data_type, &data_type) {
        (ColumnType::Boolean, DataType::Boolean) => {
            let values = array.as_boolean();
            Ok((0..values.len())
                .map(|i| {
                    if values.is_null(i) {
                        Value::Null
                    } else {
                        Value::Bool(values.value(i))
                    }
                })
                .collect())
        },
        (ColumnType::BigInt, DataType::Int8) => decode_ints::<Int8Type>(array, column),
        (ColumnType::BigInt, DataType::Int16) => decode_ints::<Int16Type>(array, column),
        (ColumnType::BigInt, DataType::Int32) => decode_ints::<Int32Type>(array, column),
        (ColumnType::BigInt, DataType::Int64) => decode_ints::<Int64Type>(array, column),
        (ColumnType::BigInt, DataType::UInt8) => decode_ints::<UInt8Type>(array, column),
        (ColumnType::BigInt, DataType::UInt16) => decode_ints::<UInt16Type>(array, column),
        (ColumnType::BigInt, DataType::UInt32) => decode_ints::<UInt32Type>(array, column),
        (ColumnType::BigInt, DataType::UInt64) => decode_ints::<UInt64Type>(array, column),
        (ColumnType::Double, DataType::Float32) => {
            let values = array.as_primitive::<Float32Type>();
            Ok(nullable(values, |i| Value::Float(f64::from(values.value(i)))))
        },
        (ColumnType::Double, DataType::Float64) => {
            let values = array.as_primitive::<Float64Type>();
            Ok(nullable(values, |i| Value::Float(values.value(i))))
        },
        (ColumnType::Timestamp, DataType::Timestamp(unit, _)) => match unit {
            TimeUnit::Second => decode_timestamps::<TimestampSecondType>(array, column),
            TimeUnit::Millisecond => decode_timestamps::<TimestampMillisecondType>(array, column),
            TimeUnit::Microsecond => decode_timestamps::<TimestampMicrosecondType>(array, column),
            TimeUnit::Nanosecond => decode_timestamps::<TimestampNanosecondType>(array, column),
        },
        (ColumnType::Date, DataType::Date32) => decode_dates::<Date32Type>(array, column),
        (ColumnType::Date, DataType::Date64) => decode_dates::<Date64Type>(array, column),
        (ColumnType::Text, DataType::Utf8) => {
            let values = array.as_string::<i32>();
            Ok(nullable(values, |i| Value::Text(values.value(i).to_string())))
        },
        (ColumnType::Text, DataType::LargeUtf8) => {
            let values = array.as_string::<i64>();
            Ok(nullable(values, |i| Value::Text(values.value(i).to_string())))
        },
        (ColumnType::Text, DataType::Utf8View) => {
            let values = array.as_string_view();
            Ok(nullable(values, |i| Value::Text(values.value(i).to_string())))
        },
        (ColumnType::Text, _) => {
            let options = FormatOptions::default();
            let formatter = ArrayFormatter::try_new(array, &options)?;
            Ok(nullable(array, |i| Value::Text(formatter.value(i).to_string())))
        },
        _ => Err(BatchError::UnsupportedArrowType {
            column: column.name.clone(),
            data_type: data_type.to_string(),
        }),
    }
}

fn nullable(array: &dyn Array, mut value: impl FnMut(usize) -> Value) -> Vec<Value> {
    (0..array.len())
        .map(|i| if array.is_null(i) { Value::Null } else { value(i) })
        .collect()
}

fn decode_ints<T>(array: &dyn Array, column: &Column) -> Result<Vec<Value>, BatchError>
where
    T: ArrowPrimitiveType,
    T::Native: TryInto<i64> + std::fmt::Display,
{
    let values = array.as_primitive::<T>();
    let mut out = Vec::with_capacity(values.len());
    for i in 0..values.len() {
        if values.is_null(i) {
            out.push(Value::Null);
            continue;
        }
        let raw = values.value(i);
        let converted: i64 = raw.try_into().map_err(|_| BatchError::ValueType {
            row: i,
            column: column.name.clone(),
            expected: ColumnType::BigInt,
            value: raw.to_string(),
        })?;
        out.push(Value::Int(converted));
    }
    Ok(out)
}

fn decode_timestamps<T>(array: &dyn Array, column: &Column) -> Result<Vec<Value>, BatchError>
where
    T: ArrowTemporalType,
    i64: From<T::Native>,
{
    let values = array.as_primitive::<T>();
    (0..values.len())
        .map(|i| {
            if values.is_null(i) {
                return Ok(Value::Null);
            }
            values
                .value_as_datetime(i)
                .map(Value::Timestamp)
                .ok_or_else(|| out_of_range(column, ColumnType::Timestamp, i64::from(values.value(i))))
        })
        .collect()
}

fn decode_dates<T>(array: &dyn Array, column: &Column) -> Result<Vec<Value>, BatchError>
where
    T: ArrowTemporalType,
    i64: From<T::Native>,
{
    let values = array.as_primitive::<T>();
    (0..values.len())
        .map(|i| {
            if values.is_null(i) {
                return Ok(Value::Null);
            }
            values
                .value_as_date(i)
                .map(Value::Date)
                .ok_or_else(|| out_of_range(column, ColumnType::Date, i64::from(values.value(i))))
        })
        .collect()
}

fn out_of_range(column: &Column, expected: ColumnType, raw: i64) -> BatchError {
    BatchError::ValueType {
        row: 0,
        column: column.name.clone(),
        expected,
        value: raw.to_string(),
    }
}

/// Naive timestamp from microseconds since the epoch
pub fn timestamp_from_micros(micros: i64) -> Option<NaiveDateTime> {
    chrono::DateTime::from_timestamp_micros(micros).map(|dt| dt.naive_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::arrow::array::{
        Date32Array, Date64Array, Float64Array, Int32Array, StringArray, TimestampMillisecondArray,
        TimestampNanosecondArray, TimestampSecondArray,
    };

    #[test]
    fn test_schema_mapping_from_arrow() {
        let arrow_schema = ArrowSchema::new(vec![
            Field::new("VendorID", DataType::Int32, true),
            Field::new(
                "tpep_pickup_datetime",
                DataType::Timestamp(TimeUnit::Nanosecond, None),
                true,
            ),
            Field::new("passenger_count", DataType::Float64, true),
            Field::new("store_and_fwd_flag", DataType::LargeUtf8, true),
            Field::new("airport_fee", DataType::Decimal128(10, 2), true),
        ]);

        let schema = schema_from_arrow(&arrow_schema);
        let types: Vec<ColumnType> = schema.columns().iter().map(|c| c.data_type).collect();
        assert_eq!(
            types,
            vec![
                ColumnType::BigInt,
                ColumnType::Timestamp,
                ColumnType::Double,
                ColumnType::Text,
                ColumnType::Text,
            ]
        );
    }

    #[test]
    fn test_decode_record_batch_with_nulls() {
        let arrow_schema = Arc::new(ArrowSchema::new(vec![
            Field::new("VendorID", DataType::Int32, true),
            Field::new(
                "tpep_pickup_datetime",
                DataType::Timestamp(TimeUnit::Nanosecond, None),
                true,
            ),
            Field::new("passenger_count", DataType::Float64, true),
            Field::new("store_and_fwd_flag", DataType::Utf8, true),
        ]));
        let record = RecordBatch::try_new(
            Arc::clone(&arrow_schema),
            vec![
                Arc::new(Int32Array::from(vec![Some(2), None])),
                Arc::new(TimestampNanosecondArray::from(vec![
                    Some(1_609_459_200_000_000_000),
                    None,
                ])),
                Arc::new(Float64Array::from(vec![Some(1.0), None])),
                Arc::new(StringArray::from(vec![Some("N"), None])),
            ],
        )
        .unwrap();

        let schema = Arc::new(schema_from_arrow(&arrow_schema));
        let batch = batch_from_record_batch(&schema, &record).unwrap();

        assert_eq!(batch.num_rows(), 2);
        assert_eq!(
            batch.rows()[0],
            vec![
                Value::Int(2),
                Value::Timestamp(timestamp_from_micros(1_609_459_200_000_000).unwrap()),
                Value::Float(1.0),
                Value::Text("N".to_string()),
            ]
        );
        assert!(batch.rows()[1].iter().all(Value::is_null));
    }

    #[test]
    fn test_encode_batch_preserves_values() {
        let schema = Arc::new(Schema::new(vec![
            Column::new("flag", ColumnType::Boolean),
            Column::new("pickup", ColumnType::Timestamp),
            Column::new("day", ColumnType::Date),
        ]));
        let pickup = timestamp_from_micros(1_612_137_600_123_456).unwrap();
        let day = NaiveDate::from_ymd_opt(2021, 2, 1).unwrap();
        let batch = Batch::try_new(
            Arc::clone(&schema),
            vec![
                vec![Value::Bool(true), Value::Timestamp(pickup), Value::Date(day)],
                vec![Value::Null, Value::Null, Value::Null],
            ],
        )
        .unwrap();

        let record = record_batch_from_batch(&batch, to_arrow_schema(&schema)).unwrap();
        assert_eq!(record.num_rows(), 2);
        assert_eq!(record.column(2).as_primitive::<Date32Type>().value(0), 18659);

        let decoded = batch_from_record_batch(&schema, &record).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn test_decode_every_temporal_unit() {
        let arrow_schema = Arc::new(ArrowSchema::new(vec![
            Field::new("pickup_s", DataType::Timestamp(TimeUnit::Second, None), true),
            Field::new("pickup_ms", DataType::Timestamp(TimeUnit::Millisecond, None), true),
            Field::new("day32", DataType::Date32, true),
            Field::new("day64", DataType::Date64, true),
        ]));
        let record = RecordBatch::try_new(
            Arc::clone(&arrow_schema),
            vec![
                Arc::new(TimestampSecondArray::from(vec![Some(1_609_459_200), None])),
                Arc::new(TimestampMillisecondArray::from(vec![Some(1_609_459_200_500), None])),
                Arc::new(Date32Array::from(vec![Some(18_659), None])),
                Arc::new(Date64Array::from(vec![Some(1_612_137_600_000), None])),
            ],
        )
        .unwrap();

        let schema = Arc::new(schema_from_arrow(&arrow_schema));
        let types: Vec<ColumnType> = schema.columns().iter().map(|c| c.data_type).collect();
        assert_eq!(
            types,
            vec![ColumnType::Timestamp, ColumnType::Timestamp, ColumnType::Date, ColumnType::Date]
        );

        let batch = batch_from_record_batch(&schema, &record).unwrap();
        let day = NaiveDate::from_ymd_opt(2021, 2, 1).unwrap();
        assert_eq!(
            batch.rows()[0],
            vec![
                Value::Timestamp(timestamp_from_micros(1_609_459_200_000_000).unwrap()),
                Value::Timestamp(timestamp_from_micros(1_609_459_200_500_000).unwrap()),
                Value::Date(day),
                Value::Date(day),
            ]
        );
        assert!(batch.rows()[1].iter().all(Value::is_null));
    }
}
