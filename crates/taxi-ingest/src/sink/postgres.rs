//! PostgreSQL sink
//!
//! Every batch is written in its own transaction, so a failed batch leaves
//! the table exactly as the previous batch left it.

use super::{RunOutcome, Sink, SinkError, WritePolicy};
use crate::batch::{Batch, ColumnType, Schema, Value};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::query_builder::Separated;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Upper bound on bind parameters in one PostgreSQL statement
pub const MAX_BIND_PARAMS: usize = 65_535;

pub struct PostgresSink {
    pool: PgPool,
    declared: HashMap<String, Schema>,
}

impl PostgresSink {
    pub async fn connect(options: PgConnectOptions) -> Result<Self, SinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        info!("Connection to Postgres database established.");
        Ok(Self::new(pool))
    }

    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            declared: HashMap::new(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn existing_columns(&self, target: &str) -> Result<Vec<(String, String)>, SinkError> {
        let (schema_name, table) = split_name(target);
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT column_name::text, data_type::text
            FROM information_schema.columns
            WHERE table_schema = COALESCE($1::text, current_schema()) AND table_name = $2
            ORDER BY ordinal_position
            "#,
        )
        .bind(schema_name)
        .bind(table)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl Sink for PostgresSink {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn declare_schema(
        &mut self,
        target: &str,
        schema: &Schema,
        policy: WritePolicy,
    ) -> Result<(), SinkError> {
        let table = qualified_name(target);

        match policy {
            WritePolicy::Replace => {
                let drop_sql = format!("DROP TABLE IF EXISTS {}", table);
                let create_sql = create_table_sql(target, schema, false);

                let mut tx = self.pool.begin().await?;
                sqlx::query(&drop_sql).execute(&mut *tx).await?;
                sqlx::query(&create_sql).execute(&mut *tx).await?;
                tx.commit().await?;
            },
            WritePolicy::Append => {
                let existing = self.existing_columns(target).await?;
                if existing.is_empty() {
                    sqlx::query(&create_table_sql(target, schema, true))
                        .execute(&self.pool)
                        .await?;
                } else if !columns_match(&existing, schema) {
                    let found = existing
                        .iter()
                        .map(|(name, ty)| format!("{} {}", name, ty))
                        .collect::<Vec<_>>()
                        .join(", ");
                    return Err(SinkError::SchemaMismatch {
                        target: target.to_string(),
                        expected: schema.to_string(),
                        found: format!("({})", found),
                    });
                }
            },
        }

        debug!("Declared {} {} ({})", table, schema, policy);
        self.declared.insert(target.to_string(), schema.clone());
        Ok(())
    }

    async fn append_batch(&mut self, target: &str, batch: &Batch) -> Result<(), SinkError> {
        let declared = self
            .declared
            .get(target)
            .ok_or_else(|| SinkError::Undeclared(target.to_string()))?;

        if declared != batch.schema() {
            return Err(SinkError::schema_mismatch(target, declared, batch.schema()));
        }
        if batch.is_empty() || declared.is_empty() {
            return Ok(());
        }

        let columns = batch.schema().columns();
        let insert = format!(
            "INSERT INTO {} ({}) ",
            qualified_name(target),
            columns
                .iter()
                .map(|c| quote_ident(&c.name))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let chunk_size = rows_per_statement(columns.len());

        let mut tx = self.pool.begin().await?;
        for chunk in batch.rows().chunks(chunk_size) {
            let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(insert.as_str());
            query_builder.push_values(chunk.iter(), |mut b, row| {
                for (value, column) in row.iter().zip(columns) {
                    bind_value(&mut b, value, column.data_type);
                }
            });
            query_builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn close(&mut self, outcome: RunOutcome) -> Result<(), SinkError> {
        debug!("Closing Postgres pool after {:?} run", outcome);
        self.pool.close().await;
        Ok(())
    }
}

fn bind_value(b: &mut Separated<'_, '_, Postgres, &'static str>, value: &Value, data_type: ColumnType) {
    match value {
        Value::Null => match data_type {
            ColumnType::Boolean => b.push_bind(None::<bool>),
            ColumnType::BigInt => b.push_bind(None::<i64>),
            ColumnType::Double => b.push_bind(None::<f64>),
            ColumnType::Text => b.push_bind(None::<String>),
            ColumnType::Timestamp => b.push_bind(None::<chrono::NaiveDateTime>),
            ColumnType::Date => b.push_bind(None::<chrono::NaiveDate>),
        },
        Value::Bool(v) => b.push_bind(*v),
        Value::Int(v) => b.push_bind(*v),
        Value::Float(v) => b.push_bind(*v),
        Value::Text(v) => b.push_bind(v.clone()),
        Value::Timestamp(v) => b.push_bind(*v),
        Value::Date(v) => b.push_bind(*v),
    };
}

/// Rows per `INSERT` so that rows × columns stays under the bind limit
pub fn rows_per_statement(columns: usize) -> usize {
    (MAX_BIND_PARAMS / columns.max(1)).max(1)
}

/// Double-quote an identifier, escaping embedded quotes
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote `table` or `schema.table`
pub fn qualified_name(name: &str) -> String {
    match split_name(name) {
        (Some(schema), table) => format!("{}.{}", quote_ident(schema), quote_ident(table)),
        (None, table) => quote_ident(table),
    }
}

fn split_name(name: &str) -> (Option<&str>, &str) {
    match name.split_once('.') {
        Some((schema, table)) if !schema.is_empty() && !table.is_empty() => (Some(schema), table),
        _ => (None, name),
    }
}

pub fn create_table_sql(target: &str, schema: &Schema, if_not_exists: bool) -> String {
    let columns = schema
        .columns()
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.data_type.sql_type()))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "CREATE TABLE {}{} ({})",
        if if_not_exists { "IF NOT EXISTS " } else { "" },
        qualified_name(target),
        columns
    )
}

/// `information_schema.columns.data_type` for a column type
fn information_schema_type(data_type: ColumnType) -> &'static str {
    match data_type {
        ColumnType::Boolean => "boolean",
        ColumnType::BigInt => "bigint",
        ColumnType::Double => "double precision",
        ColumnType::Text => "text",
        ColumnType::Timestamp => "timestamp without time zone",
        ColumnType::Date => "date",
    }
}

fn columns_match(existing: &[(String, String)], schema: &Schema) -> bool {
    existing.len() == schema.len()
        && existing
            .iter()
            .zip(schema.columns())
            .all(|((name, ty), column)| {
                *name == column.name && ty == information_schema_type(column.data_type)
            })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Column;

    fn trips() -> Schema {
        Schema::new(vec![
            Column::new("VendorID", ColumnType::BigInt),
            Column::new("tpep_pickup_datetime", ColumnType::Timestamp),
            Column::new("fare_amount", ColumnType::Double),
        ])
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("trips"), "\"trips\"");
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
        assert_eq!(qualified_name("public.yellow_taxi_data"), "\"public\".\"yellow_taxi_data\"");
        assert_eq!(qualified_name("yellow_taxi_data"), "\"yellow_taxi_data\"");
        assert_eq!(qualified_name(".trips"), "\".trips\"");
    }

    #[test]
    fn test_create_table_sql() {
        assert_eq!(
            create_table_sql("rides", &trips(), false),
            "CREATE TABLE \"rides\" (\"VendorID\" BIGINT, \"tpep_pickup_datetime\" TIMESTAMP, \"fare_amount\" DOUBLE PRECISION)"
        );
        assert!(create_table_sql("staging.rides", &trips(), true)
            .starts_with("CREATE TABLE IF NOT EXISTS \"staging\".\"rides\" ("));
    }

    #[test]
    fn test_rows_per_statement_respects_bind_limit() {
        assert_eq!(rows_per_statement(19), 3449);
        assert!(rows_per_statement(19) * 19 <= MAX_BIND_PARAMS);
        assert_eq!(rows_per_statement(0), MAX_BIND_PARAMS);
        assert_eq!(rows_per_statement(100_000), 1);
    }

    #[test]
    fn test_columns_match() {
        let existing = vec![
            ("VendorID".to_string(), "bigint".to_string()),
            ("tpep_pickup_datetime".to_string(), "timestamp without time zone".to_string()),
            ("fare_amount".to_string(), "double precision".to_string()),
        ];
        assert!(columns_match(&existing, &trips()));
        assert!(!columns_match(&existing[..2], &trips()));

        let mut retyped = existing.clone();
        retyped[2].1 = "text".to_string();
        assert!(!columns_match(&retyped, &trips()));
    }
}
