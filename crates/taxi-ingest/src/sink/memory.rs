//! In-process sink for dry runs and tests

use super::{RunOutcome, Sink, SinkError, WritePolicy};
use crate::batch::{Batch, Schema, Value};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryTable {
    pub schema: Schema,
    pub rows: Vec<Vec<Value>>,
}

/// Keeps declared tables and their rows in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    tables: BTreeMap<String, MemoryTable>,
    appends: Vec<(String, usize)>,
    closed: Vec<RunOutcome>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self, name: &str) -> Option<&MemoryTable> {
        self.tables.get(name)
    }

    pub fn row_count(&self, name: &str) -> usize {
        self.tables.get(name).map(|t| t.rows.len()).unwrap_or(0)
    }

    /// `(target, rows)` of every append, in call order
    pub fn appends(&self) -> &[(String, usize)] {
        &self.appends
    }

    /// Outcomes passed to `close`
    pub fn closed(&self) -> &[RunOutcome] {
        &self.closed
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn declare_schema(
        &mut self,
        target: &str,
        schema: &Schema,
        policy: WritePolicy,
    ) -> Result<(), SinkError> {
        match (policy, self.tables.get(target)) {
            (WritePolicy::Append, Some(existing)) => {
                if existing.schema != *schema {
                    return Err(SinkError::schema_mismatch(target, &existing.schema, schema));
                }
                debug!("Reusing table {} with {} rows", target, existing.rows.len());
            },
            _ => {
                self.tables.insert(
                    target.to_string(),
                    MemoryTable {
                        schema: schema.clone(),
                        rows: Vec::new(),
                    },
                );
            },
        }
        Ok(())
    }

    async fn append_batch(&mut self, target: &str, batch: &Batch) -> Result<(), SinkError> {
        let table = self
            .tables
            .get_mut(target)
            .ok_or_else(|| SinkError::Undeclared(target.to_string()))?;

        if table.schema != *batch.schema() {
            return Err(SinkError::schema_mismatch(target, &table.schema, batch.schema()));
        }

        table.rows.extend_from_slice(batch.rows());
        self.appends.push((target.to_string(), batch.num_rows()));
        Ok(())
    }

    async fn close(&mut self, outcome: RunOutcome) -> Result<(), SinkError> {
        self.closed.push(outcome);
        Ok(())
    }
}
