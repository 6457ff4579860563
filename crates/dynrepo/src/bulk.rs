//! Bulk loading through the backend's copy protocol

use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;

use crate::connection::Executor;
use crate::dialect::SqlDialect;
use crate::error::{Error, Result};
use crate::security::{validate_sql_identifier, validate_table_name};
use crate::types::{Row, Value};

/// Default rows per copy batch
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Column names plus rows of equal width
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkPayload {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl BulkPayload {
    /// Empty payload with the given columns
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Append a row; its width must match the columns
    pub fn push_row(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(Error::validation(format!(
                "bulk row {} has {} values, expected {}",
                self.rows.len(),
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Builder-style [`push_row`](Self::push_row)
    pub fn with_row(mut self, row: Vec<Value>) -> Result<Self> {
        self.push_row(row)?;
        Ok(self)
    }

    /// Payload from rows sharing the first row's columns
    pub fn from_rows(rows: &[Row]) -> Result<Self> {
        let Some(head) = rows.first() else {
            return Ok(Self::default());
        };
        let mut payload = Self::new(head.columns().iter().cloned());
        for row in rows {
            if row.columns() != head.columns() {
                return Err(Error::validation("bulk rows have differing columns"));
            }
            payload.push_row(row.values().to_vec())?;
        }
        Ok(payload)
    }

    /// Column names
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows
    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    /// Row count
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether there are no rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Target and batching for a bulk load
#[derive(Debug, Clone, PartialEq)]
pub struct BulkOptions {
    /// Destination table (optionally schema-qualified)
    pub table: String,
    /// Payload column → destination column
    pub column_mappings: HashMap<String, String>,
    /// Rows per copy batch
    pub batch_size: usize,
    /// Overall timeout; the configured command timeout when unset
    pub timeout: Option<Duration>,
}

impl BulkOptions {
    /// Load into `table` with default batching
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column_mappings: HashMap::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            timeout: None,
        }
    }

    /// Write payload column `source` into `destination`
    pub fn map_column(mut self, source: impl Into<String>, destination: impl Into<String>) -> Self {
        self.column_mappings.insert(source.into(), destination.into());
        self
    }

    /// Rows per batch
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Overall timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Streams payload rows to the server in batches
#[derive(Debug, Clone, Copy)]
pub struct BulkLoader<'a> {
    dialect: &'a dyn SqlDialect,
}

impl<'a> BulkLoader<'a> {
    /// Create a loader for a dialect
    pub fn new(dialect: &'a dyn SqlDialect) -> Self {
        Self { dialect }
    }

    /// Validate names and render the copy statement
    pub fn copy_sql(&self, payload: &BulkPayload, options: &BulkOptions) -> Result<String> {
        validate_table_name(&options.table)?;
        if options.batch_size == 0 {
            return Err(Error::validation("bulk batch size must be positive"));
        }
        if payload.columns().is_empty() {
            return Err(Error::validation("bulk payload has no columns"));
        }

        let mut targets = Vec::with_capacity(payload.columns().len());
        for column in payload.columns() {
            let target = options
                .column_mappings
                .iter()
                .find(|(source, _)| source.eq_ignore_ascii_case(column))
                .map_or(column.as_str(), |(_, destination)| destination.as_str());
            validate_sql_identifier(target)?;
            targets.push(target);
        }

        self.dialect
            .bulk_copy_sql(&options.table, &targets)
            .ok_or_else(|| {
                Error::unsupported(format!(
                    "{} has no text-level bulk copy",
                    self.dialect.name()
                ))
            })
    }

    /// Copy every row, returns rows written
    pub async fn load(
        &self,
        executor: &dyn Executor,
        payload: &BulkPayload,
        options: &BulkOptions,
    ) -> Result<u64> {
        if payload.is_empty() {
            return Ok(0);
        }
        let sql = self.copy_sql(payload, options)?;

        let mut written = 0u64;
        for (batch, rows) in payload.rows().chunks(options.batch_size).enumerate() {
            written += executor.copy_in(&sql, rows).await?;
            debug!(
                table = %options.table,
                batch,
                rows = rows.len(),
                written,
                "Copied bulk batch"
            );
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{PostgresDialect, SqlServerDialect};

    fn payload() -> BulkPayload {
        BulkPayload::new(["Id", "Total"])
            .with_row(vec![Value::Int32(1), Value::Float64(2.5)])
            .unwrap()
    }

    #[test]
    fn test_ragged_row_rejected() {
        let mut payload = BulkPayload::new(["Id", "Total"]);
        assert!(payload.push_row(vec![Value::Int32(1)]).is_err());
        assert!(payload.is_empty());
    }

    #[test]
    fn test_copy_sql_with_mapping() {
        let options = BulkOptions::new("sales.orders")
            .map_column("id", "order_id")
            .map_column("Total", "amount");
        let sql = BulkLoader::new(&PostgresDialect)
            .copy_sql(&payload(), &options)
            .unwrap();
        assert_eq!(
            sql,
            "COPY sales.orders (order_id, amount) FROM STDIN WITH (FORMAT text)"
        );
    }

    #[test]
    fn test_copy_sql_rejects_unsafe_names() {
        let loader = BulkLoader::new(&PostgresDialect);
        assert!(loader
            .copy_sql(&payload(), &BulkOptions::new("orders; DROP TABLE x"))
            .is_err());
        assert!(loader
            .copy_sql(
                &payload(),
                &BulkOptions::new("orders").map_column("Id", "id) FROM x --")
            )
            .is_err());
        assert!(loader
            .copy_sql(&payload(), &BulkOptions::new("orders").with_batch_size(0))
            .is_err());
    }

    #[test]
    fn test_copy_sql_unsupported_dialect() {
        let err = BulkLoader::new(&SqlServerDialect)
            .copy_sql(&payload(), &BulkOptions::new("Orders"))
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported { .. }));
    }

    #[test]
    fn test_payload_from_rows() {
        let rows = vec![
            Row::from_pairs([("a", 1), ("b", 2)]),
            Row::from_pairs([("a", 3), ("b", 4)]),
        ];
        let payload = BulkPayload::from_rows(&rows).unwrap();
        assert_eq!(payload.columns(), &["a".to_string(), "b".to_string()]);
        assert_eq!(payload.len(), 2);

        let ragged = vec![Row::from_pairs([("a", 1)]), Row::from_pairs([("c", 1)])];
        assert!(BulkPayload::from_rows(&ragged).is_err());
    }
}
