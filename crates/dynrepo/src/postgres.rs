//! PostgreSQL backend implementation for dynrepo
//!
//! Provides PostgreSQL-specific implementations:
//! - Connection and transaction sharing one client session
//! - Parameter coercion to the server-declared types
//! - Streaming rows from a server portal
//! - `COPY ... FROM STDIN` bulk loading in text format
//! - SQLSTATE to error category mapping

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::Client;
use tracing::{error, warn};

use crate::connection::{
    Connection, ConnectionConfig, ConnectionFactory, DatabaseType, Executor, RowStream,
    Transaction,
};
use crate::error::{Error, Result};
use crate::materialize::FromValue;
use crate::types::{Row, Value};

/// A dynrepo value bound as a PostgreSQL parameter.
///
/// The server declares each parameter's type; the value is coerced to it
/// (integers widen or narrow, text parses into UUID/JSON/numeric/date
/// targets). NULL is accepted for every type.
#[derive(Debug)]
struct PgParam(Value);

type BoxedError = Box<dyn std::error::Error + Sync + Send>;

impl ToSql for PgParam {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxedError> {
        let value = &self.0;
        if value.is_null() {
            return Ok(IsNull::Yes);
        }

        match *ty {
            Type::BOOL => bool::from_value(value)?.to_sql(ty, out),
            Type::INT2 => i16::from_value(value)?.to_sql(ty, out),
            Type::INT4 => i32::from_value(value)?.to_sql(ty, out),
            Type::INT8 => i64::from_value(value)?.to_sql(ty, out),
            Type::OID => u32::from_value(value)?.to_sql(ty, out),
            Type::FLOAT4 => f32::from_value(value)?.to_sql(ty, out),
            Type::FLOAT8 => f64::from_value(value)?.to_sql(ty, out),
            Type::NUMERIC => rust_decimal::Decimal::from_value(value)?.to_sql(ty, out),
            Type::UUID => uuid::Uuid::from_value(value)?.to_sql(ty, out),
            Type::JSON | Type::JSONB => serde_json::Value::from_value(value)?.to_sql(ty, out),
            Type::DATE => chrono::NaiveDate::from_value(value)?.to_sql(ty, out),
            Type::TIME => chrono::NaiveTime::from_value(value)?.to_sql(ty, out),
            Type::TIMESTAMP => chrono::NaiveDateTime::from_value(value)?.to_sql(ty, out),
            Type::TIMESTAMPTZ => {
                chrono::DateTime::<chrono::Utc>::from_value(value)?.to_sql(ty, out)
            }
            Type::BYTEA => Vec::<u8>::from_value(value)?.to_sql(ty, out),
            _ => match value.as_string() {
                // text, varchar, name, enums and other text-encoded types
                Some(text) => text.to_sql(ty, out),
                None => Err(format!(
                    "cannot bind {} to parameter of type {}",
                    value.sql_type(),
                    ty
                )
                .into()),
            },
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn bind_params(params: &[Value]) -> Vec<PgParam> {
    params.iter().cloned().map(PgParam).collect()
}

fn param_refs(params: &[PgParam]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

/// Translate a driver error into the dynrepo taxonomy
fn map_pg_error(e: tokio_postgres::Error, sql: &str) -> Error {
    let Some((code, message, constraint, table)) = e.as_db_error().map(|db| {
        (
            db.code().code().to_string(),
            db.message().to_string(),
            db.constraint().map(str::to_string),
            db.table().map(str::to_string),
        )
    }) else {
        if e.is_closed() {
            return Error::connection_with_source("connection closed", e);
        }
        return Error::Query {
            message: e.to_string(),
            sql: Some(sql.to_string()),
            source: Some(Box::new(e)),
        };
    };

    match code.as_str() {
        "40P01" | "40001" => Error::deadlock(message),
        "57014" => Error::timeout(message),
        "53300" => Error::PoolExhausted { message },
        "57P01" => Error::connection_with_source(message, e),
        "28000" | "28P01" => Error::Authentication { message },
        "42P01" => Error::TableNotFound {
            table: table.unwrap_or(message),
        },
        c if c.starts_with("08") => Error::connection_with_source(message, e),
        c if c.starts_with("23") => Error::Constraint {
            constraint_name: constraint.unwrap_or_default(),
            message,
        },
        _ => Error::Query {
            message,
            sql: Some(sql.to_string()),
            source: Some(Box::new(e)),
        },
    }
}

/// Convert a tokio-postgres row to a dynrepo Row
fn pg_row_to_row(pg_row: &tokio_postgres::Row) -> Row {
    let columns: Vec<String> = pg_row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    let values: Vec<Value> = pg_row
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| pg_value_to_value(pg_row, i, col.type_()))
        .collect();

    Row::new(columns, values)
}

fn get<'a, T>(row: &'a tokio_postgres::Row, idx: usize, wrap: fn(T) -> Value) -> Value
where
    T: tokio_postgres::types::FromSql<'a>,
{
    row.try_get::<_, Option<T>>(idx)
        .ok()
        .flatten()
        .map(wrap)
        .unwrap_or(Value::Null)
}

/// Convert a PostgreSQL value to a dynrepo Value (NULL for SQL NULL)
fn pg_value_to_value(row: &tokio_postgres::Row, idx: usize, pg_type: &Type) -> Value {
    match *pg_type {
        Type::BOOL => get(row, idx, Value::Bool),
        Type::INT2 => get(row, idx, Value::Int16),
        Type::INT4 => get(row, idx, Value::Int32),
        Type::INT8 => get(row, idx, Value::Int64),
        Type::OID => get(row, idx, |n: u32| Value::Int64(i64::from(n))),
        Type::FLOAT4 => get(row, idx, Value::Float32),
        Type::FLOAT8 => get(row, idx, Value::Float64),
        Type::NUMERIC => get(row, idx, Value::Decimal),
        Type::VARCHAR | Type::TEXT | Type::BPCHAR | Type::NAME => get(row, idx, Value::String),
        Type::BYTEA => get(row, idx, Value::Bytes),
        Type::DATE => get(row, idx, Value::Date),
        Type::TIME => get(row, idx, Value::Time),
        Type::TIMESTAMP => get(row, idx, Value::DateTime),
        Type::TIMESTAMPTZ => get(row, idx, Value::DateTimeTz),
        Type::UUID => get(row, idx, Value::Uuid),
        Type::JSON | Type::JSONB => get(row, idx, Value::Json),
        // Try to get as string for unknown types
        _ => get(row, idx, Value::String),
    }
}

/// Append rows to `buf` in COPY text format
fn encode_copy_text(rows: &[Vec<Value>], buf: &mut BytesMut) {
    for row in rows {
        for (i, value) in row.iter().enumerate() {
            if i > 0 {
                buf.put_u8(b'\t');
            }
            encode_copy_field(value, buf);
        }
        buf.put_u8(b'\n');
    }
}

fn encode_copy_field(value: &Value, buf: &mut BytesMut) {
    let text = match value {
        Value::Null => {
            buf.put_slice(b"\\N");
            return;
        }
        Value::Bool(b) => (if *b { "t" } else { "f" }).to_string(),
        Value::Float32(n) => copy_float(f64::from(*n)),
        Value::Float64(n) => copy_float(*n),
        Value::Bytes(bytes) => {
            // bytea hex input; the backslash itself is escaped for COPY
            buf.put_slice(b"\\\\x");
            for byte in bytes {
                buf.put_slice(format!("{:02x}", byte).as_bytes());
            }
            return;
        }
        Value::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
        other => other.as_string().unwrap_or_default(),
    };

    for byte in text.bytes() {
        match byte {
            b'\\' => buf.put_slice(b"\\\\"),
            b'\t' => buf.put_slice(b"\\t"),
            b'\n' => buf.put_slice(b"\\n"),
            b'\r' => buf.put_slice(b"\\r"),
            other => buf.put_u8(other),
        }
    }
}

fn copy_float(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n == f64::INFINITY {
        "Infinity".to_string()
    } else if n == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        n.to_string()
    }
}

async fn pg_query(client: &Client, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
    let bound = bind_params(params);
    let pg_rows = client
        .query(sql, &param_refs(&bound))
        .await
        .map_err(|e| map_pg_error(e, sql))?;
    Ok(pg_rows.iter().map(pg_row_to_row).collect())
}

async fn pg_execute(client: &Client, sql: &str, params: &[Value]) -> Result<u64> {
    let bound = bind_params(params);
    client
        .execute(sql, &param_refs(&bound))
        .await
        .map_err(|e| map_pg_error(e, sql))
}

async fn pg_query_stream(client: &Client, sql: &str, params: &[Value]) -> Result<RowStream> {
    let stream = client
        .query_raw(sql, bind_params(params))
        .await
        .map_err(|e| map_pg_error(e, sql))?;
    let sql = sql.to_string();
    Ok(stream
        .map(move |row| {
            row.map(|r| pg_row_to_row(&r))
                .map_err(|e| map_pg_error(e, &sql))
        })
        .boxed())
}

async fn pg_copy_in(client: &Client, sql: &str, rows: &[Vec<Value>]) -> Result<u64> {
    let sink = client
        .copy_in::<_, Bytes>(sql)
        .await
        .map_err(|e| map_pg_error(e, sql))?;
    futures::pin_mut!(sink);

    let mut buf = BytesMut::new();
    encode_copy_text(rows, &mut buf);
    sink.send(buf.freeze())
        .await
        .map_err(|e| map_pg_error(e, sql))?;
    sink.as_mut()
        .finish()
        .await
        .map_err(|e| map_pg_error(e, sql))
}

/// PostgreSQL connection implementation
pub struct PgConnection {
    client: Arc<Client>,
    closed: AtomicBool,
}

impl PgConnection {
    /// Create a new connection from a tokio-postgres client
    pub fn new(client: Client) -> Self {
        Self {
            client: Arc::new(client),
            closed: AtomicBool::new(false),
        }
    }

    /// Get the underlying client
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::connection("connection is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Executor for PgConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.ensure_open()?;
        pg_query(&self.client, sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.ensure_open()?;
        pg_execute(&self.client, sql, params).await
    }

    async fn query_stream(&self, sql: &str, params: &[Value]) -> Result<RowStream> {
        self.ensure_open()?;
        pg_query_stream(&self.client, sql, params).await
    }

    async fn copy_in(&self, sql: &str, rows: &[Vec<Value>]) -> Result<u64> {
        self.ensure_open()?;
        pg_copy_in(&self.client, sql, rows).await
    }
}

#[async_trait]
impl Connection for PgConnection {
    fn as_executor(&self) -> &dyn Executor {
        self
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.ensure_open()?;

        self.client
            .batch_execute("BEGIN")
            .await
            .map_err(|e| Error::Transaction {
                message: e.to_string(),
                source: Some(Box::new(e)),
            })?;

        Ok(Box::new(PgTransaction {
            client: Arc::clone(&self.client),
            completed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// PostgreSQL transaction on a shared client session
pub struct PgTransaction {
    client: Arc<Client>,
    completed: AtomicBool,
}

impl PgTransaction {
    async fn finish(&self, statement: &str) -> Result<()> {
        if self.completed.swap(true, Ordering::AcqRel) {
            return Err(Error::transaction("transaction already completed"));
        }
        self.client
            .batch_execute(statement)
            .await
            .map_err(|e| Error::Transaction {
                message: e.to_string(),
                source: Some(Box::new(e)),
            })
    }
}

#[async_trait]
impl Executor for PgTransaction {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        pg_query(&self.client, sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        pg_execute(&self.client, sql, params).await
    }

    async fn query_stream(&self, sql: &str, params: &[Value]) -> Result<RowStream> {
        pg_query_stream(&self.client, sql, params).await
    }

    async fn copy_in(&self, sql: &str, rows: &[Vec<Value>]) -> Result<u64> {
        pg_copy_in(&self.client, sql, rows).await
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    fn as_executor(&self) -> &dyn Executor {
        self
    }

    async fn commit(&self) -> Result<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(&self) -> Result<()> {
        self.finish("ROLLBACK").await
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        if self.completed.load(Ordering::Acquire) {
            return;
        }
        warn!("Transaction dropped without commit or rollback, rolling back");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let client = Arc::clone(&self.client);
            handle.spawn(async move {
                if let Err(e) = client.batch_execute("ROLLBACK").await {
                    warn!(error = %e, "Background rollback failed");
                }
            });
        }
    }
}

/// PostgreSQL connection factory
#[derive(Debug, Clone, Default)]
pub struct PgConnectionFactory;

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let mut pg_config: tokio_postgres::Config = config
            .url
            .parse()
            .map_err(|e| Error::config(format!("invalid PostgreSQL connection string: {}", e)))?;
        pg_config.connect_timeout(Duration::from_millis(config.connect_timeout_ms));
        if let Some(name) = &config.application_name {
            pg_config.application_name(name);
        }

        let (client, connection) = pg_config.connect(tokio_postgres::NoTls).await.map_err(|e| {
            match e.as_db_error().map(|db| db.code().code().starts_with("28")) {
                Some(true) => Error::Authentication {
                    message: e.to_string(),
                },
                _ => Error::connection_with_source("failed to connect", e),
            }
        })?;

        // Spawn the connection handler
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection error");
            }
        });

        Ok(Box::new(PgConnection::new(client)))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }
}
