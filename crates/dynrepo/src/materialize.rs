//! Row materialization
//!
//! Records are built from rows through registration-time mapping tables
//! ([`RowMapper`]) and value conversions ([`FromValue`]); there is no runtime
//! reflection. Column lookup is case-insensitive and NULL columns leave the
//! field at its default.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::connection::RowStream;
use crate::error::{Error, Result};
use crate::lifecycle::ConnectionLease;
use crate::types::{Row, Value};

/// Conversion from a single column value
pub trait FromValue: Sized {
    /// Convert a non-NULL value (NULL only reaches `Option` and `Value`)
    fn from_value(value: &Value) -> Result<Self>;
}

fn mismatch<T>(value: &Value, target: &str) -> Result<T> {
    Err(Error::type_conversion(format!(
        "cannot convert {} to {}",
        value.sql_type(),
        target
    )))
}

macro_rules! integer_from_value {
    ($($ty:ty),*) => {
        $(
            impl FromValue for $ty {
                fn from_value(value: &Value) -> Result<Self> {
                    match value.as_i64() {
                        Some(n) => <$ty>::try_from(n).map_err(|_| {
                            Error::type_conversion(format!(
                                "{} is out of range for {}",
                                n,
                                stringify!($ty)
                            ))
                        }),
                        None => mismatch(value, stringify!($ty)),
                    }
                }
            }
        )*
    };
}

integer_from_value!(i16, i32, i64, u32, u64, usize);

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_bool().map_or_else(|| mismatch(value, "bool"), Ok)
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_f64().map_or_else(|| mismatch(value, "f64"), Ok)
    }
}

impl FromValue for f32 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Float32(n) => Ok(*n),
            other => other
                .as_f64()
                .map(|n| n as f32)
                .map_or_else(|| mismatch(other, "f32"), Ok),
        }
    }
}

impl FromValue for Decimal {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_decimal().map_or_else(|| mismatch(value, "decimal"), Ok)
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_string().map_or_else(|| mismatch(value, "string"), Ok)
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self> {
        value
            .as_bytes()
            .map(<[u8]>::to_vec)
            .map_or_else(|| mismatch(value, "bytes"), Ok)
    }
}

impl FromValue for Uuid {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_uuid().map_or_else(|| mismatch(value, "uuid"), Ok)
    }
}

impl FromValue for NaiveDate {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Date(d) => Ok(*d),
            Value::DateTime(dt) => Ok(dt.date()),
            Value::DateTimeTz(dt) => Ok(dt.date_naive()),
            Value::String(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .map_err(|e| Error::type_conversion(e.to_string())),
            other => mismatch(other, "date"),
        }
    }
}

impl FromValue for NaiveTime {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Time(t) => Ok(*t),
            Value::DateTime(dt) => Ok(dt.time()),
            other => mismatch(other, "time"),
        }
    }
}

impl FromValue for NaiveDateTime {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::DateTime(dt) => Ok(*dt),
            Value::DateTimeTz(dt) => Ok(dt.naive_utc()),
            Value::Date(d) => Ok(d.and_time(NaiveTime::MIN)),
            Value::String(s) => s
                .trim()
                .parse::<NaiveDateTime>()
                .map_err(|e| Error::type_conversion(e.to_string())),
            other => mismatch(other, "timestamp"),
        }
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::DateTimeTz(dt) => Ok(*dt),
            Value::DateTime(dt) => Ok(dt.and_utc()),
            Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| Error::type_conversion(e.to_string())),
            other => mismatch(other, "timestamptz"),
        }
    }
}

impl FromValue for serde_json::Value {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => {
                serde_json::from_str(s).map_err(|e| Error::type_conversion(e.to_string()))
            }
            other => Ok(other.to_json()),
        }
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}

/// Enum from its integer discriminant
pub fn enum_from_value<E: TryFrom<i64>>(value: &Value) -> Result<E> {
    let n = value
        .as_i64()
        .ok_or_else(|| Error::type_conversion(format!("{} is not an enum value", value.sql_type())))?;
    E::try_from(n).map_err(|_| Error::type_conversion(format!("{} is not a known variant", n)))
}

/// Enum from its name
pub fn enum_from_name<E: FromStr>(value: &Value) -> Result<E> {
    let name = value
        .as_str()
        .ok_or_else(|| Error::type_conversion(format!("{} is not an enum name", value.sql_type())))?;
    name.trim()
        .parse()
        .map_err(|_| Error::type_conversion(format!("'{}' is not a known variant", name)))
}

/// Conversion from a whole row
pub trait FromRow: Sized {
    /// Build a record from a row
    fn from_row(row: &Row) -> Result<Self>;
}

impl FromRow for Row {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(row.clone())
    }
}

impl FromRow for HashMap<String, Value> {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(row.clone().into_map())
    }
}

type Setter<T> = Box<dyn Fn(&mut T, &Value) -> Result<()> + Send + Sync>;

/// Column → field mapping table, built once per record type.
///
/// ```
/// use dynrepo::materialize::RowMapper;
/// use dynrepo::{Row, Value};
///
/// #[derive(Default)]
/// struct Order {
///     id: i64,
///     note: Option<String>,
/// }
///
/// let mapper = RowMapper::<Order>::new()
///     .column("Id", |o, v| o.id = v)
///     .column("Note", |o, v| o.note = Some(v));
///
/// let row = Row::from_pairs([("id", Value::Int64(7)), ("note", Value::Null)]);
/// let order = mapper.map(&row).unwrap();
/// assert_eq!(order.id, 7);
/// assert!(order.note.is_none());
/// ```
pub struct RowMapper<T> {
    columns: Vec<(String, Setter<T>)>,
}

impl<T> std::fmt::Debug for RowMapper<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowMapper")
            .field(
                "columns",
                &self.columns.iter().map(|(c, _)| c.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl<T: Default + 'static> Default for RowMapper<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Default + 'static> RowMapper<T> {
    /// Empty mapping
    pub fn new() -> Self {
        Self {
            columns: Vec::new(),
        }
    }

    /// Map column `name` through `set`
    pub fn column<V: FromValue + 'static>(mut self, name: &str, set: fn(&mut T, V)) -> Self {
        let setter: Setter<T> = Box::new(move |target, value| {
            set(target, V::from_value(value)?);
            Ok(())
        });
        self.columns.push((name.to_string(), setter));
        self
    }

    /// Build a record; missing and NULL columns keep the default
    pub fn map(&self, row: &Row) -> Result<T> {
        let mut record = T::default();
        for (name, setter) in &self.columns {
            let Some(value) = row.get_by_name(name) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            setter(&mut record, value).map_err(|e| {
                Error::type_conversion(format!("column '{}': {}", name, e))
            })?;
        }
        Ok(record)
    }
}

/// Map every row
pub fn map_rows<T: FromRow>(rows: &[Row]) -> Result<Vec<T>> {
    rows.iter().map(T::from_row).collect()
}

/// First row, if any
pub fn first<T: FromRow>(rows: &[Row]) -> Result<Option<T>> {
    rows.first().map(T::from_row).transpose()
}

/// The only row, if any; a second row is an error
pub fn single<T: FromRow>(rows: &[Row], sql: &str) -> Result<Option<T>> {
    if rows.len() > 1 {
        return Err(Error::MultipleRows {
            sql: sql.to_string(),
        });
    }
    first(rows)
}

/// First column of the first row; default for no rows or NULL
pub fn scalar<T: FromValue + Default>(rows: &[Row]) -> Result<T> {
    match rows.first().and_then(|row| row.get(0)) {
        Some(value) if !value.is_null() => T::from_value(value),
        _ => Ok(T::default()),
    }
}

/// Result sets of a multi-statement query, read in order
#[derive(Debug, Clone, Default)]
pub struct ResultSets {
    sets: VecDeque<Vec<Row>>,
}

impl ResultSets {
    /// Wrap raw result sets
    pub fn new(sets: Vec<Vec<Row>>) -> Self {
        Self { sets: sets.into() }
    }

    /// Result sets not yet read
    pub fn remaining(&self) -> usize {
        self.sets.len()
    }

    /// Whether every set has been read
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Next set as raw rows
    pub fn read_rows(&mut self) -> Result<Vec<Row>> {
        self.sets
            .pop_front()
            .ok_or_else(|| Error::validation("no more result sets"))
    }

    /// Next set as records
    pub fn read<T: FromRow>(&mut self) -> Result<Vec<T>> {
        map_rows(&self.read_rows()?)
    }

    /// First record of the next set
    pub fn read_first<T: FromRow>(&mut self) -> Result<Option<T>> {
        first(&self.read_rows()?)
    }
}

struct Cursor {
    rows: RowStream,
    lease: Option<ConnectionLease>,
    cancellation: CancellationToken,
    finished: bool,
}

impl Cursor {
    async fn finish(&mut self) {
        self.finished = true;
        self.rows = stream::empty().boxed();
        if let Some(lease) = self.lease.take() {
            if let Err(e) = lease.release().await {
                warn!(error = %e, "Failed to release streaming connection");
            }
        }
    }
}

/// Lazy, single-pass stream of records.
///
/// Holds the server cursor and the connection lease until the stream is
/// exhausted, fails, is cancelled or is dropped. On cancellation the lease is
/// released before [`Error::Cancelled`] is yielded; nothing follows it.
pub struct RecordStream<T> {
    inner: BoxStream<'static, Result<T>>,
}

impl<T> std::fmt::Debug for RecordStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStream").finish_non_exhaustive()
    }
}

impl<T: FromRow + Send + 'static> RecordStream<T> {
    /// Stream `rows`, releasing `lease` when the stream ends
    pub fn new(rows: RowStream, lease: ConnectionLease, cancellation: CancellationToken) -> Self {
        let cursor = Cursor {
            rows,
            lease: Some(lease),
            cancellation,
            finished: false,
        };

        let inner = stream::unfold(cursor, |mut cursor| async move {
            if cursor.finished {
                return None;
            }

            let next = tokio::select! {
                biased;
                _ = cursor.cancellation.cancelled() => Some(Err(Error::Cancelled)),
                row = cursor.rows.next() => row.map(|r| r.and_then(|row| T::from_row(&row))),
            };

            match next {
                Some(Ok(record)) => Some((Ok(record), cursor)),
                Some(Err(e)) => {
                    cursor.finish().await;
                    Some((Err(e), cursor))
                }
                None => {
                    cursor.finish().await;
                    None
                }
            }
        })
        .boxed();

        Self { inner }
    }
}

impl<T> Stream for RecordStream<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}
