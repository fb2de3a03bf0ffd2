//! SQL value types for source rows.
//!
//! Values are owned so rows can cross task boundaries through the bounded
//! extraction queue and be serialized verbatim into dead-letter records.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single typed value read from the source.
///
/// The serialized form is tagged (`{"type": "decimal", "value": "12.50"}`) so a
/// round trip through the dead-letter store preserves the original type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SqlValue {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    Decimal(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    /// Timestamp without timezone.
    DateTime(NaiveDateTime),
    /// Timestamp with timezone offset.
    DateTimeOffset(DateTime<FixedOffset>),
}

impl SqlValue {
    /// Check if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Short type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Bool(_) => "bool",
            SqlValue::I64(_) => "integer",
            SqlValue::F64(_) => "float",
            SqlValue::Decimal(_) => "decimal",
            SqlValue::Text(_) => "text",
            SqlValue::Bytes(_) => "bytes",
            SqlValue::Uuid(_) => "uuid",
            SqlValue::Date(_) => "date",
            SqlValue::Time(_) => "time",
            SqlValue::DateTime(_) => "timestamp",
            SqlValue::DateTimeOffset(_) => "timestamptz",
        }
    }

    /// Render as a plain string for keys and text fields. `None` for NULL.
    ///
    /// Timestamps without an offset are assumed to be UTC.
    pub fn key_string(&self) -> Option<String> {
        match self {
            SqlValue::Null => None,
            SqlValue::Bool(v) => Some(v.to_string()),
            SqlValue::I64(v) => Some(v.to_string()),
            SqlValue::F64(v) => Some(v.to_string()),
            SqlValue::Decimal(v) => Some(v.normalize().to_string()),
            SqlValue::Text(v) => Some(v.clone()),
            SqlValue::Bytes(v) => Some(BASE64_STANDARD.encode(v)),
            SqlValue::Uuid(v) => Some(v.to_string()),
            SqlValue::Date(v) => Some(v.format("%Y-%m-%d").to_string()),
            SqlValue::Time(v) => Some(v.format("%H:%M:%S%.f").to_string()),
            SqlValue::DateTime(v) => {
                Some(v.and_utc().to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            SqlValue::DateTimeOffset(v) => Some(
                v.with_timezone(&Utc)
                    .to_rfc3339_opts(SecondsFormat::AutoSi, true),
            ),
        }
    }

    /// Convert to an untyped JSON value for display (preview, dead-letter listings).
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            SqlValue::Null => Value::Null,
            SqlValue::Bool(v) => Value::Bool(*v),
            SqlValue::I64(v) => Value::from(*v),
            SqlValue::F64(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            SqlValue::Decimal(v) => v
                .to_f64()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(v.to_string())),
            other => other
                .key_string()
                .map(Value::String)
                .unwrap_or(Value::Null),
        }
    }
}

impl SqlValue {
    /// Order two change-indicator values. Numbers compare across integer,
    /// float and decimal; timestamps compare in UTC. `None` when the kinds
    /// are not comparable or either side is NULL.
    pub fn compare(&self, other: &SqlValue) -> Option<Ordering> {
        use SqlValue as V;
        match (self, other) {
            (V::Null, _) | (_, V::Null) => None,
            (V::I64(a), V::I64(b)) => Some(a.cmp(b)),
            (V::Decimal(a), V::Decimal(b)) => Some(a.cmp(b)),
            (V::I64(a), V::Decimal(b)) => Some(rust_decimal::Decimal::from(*a).cmp(b)),
            (V::Decimal(a), V::I64(b)) => Some(a.cmp(&rust_decimal::Decimal::from(*b))),
            (a @ (V::I64(_) | V::F64(_) | V::Decimal(_)), b @ (V::I64(_) | V::F64(_) | V::Decimal(_))) => {
                a.as_f64()?.partial_cmp(&b.as_f64()?)
            }
            (V::Text(a), V::Text(b)) => Some(a.cmp(b)),
            (V::Bool(a), V::Bool(b)) => Some(a.cmp(b)),
            (V::Uuid(a), V::Uuid(b)) => Some(a.cmp(b)),
            (V::Date(a), V::Date(b)) => Some(a.cmp(b)),
            (V::Time(a), V::Time(b)) => Some(a.cmp(b)),
            (a @ (V::DateTime(_) | V::DateTimeOffset(_)), b @ (V::DateTime(_) | V::DateTimeOffset(_))) => {
                Some(a.as_utc()?.cmp(&b.as_utc()?))
            }
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::I64(v) => Some(*v as f64),
            SqlValue::F64(v) => Some(*v),
            SqlValue::Decimal(v) => v.to_f64(),
            _ => None,
        }
    }

    fn as_utc(&self) -> Option<DateTime<Utc>> {
        match self {
            SqlValue::DateTime(v) => Some(v.and_utc()),
            SqlValue::DateTimeOffset(v) => Some(v.with_timezone(&Utc)),
            _ => None,
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key_string() {
            Some(s) => f.write_str(&s),
            None => f.write_str("NULL"),
        }
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::I64(i64::from(v))
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::I64(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::F64(v)
    }
}

impl From<Decimal> for SqlValue {
    fn from(v: Decimal) -> Self {
        SqlValue::Decimal(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<NaiveDate> for SqlValue {
    fn from(v: NaiveDate) -> Self {
        SqlValue::Date(v)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(v: NaiveDateTime) -> Self {
        SqlValue::DateTime(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// One source row: column names shared across the chunk plus owned values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    columns: Arc<Vec<String>>,
    values: Vec<SqlValue>,
}

impl Row {
    /// Create a row. `values` must line up with `columns`.
    pub fn new(columns: Arc<Vec<String>>, values: Vec<SqlValue>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Build a row from `(column, value)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<SqlValue>,
    {
        let (columns, values): (Vec<String>, Vec<SqlValue>) = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .unzip();
        Self::new(Arc::new(columns), values)
    }

    /// Look up a column value. Exact match first, then case-insensitive.
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        let idx = self
            .columns
            .iter()
            .position(|c| c == column)
            .or_else(|| {
                self.columns
                    .iter()
                    .position(|c| c.eq_ignore_ascii_case(column))
            })?;
        self.values.get(idx)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    /// Untyped JSON object view of the row.
    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_json()))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }
}

/// A chunk of rows handed from the extraction stage to the consumer.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    /// Row data.
    pub rows: Vec<Row>,
    /// Zero-based position of this batch within the run.
    pub sequence: u64,
}

impl Batch {
    /// Create a new batch with the given rows.
    pub fn new(rows: Vec<Row>, sequence: u64) -> Self {
        Self { rows, sequence }
    }

    /// Get the number of rows in this batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
