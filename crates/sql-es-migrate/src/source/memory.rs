//! In-memory source.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;

use super::{RowCursor, SourceField, SourceQuery, SourceSystem};
use crate::config::MemorySourceConfig;
use crate::core::{Row, SqlValue};
use crate::error::{MigrateError, Result};
use crate::typemap::{ColumnType, TypeClass};

/// Fixed rows served for any query. Supports change filters, distinct counts
/// and scripted failures.
pub struct MemorySource {
    fields: Vec<SourceField>,
    columns: Arc<Vec<String>>,
    rows: Mutex<Vec<Row>>,
    count_available: bool,
    fail_open: Mutex<Option<String>>,
    /// Fail the cursor after this many chunks.
    fail_after_chunks: Mutex<Option<usize>>,
    opened: AtomicUsize,
}

impl MemorySource {
    pub fn new(fields: Vec<SourceField>, rows: Vec<Row>) -> Self {
        let columns = Arc::new(fields.iter().map(|f| f.name.clone()).collect());
        Self {
            fields,
            columns,
            rows: Mutex::new(rows),
            count_available: true,
            fail_open: Mutex::new(None),
            fail_after_chunks: Mutex::new(None),
            opened: AtomicUsize::new(0),
        }
    }

    /// Build from inline YAML rows, converting JSON values by declared type.
    pub fn from_config(config: &MemorySourceConfig) -> Result<Self> {
        let fields: Vec<SourceField> = config
            .columns
            .iter()
            .map(|c| SourceField::new(&c.name, &c.declared_type))
            .collect();
        let columns = Arc::new(fields.iter().map(|f| f.name.clone()).collect::<Vec<_>>());
        let rows = config
            .rows
            .iter()
            .map(|values| {
                let values = values
                    .iter()
                    .zip(&fields)
                    .map(|(v, f)| json_to_sql(v, &f.declared_type))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Row::new(columns.clone(), values))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(fields, rows))
    }

    /// Report counts as unavailable (degraded progress mode).
    pub fn without_count(mut self) -> Self {
        self.count_available = false;
        self
    }

    /// Make the next `open_cursor` calls fail with a connectivity error.
    pub fn fail_open(&self, message: Option<&str>) {
        if let Ok(mut guard) = self.fail_open.lock() {
            *guard = message.map(str::to_string);
        }
    }

    /// Make cursors fail after serving `chunks` chunks.
    pub fn fail_after_chunks(&self, chunks: Option<usize>) {
        if let Ok(mut guard) = self.fail_after_chunks.lock() {
            *guard = chunks;
        }
    }

    /// Append a row, or replace the row whose `key` column matches.
    pub fn upsert_row(&self, key: &str, row: Row) {
        if let Ok(mut rows) = self.rows.lock() {
            let existing = row.get(key).and_then(|k| {
                rows.iter()
                    .position(|r| r.get(key) == Some(k) && !k.is_null())
            });
            match existing {
                Some(idx) => rows[idx] = row,
                None => rows.push(row),
            }
        }
    }

    /// Row from `(column, value)` pairs, reordered to this source's columns.
    pub fn row<I, K, V>(&self, pairs: I) -> Row
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<SqlValue>,
    {
        let given = Row::from_pairs(pairs);
        let values = self
            .columns
            .iter()
            .map(|c| given.get(c).cloned().unwrap_or(SqlValue::Null))
            .collect();
        Row::new(self.columns.clone(), values)
    }

    /// Number of cursors opened so far.
    pub fn cursors_opened(&self) -> usize {
        self.opened.load(AtomicOrdering::SeqCst)
    }

    fn select(&self, query: &SourceQuery) -> Result<Vec<Row>> {
        let rows = self
            .rows
            .lock()
            .map_err(|_| MigrateError::connectivity("source", "memory source poisoned"))?
            .clone();
        let Some(filter) = &query.change_filter else {
            return Ok(rows);
        };
        let mut selected: Vec<Row> = rows
            .into_iter()
            .filter(|r| match (r.get(&filter.column), &filter.after) {
                (Some(v), Some(after)) => v.compare(after) == Some(std::cmp::Ordering::Greater),
                (Some(v), None) => !v.is_null(),
                (None, _) => false,
            })
            .collect();
        selected.sort_by(|a, b| {
            let (a, b) = (a.get(&filter.column), b.get(&filter.column));
            a.zip(b)
                .and_then(|(a, b)| a.compare(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(selected)
    }
}

#[async_trait]
impl SourceSystem for MemorySource {
    async fn open_cursor(&self, query: &SourceQuery, chunk_size: usize) -> Result<Box<dyn RowCursor>> {
        if let Some(message) = self.fail_open.lock().ok().and_then(|g| g.clone()) {
            return Err(MigrateError::connectivity("source", message));
        }
        self.opened.fetch_add(1, AtomicOrdering::SeqCst);
        let fail_after = self.fail_after_chunks.lock().ok().and_then(|g| *g);
        Ok(Box::new(MemoryCursor {
            rows: self.select(query)?.into_iter(),
            chunk_size: chunk_size.max(1),
            served: 0,
            fail_after,
        }))
    }

    async fn count(&self, query: &SourceQuery) -> Result<Option<u64>> {
        if !self.count_available {
            return Ok(None);
        }
        let rows = self.select(query)?;
        let count = match &query.distinct_key {
            Some(key) => rows
                .iter()
                .filter_map(|r| r.get(key).and_then(SqlValue::key_string))
                .collect::<HashSet<_>>()
                .len(),
            None => rows.len(),
        };
        Ok(Some(count as u64))
    }

    async fn describe(&self, _sql: &str) -> Result<Vec<SourceField>> {
        Ok(self.fields.clone())
    }

    async fn ping(&self) -> Result<()> {
        match self.fail_open.lock().ok().and_then(|g| g.clone()) {
            Some(message) => Err(MigrateError::connectivity("source", message)),
            None => Ok(()),
        }
    }

    fn system_type(&self) -> &str {
        "memory"
    }
}

struct MemoryCursor {
    rows: std::vec::IntoIter<Row>,
    chunk_size: usize,
    served: usize,
    fail_after: Option<usize>,
}

#[async_trait]
impl RowCursor for MemoryCursor {
    async fn next_chunk(&mut self) -> Result<Option<Vec<Row>>> {
        if self.fail_after.is_some_and(|n| self.served >= n) {
            return Err(MigrateError::connectivity("source", "connection reset by peer"));
        }
        let chunk: Vec<Row> = self.rows.by_ref().take(self.chunk_size).collect();
        if chunk.is_empty() {
            return Ok(None);
        }
        self.served += 1;
        Ok(Some(chunk))
    }
}

/// Convert an inline JSON value according to the declared column type.
fn json_to_sql(value: &Value, declared_type: &str) -> Result<SqlValue> {
    let bad = || {
        MigrateError::Config(format!(
            "inline value {} does not match column type {}",
            value, declared_type
        ))
    };
    if value.is_null() {
        return Ok(SqlValue::Null);
    }
    let column = ColumnType::parse(declared_type);
    let converted = match (column.class(), value) {
        (TypeClass::Integer, Value::Number(n)) => n.as_i64().map(SqlValue::I64),
        (TypeClass::Numeric, Value::Number(n)) if column.scale.unwrap_or(0) == 0 => {
            n.as_i64().map(SqlValue::I64)
        }
        (TypeClass::Numeric, v) => v
            .to_string()
            .trim_matches('"')
            .parse::<rust_decimal::Decimal>()
            .ok()
            .map(SqlValue::Decimal),
        (TypeClass::Float | TypeClass::Double, Value::Number(n)) => n.as_f64().map(SqlValue::F64),
        (TypeClass::Boolean, Value::Bool(b)) => Some(SqlValue::Bool(*b)),
        (TypeClass::Temporal, Value::String(s)) => parse_temporal(s, &column.base),
        (_, Value::String(s)) => Some(SqlValue::Text(s.clone())),
        (_, Value::Bool(b)) => Some(SqlValue::Bool(*b)),
        (_, Value::Number(n)) => n
            .as_i64()
            .map(SqlValue::I64)
            .or_else(|| n.as_f64().map(SqlValue::F64)),
        (_, other) => Some(SqlValue::Text(other.to_string())),
    };
    converted.ok_or_else(bad)
}

fn parse_temporal(s: &str, base: &str) -> Option<SqlValue> {
    if base == "DATE" {
        if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return Some(SqlValue::Date(d));
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(SqlValue::DateTimeOffset(dt));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(SqlValue::DateTime)
        .or_else(|| Some(SqlValue::Text(s.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ColumnDecl;
    use serde_json::json;

    fn source() -> MemorySource {
        let fields = vec![SourceField::new("ID", "INTEGER"), SourceField::new("V", "INTEGER")];
        let src = MemorySource::new(fields, vec![]);
        for (id, v) in [(1, 30), (2, 10), (3, 20)] {
            let row = src.row([("ID", SqlValue::I64(id)), ("V", SqlValue::I64(v))]);
            src.upsert_row("ID", row);
        }
        src
    }

    async fn drain(cursor: &mut Box<dyn RowCursor>) -> Vec<Vec<Row>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = cursor.next_chunk().await.unwrap() {
            chunks.push(chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn test_chunks_are_bounded() {
        let src = source();
        let mut cursor = src.open_cursor(&SourceQuery::new("q"), 2).await.unwrap();
        let chunks = drain(&mut cursor).await;
        assert_eq!(chunks.iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 1]);
        assert!(cursor.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_change_filter_orders_by_indicator() {
        let src = source();
        let q = SourceQuery::new("q").changed_after("V", Some(SqlValue::I64(10)));
        let mut cursor = src.open_cursor(&q, 10).await.unwrap();
        let rows = drain(&mut cursor).await.concat();
        let ids: Vec<_> = rows.iter().map(|r| r.get("ID").cloned().unwrap()).collect();
        assert_eq!(ids, vec![SqlValue::I64(3), SqlValue::I64(1)]);
        assert_eq!(src.count(&q).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_key() {
        let src = source();
        src.upsert_row("ID", src.row([("ID", 2i64), ("V", 99i64)]));
        assert_eq!(src.count(&SourceQuery::new("q")).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let src = source();
        src.fail_after_chunks(Some(1));
        let mut cursor = src.open_cursor(&SourceQuery::new("q"), 1).await.unwrap();
        assert!(cursor.next_chunk().await.is_ok());
        assert!(cursor.next_chunk().await.is_err());

        src.fail_open(Some("refused"));
        assert!(src.open_cursor(&SourceQuery::new("q"), 1).await.is_err());
        assert!(src.ping().await.is_err());
    }

    #[test]
    fn test_from_config_converts_by_type() {
        let config = MemorySourceConfig {
            columns: vec![
                ColumnDecl { name: "ID".into(), declared_type: "INTEGER".into() },
                ColumnDecl { name: "AMOUNT".into(), declared_type: "NUMERIC(10,2)".into() },
                ColumnDecl { name: "AT".into(), declared_type: "TIMESTAMP".into() },
                ColumnDecl { name: "NOTE".into(), declared_type: "VARCHAR(20)".into() },
            ],
            rows: vec![vec![json!(1), json!("12.50"), json!("2024-01-01 10:00:00"), json!(null)]],
        };
        let src = MemorySource::from_config(&config).unwrap();
        let rows = src.rows.lock().unwrap().clone();
        assert_eq!(rows[0].get("ID"), Some(&SqlValue::I64(1)));
        assert!(matches!(rows[0].get("AMOUNT"), Some(SqlValue::Decimal(_))));
        assert!(matches!(rows[0].get("AT"), Some(SqlValue::DateTime(_))));
        assert_eq!(rows[0].get("NOTE"), Some(&SqlValue::Null));
    }
}
