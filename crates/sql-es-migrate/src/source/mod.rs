//! Relational source operations.
//!
//! A source runs one query and streams its rows forward-only in chunks. A
//! cursor cannot be rewound; a new run re-executes the query.

mod memory;
mod postgres;

pub use memory::MemorySource;
pub use postgres::PostgresSource;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{Row, SqlValue};
use crate::error::Result;

/// A result column as reported by the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceField {
    pub name: String,
    /// Declared type, e.g. `VARCHAR(50)` or `numeric`.
    pub declared_type: String,
}

impl SourceField {
    pub fn new(name: &str, declared_type: &str) -> Self {
        Self {
            name: name.to_string(),
            declared_type: declared_type.to_string(),
        }
    }
}

/// Restricts a query to rows changed after a watermark, ordered by the indicator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeFilter {
    pub column: String,
    /// Exclusive lower bound. `None` selects every row (first sync).
    pub after: Option<SqlValue>,
}

/// A query plus the shaping the engine applies around it.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceQuery {
    pub sql: String,
    pub change_filter: Option<ChangeFilter>,
    /// Count distinct values of this column instead of rows (grouped mappings).
    pub distinct_key: Option<String>,
}

impl SourceQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            change_filter: None,
            distinct_key: None,
        }
    }

    pub fn changed_after(mut self, column: &str, after: Option<SqlValue>) -> Self {
        self.change_filter = Some(ChangeFilter {
            column: column.to_string(),
            after,
        });
        self
    }

    pub fn counting_distinct(mut self, key: Option<&str>) -> Self {
        self.distinct_key = key.map(str::to_string);
        self
    }

    /// Base query with a trailing semicolon removed, safe to wrap as a subquery.
    pub fn base_sql(&self) -> &str {
        self.sql.trim().trim_end_matches(';').trim_end()
    }
}

/// Forward-only chunked row stream.
#[async_trait]
pub trait RowCursor: Send {
    /// Next chunk of rows, or `None` once the result set is exhausted.
    async fn next_chunk(&mut self) -> Result<Option<Vec<Row>>>;
}

/// Trait for source system operations.
#[async_trait]
pub trait SourceSystem: Send + Sync {
    /// Execute the query and stream at most `chunk_size` rows per chunk.
    async fn open_cursor(&self, query: &SourceQuery, chunk_size: usize) -> Result<Box<dyn RowCursor>>;

    /// Count the rows (or distinct keys) the query would return.
    /// `None` when a count is not cheaply obtainable.
    async fn count(&self, query: &SourceQuery) -> Result<Option<u64>>;

    /// Result columns of a query without fetching rows.
    async fn describe(&self, sql: &str) -> Result<Vec<SourceField>>;

    /// Check that the source is reachable.
    async fn ping(&self) -> Result<()>;

    /// Get the system type.
    fn system_type(&self) -> &str;
}

/// Quote a PostgreSQL identifier.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_sql_strips_semicolon() {
        let q = SourceQuery::new("  SELECT * FROM orders ;  ");
        assert_eq!(q.base_sql(), "SELECT * FROM orders");
    }

    #[test]
    fn test_query_builders() {
        let q = SourceQuery::new("SELECT 1")
            .changed_after("updated_at", Some(SqlValue::I64(5)))
            .counting_distinct(Some("order_id"));
        assert_eq!(q.change_filter.unwrap().column, "updated_at");
        assert_eq!(q.distinct_key.as_deref(), Some("order_id"));
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("Order\"Id"), "\"Order\"\"Id\"");
    }
}
