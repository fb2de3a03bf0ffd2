//! Folding correlated rows into source records.
//!
//! The source query must return rows ordered by the parent key. A group can
//! straddle a chunk boundary, so the trailing group of each chunk is held
//! back until the next chunk (or the end of the stream) proves it complete.

use crate::core::{Row, SqlValue};

/// The unit of transformation: one row, or every row of one parent key.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub rows: Vec<Row>,
}

impl SourceRecord {
    pub fn single(row: Row) -> Self {
        Self { rows: vec![row] }
    }

    /// The parent (first) row.
    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }
}

/// Streams rows into records.
#[derive(Debug, Default)]
pub struct RowGrouper {
    parent_key: Option<String>,
    pending: Vec<Row>,
    pending_key: Option<SqlValue>,
}

impl RowGrouper {
    /// `None` means every row is its own record.
    pub fn new(parent_key: Option<String>) -> Self {
        Self {
            parent_key,
            pending: Vec::new(),
            pending_key: None,
        }
    }

    /// Add a chunk and return every record known to be complete.
    pub fn push_batch(&mut self, rows: Vec<Row>) -> Vec<SourceRecord> {
        let key_column = match &self.parent_key {
            Some(k) => k.clone(),
            None => return rows.into_iter().map(SourceRecord::single).collect(),
        };

        let mut out = Vec::new();
        for row in rows {
            let key = row.get(&key_column).cloned().unwrap_or(SqlValue::Null);
            // NULL keys never correlate with anything.
            let same_group = !key.is_null() && self.pending_key.as_ref() == Some(&key);
            if !same_group && !self.pending.is_empty() {
                out.push(SourceRecord {
                    rows: std::mem::take(&mut self.pending),
                });
            }
            self.pending_key = Some(key);
            self.pending.push(row);
        }
        out
    }

    /// Flush the held-back group at end of stream.
    pub fn finish(&mut self) -> Option<SourceRecord> {
        self.pending_key = None;
        if self.pending.is_empty() {
            None
        } else {
            Some(SourceRecord {
                rows: std::mem::take(&mut self.pending),
            })
        }
    }

    /// Rows currently held back.
    pub fn pending_rows(&self) -> usize {
        self.pending.len()
    }
}
