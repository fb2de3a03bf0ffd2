//! Core data types shared by every pipeline stage.
//!
//! - [`value`]: typed source values and rows as read from the relational side
//! - [`document`]: target documents and dotted-path helpers for the search side
//!
//! Source rows carry their column names so a row can be dead-lettered and
//! later reprocessed without the original cursor metadata.

pub mod document;
pub mod value;

pub use document::{get_path, is_valid_path, remove_path, set_path, Document};
pub use value::{Batch, Row, SqlValue};
