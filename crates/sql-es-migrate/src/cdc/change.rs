//! Change-indicator sources.

use crate::core::SqlValue;
use crate::error::{MigrateError, Result};
use crate::mapping::{IndicatorKind, MappingConfiguration};
use crate::source::SourceQuery;

/// Selects source rows changed since a watermark.
///
/// Timestamp columns and log positions (SCN, LSN, sequence numbers) differ
/// only in the values they accept; both filter on one ordered column.
pub trait ChangeSource: Send + Sync {
    /// Column compared against the watermark.
    fn indicator(&self) -> &str;

    /// Rows with an indicator greater than `watermark`, ascending. With no
    /// watermark every row with a non-null indicator qualifies.
    fn changes_since(&self, base_sql: &str, watermark: Option<&SqlValue>) -> SourceQuery;

    /// Whether `value` can serve as a watermark for this source.
    fn accepts(&self, value: &SqlValue) -> bool;
}

/// A single ordered column of the source query.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnChangeSource {
    column: String,
    kind: IndicatorKind,
}

impl ColumnChangeSource {
    pub fn new(column: &str, kind: IndicatorKind) -> Self {
        Self {
            column: column.to_string(),
            kind,
        }
    }

    /// The mapping's change tracking settings.
    pub fn for_mapping(mapping: &MappingConfiguration) -> Result<Self> {
        let tracking = mapping.change_tracking.as_ref().ok_or_else(|| {
            MigrateError::Config(format!(
                "mapping '{}' has no change_tracking column",
                mapping.name
            ))
        })?;
        if tracking.column.trim().is_empty() {
            return Err(MigrateError::Config(format!(
                "mapping '{}': change_tracking column is empty",
                mapping.name
            )));
        }
        Ok(Self::new(tracking.column.trim(), tracking.kind))
    }

    pub fn kind(&self) -> IndicatorKind {
        self.kind
    }

    /// Fail when a value read from the indicator column is unusable.
    pub fn check(&self, value: &SqlValue) -> Result<()> {
        if self.accepts(value) {
            return Ok(());
        }
        Err(MigrateError::Config(format!(
            "change indicator '{}' yielded a {} value, which is not a valid {}",
            self.column,
            value.type_name(),
            match self.kind {
                IndicatorKind::Timestamp => "timestamp",
                IndicatorKind::LogPosition => "log position",
            }
        )))
    }
}

impl ChangeSource for ColumnChangeSource {
    fn indicator(&self) -> &str {
        &self.column
    }

    fn changes_since(&self, base_sql: &str, watermark: Option<&SqlValue>) -> SourceQuery {
        SourceQuery::new(base_sql).changed_after(&self.column, watermark.cloned())
    }

    fn accepts(&self, value: &SqlValue) -> bool {
        match self.kind {
            IndicatorKind::Timestamp => matches!(
                value,
                SqlValue::Date(_) | SqlValue::DateTime(_) | SqlValue::DateTimeOffset(_) | SqlValue::Text(_)
            ),
            IndicatorKind::LogPosition => {
                matches!(value, SqlValue::I64(_) | SqlValue::Decimal(_))
            }
        }
    }
}
