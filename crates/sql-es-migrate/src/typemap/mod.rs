//! Type mapping from relational column types to search-index field types.
//!
//! The mapper is a pure function of the declared type (plus an optional column
//! name hint): it returns candidate target types ordered by confidence.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Target index field types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Keyword,
    Text,
    Long,
    Integer,
    Short,
    Byte,
    Double,
    Float,
    ScaledFloat,
    Boolean,
    Date,
    Binary,
    Object,
    Nested,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Keyword => "keyword",
            FieldType::Text => "text",
            FieldType::Long => "long",
            FieldType::Integer => "integer",
            FieldType::Short => "short",
            FieldType::Byte => "byte",
            FieldType::Double => "double",
            FieldType::Float => "float",
            FieldType::ScaledFloat => "scaled_float",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Binary => "binary",
            FieldType::Object => "object",
            FieldType::Nested => "nested",
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            FieldType::Long | FieldType::Integer | FieldType::Short | FieldType::Byte
        )
    }

    pub fn is_floating(&self) -> bool {
        matches!(
            self,
            FieldType::Double | FieldType::Float | FieldType::ScaledFloat
        )
    }

    pub fn is_string(&self) -> bool {
        matches!(self, FieldType::Keyword | FieldType::Text)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "keyword" => Ok(FieldType::Keyword),
            "text" => Ok(FieldType::Text),
            "long" => Ok(FieldType::Long),
            "integer" => Ok(FieldType::Integer),
            "short" => Ok(FieldType::Short),
            "byte" => Ok(FieldType::Byte),
            "double" => Ok(FieldType::Double),
            "float" | "half_float" => Ok(FieldType::Float),
            "scaled_float" => Ok(FieldType::ScaledFloat),
            "boolean" => Ok(FieldType::Boolean),
            "date" | "date_nanos" => Ok(FieldType::Date),
            "binary" => Ok(FieldType::Binary),
            "object" => Ok(FieldType::Object),
            "nested" => Ok(FieldType::Nested),
            other => Err(format!("unknown field type '{}'", other)),
        }
    }
}

/// Thresholds for the mapping policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeMapperConfig {
    /// Character columns up to this length map to `keyword`.
    #[serde(default = "default_short_text_max_length")]
    pub short_text_max_length: u32,

    /// Confidence for large objects stays below this value.
    #[serde(default = "default_large_object_ceiling")]
    pub large_object_ceiling: u8,

    /// Decimal scales above this lose confidence as `scaled_float`.
    #[serde(default = "default_max_safe_scale")]
    pub max_safe_scale: u32,
}

impl Default for TypeMapperConfig {
    fn default() -> Self {
        Self {
            short_text_max_length: default_short_text_max_length(),
            large_object_ceiling: default_large_object_ceiling(),
            max_safe_scale: default_max_safe_scale(),
        }
    }
}

fn default_short_text_max_length() -> u32 {
    256
}

fn default_large_object_ceiling() -> u8 {
    50
}

fn default_max_safe_scale() -> u32 {
    6
}

/// A parsed source column type such as `NUMBER(10,2)` or `VARCHAR2(50 CHAR)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnType {
    /// Upper-cased base name, modifiers after the parentheses included
    /// (`TIMESTAMP WITH TIME ZONE`).
    pub base: String,
    pub length: Option<u32>,
    pub precision: Option<u32>,
    pub scale: Option<i32>,
}

impl ColumnType {
    /// Parse a declared type string.
    pub fn parse(declared: &str) -> Self {
        let declared = declared.trim();
        let (base, args) = match (declared.find('('), declared.rfind(')')) {
            (Some(open), Some(close)) if close > open => {
                let before = declared[..open].trim();
                let after = declared[close + 1..].trim();
                let base = if after.is_empty() {
                    before.to_string()
                } else {
                    format!("{} {}", before, after)
                };
                (base, Some(&declared[open + 1..close]))
            }
            _ => (declared.to_string(), None),
        };
        let base = base
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_uppercase();

        let numbers: Vec<Option<i64>> = args
            .map(|a| {
                a.split(',')
                    .map(|part| {
                        part.split_whitespace()
                            .next()
                            .and_then(|n| n.parse::<i64>().ok())
                    })
                    .collect()
            })
            .unwrap_or_default();
        let first = numbers.first().copied().flatten();
        let second = numbers.get(1).copied().flatten();

        let mut column = ColumnType {
            base,
            length: None,
            precision: None,
            scale: None,
        };
        match classify(&column.base) {
            TypeClass::Char | TypeClass::SmallBinary => {
                column.length = first.and_then(|n| u32::try_from(n).ok());
            }
            TypeClass::Numeric => {
                column.precision = first.and_then(|n| u32::try_from(n).ok());
                column.scale = match (first, second) {
                    (_, Some(s)) => i32::try_from(s).ok(),
                    (Some(_), None) => Some(0),
                    (None, None) => None,
                };
            }
            _ => {}
        }
        column
    }

    /// Build from separately reported metadata (catalog queries).
    pub fn from_parts(
        base: &str,
        length: Option<u32>,
        precision: Option<u32>,
        scale: Option<i32>,
    ) -> Self {
        Self {
            base: base.trim().to_uppercase(),
            length,
            precision,
            scale,
        }
    }

    /// Scaling factor for a `scaled_float` target (10^scale).
    pub fn scaling_factor(&self) -> Option<f64> {
        match self.scale {
            Some(s) if s > 0 => Some(10f64.powi(s)),
            _ => None,
        }
    }

    pub fn class(&self) -> TypeClass {
        classify(&self.base)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.length, self.precision, self.scale) {
            (Some(l), _, _) => write!(f, "{}({})", self.base, l),
            (None, Some(p), Some(s)) => write!(f, "{}({},{})", self.base, p, s),
            (None, Some(p), None) => write!(f, "{}({})", self.base, p),
            _ => f.write_str(&self.base),
        }
    }
}

/// Coarse family of a source type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeClass {
    Char,
    Integer,
    Numeric,
    Float,
    Double,
    Boolean,
    Temporal,
    TimeOfDay,
    LargeText,
    LargeBinary,
    SmallBinary,
    Json,
    Uuid,
    Unknown,
}

fn classify(base: &str) -> TypeClass {
    match base {
        "CHAR" | "NCHAR" | "VARCHAR" | "VARCHAR2" | "NVARCHAR" | "NVARCHAR2" | "CHARACTER"
        | "CHARACTER VARYING" | "BPCHAR" | "STRING" | "CITEXT" => TypeClass::Char,
        "INTEGER" | "INT" | "SMALLINT" | "BIGINT" | "TINYINT" | "INT2" | "INT4" | "INT8"
        | "SERIAL" | "BIGSERIAL" | "SMALLSERIAL" | "PLS_INTEGER" | "BINARY_INTEGER" => {
            TypeClass::Integer
        }
        "NUMBER" | "NUMERIC" | "DECIMAL" | "DEC" | "MONEY" => TypeClass::Numeric,
        "REAL" | "FLOAT4" | "BINARY_FLOAT" => TypeClass::Float,
        "FLOAT" | "FLOAT8" | "DOUBLE" | "DOUBLE PRECISION" | "BINARY_DOUBLE" => TypeClass::Double,
        "BOOLEAN" | "BOOL" | "BIT" => TypeClass::Boolean,
        "TIME" | "TIME WITHOUT TIME ZONE" | "TIME WITH TIME ZONE" | "TIMETZ" => {
            TypeClass::TimeOfDay
        }
        "CLOB" | "NCLOB" | "TEXT" | "NTEXT" | "LONG" | "MEDIUMTEXT" | "LONGTEXT" | "XMLTYPE" => {
            TypeClass::LargeText
        }
        "BLOB" | "BFILE" | "LONG RAW" | "BYTEA" | "IMAGE" | "LONGBLOB" => TypeClass::LargeBinary,
        "RAW" | "BINARY" | "VARBINARY" => TypeClass::SmallBinary,
        "JSON" | "JSONB" => TypeClass::Json,
        "UUID" | "UNIQUEIDENTIFIER" => TypeClass::Uuid,
        other if other.starts_with("TIMESTAMP")
            || other.starts_with("DATETIME")
            || other == "DATE"
            || other == "SMALLDATETIME"
            || other == "TIMESTAMPTZ" =>
        {
            TypeClass::Temporal
        }
        _ => TypeClass::Unknown,
    }
}

/// One candidate target type with its confidence (0-100).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeCandidate {
    pub field_type: FieldType,
    pub confidence: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl TypeCandidate {
    pub fn new(field_type: FieldType, confidence: u8) -> Self {
        Self {
            field_type,
            confidence: confidence.min(100),
            note: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

const FREE_TEXT_HINTS: &[&str] = &[
    "description",
    "desc",
    "comment",
    "comments",
    "note",
    "notes",
    "remarks",
    "body",
    "summary",
    "message",
    "content",
    "details",
];

const UTC_NOTE: &str = "timezone must be normalized to UTC";

/// Maps declared source types to ordered target type candidates.
#[derive(Debug, Clone, Default)]
pub struct TypeMapper {
    config: TypeMapperConfig,
}

impl TypeMapper {
    pub fn new(config: TypeMapperConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TypeMapperConfig {
        &self.config
    }

    /// Parse and map a declared type string.
    pub fn map_declared(&self, declared: &str, column_name: Option<&str>) -> Vec<TypeCandidate> {
        self.map(&ColumnType::parse(declared), column_name)
    }

    /// Candidate target types for a column, highest confidence first.
    pub fn map(&self, column: &ColumnType, column_name: Option<&str>) -> Vec<TypeCandidate> {
        let cfg = &self.config;
        let capped = |c: u8| c.min(cfg.large_object_ceiling.saturating_sub(1));
        let mut candidates = match column.class() {
            TypeClass::Char => {
                let implicit = match column.base.as_str() {
                    "CHAR" | "NCHAR" | "CHARACTER" | "BPCHAR" => 1,
                    _ => u32::MAX,
                };
                let length = column.length.unwrap_or(implicit);
                let free_text = column_name.map(has_free_text_signal).unwrap_or(false);
                if length <= cfg.short_text_max_length && !free_text {
                    vec![TypeCandidate::new(FieldType::Keyword, 90)]
                } else {
                    vec![
                        TypeCandidate::new(FieldType::Text, 85),
                        TypeCandidate::new(FieldType::Keyword, 60)
                            .with_note("exact-match sub-field for sorting and aggregation"),
                    ]
                }
            }
            TypeClass::Integer => match column.base.as_str() {
                "SMALLINT" | "INT2" | "TINYINT" | "SMALLSERIAL" => vec![
                    TypeCandidate::new(FieldType::Short, 95),
                    TypeCandidate::new(FieldType::Integer, 85),
                ],
                "INTEGER" | "INT" | "INT4" | "SERIAL" | "PLS_INTEGER" | "BINARY_INTEGER" => vec![
                    TypeCandidate::new(FieldType::Integer, 95),
                    TypeCandidate::new(FieldType::Long, 85),
                ],
                _ => vec![TypeCandidate::new(FieldType::Long, 95)],
            },
            TypeClass::Numeric => self.map_numeric(column),
            TypeClass::Float => vec![
                TypeCandidate::new(FieldType::Float, 90),
                TypeCandidate::new(FieldType::Double, 80),
            ],
            TypeClass::Double => vec![TypeCandidate::new(FieldType::Double, 90)],
            TypeClass::Boolean => vec![TypeCandidate::new(FieldType::Boolean, 95)],
            TypeClass::Temporal => {
                vec![TypeCandidate::new(FieldType::Date, 90).with_note(UTC_NOTE)]
            }
            TypeClass::TimeOfDay => vec![TypeCandidate::new(FieldType::Keyword, 60)
                .with_note("time of day without a date component")],
            TypeClass::LargeText => vec![
                TypeCandidate::new(FieldType::Text, capped(85)).with_note(
                    "large object: review manually; oversized values are truncated with a marker",
                ),
            ],
            TypeClass::LargeBinary => vec![TypeCandidate::new(FieldType::Binary, capped(80))
                .with_note("large object: review manually")],
            TypeClass::SmallBinary => vec![TypeCandidate::new(FieldType::Binary, 70)],
            TypeClass::Json => vec![
                TypeCandidate::new(FieldType::Object, 70),
                TypeCandidate::new(FieldType::Text, 40),
            ],
            TypeClass::Uuid => vec![TypeCandidate::new(FieldType::Keyword, 90)],
            TypeClass::Unknown => vec![
                TypeCandidate::new(FieldType::Text, 10)
                    .with_note(format!("unrecognized source type {}", column.base)),
                TypeCandidate::new(FieldType::Binary, 5),
            ],
        };
        // Stable: equal confidences keep policy order.
        candidates.sort_by(|a, b| b.confidence.cmp(&a.confidence));
        candidates
    }

    fn map_numeric(&self, column: &ColumnType) -> Vec<TypeCandidate> {
        match (column.precision, column.scale) {
            (None, None) => vec![
                TypeCandidate::new(FieldType::Double, 70)
                    .with_note("unconstrained numeric; confirm scale"),
                TypeCandidate::new(FieldType::Long, 50),
            ],
            (_, Some(scale)) if scale > 0 => {
                let safe = u32::try_from(scale)
                    .map(|s| s <= self.config.max_safe_scale)
                    .unwrap_or(false);
                if safe {
                    vec![
                        TypeCandidate::new(FieldType::ScaledFloat, 85),
                        TypeCandidate::new(FieldType::Double, 70),
                    ]
                } else {
                    vec![
                        TypeCandidate::new(FieldType::ScaledFloat, 60).with_note(format!(
                            "scale {} exceeds safe precision {}",
                            scale, self.config.max_safe_scale
                        )),
                        TypeCandidate::new(FieldType::Double, 50),
                    ]
                }
            }
            (precision, _) => match precision {
                Some(p) if p <= 9 => vec![
                    TypeCandidate::new(FieldType::Integer, 95),
                    TypeCandidate::new(FieldType::Long, 80),
                ],
                Some(p) if p > 18 => vec![
                    TypeCandidate::new(FieldType::Long, 70)
                        .with_note(format!("precision {} exceeds the 64-bit range", p)),
                    TypeCandidate::new(FieldType::Keyword, 50),
                ],
                _ => vec![TypeCandidate::new(FieldType::Long, 95)],
            },
        }
    }
}

/// Whether a column name suggests free text (`order_notes`, `productDescription`).
pub fn has_free_text_signal(column_name: &str) -> bool {
    name_tokens(column_name)
        .iter()
        .any(|t| FREE_TEXT_HINTS.contains(&t.as_str()))
}

/// Split a column name on underscores, dashes, dots and camel-case boundaries.
pub fn name_tokens(name: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for ch in name.chars() {
        if ch == '_' || ch == '-' || ch == '.' || ch.is_whitespace() {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if ch.is_uppercase() && prev_lower && !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
        prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        current.extend(ch.to_lowercase());
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Whether a source column type can be stored in a target field type.
pub fn is_compatible(column: &ColumnType, target: FieldType) -> bool {
    match column.class() {
        TypeClass::Char => target.is_string(),
        TypeClass::Integer | TypeClass::Numeric => {
            target.is_integer() || target.is_floating() || target == FieldType::Keyword
        }
        TypeClass::Float | TypeClass::Double => target.is_floating(),
        TypeClass::Boolean => matches!(target, FieldType::Boolean | FieldType::Keyword),
        TypeClass::Temporal => target == FieldType::Date,
        TypeClass::TimeOfDay => target.is_string(),
        TypeClass::LargeText => target == FieldType::Text,
        TypeClass::LargeBinary | TypeClass::SmallBinary => target == FieldType::Binary,
        TypeClass::Json => matches!(
            target,
            FieldType::Object | FieldType::Nested | FieldType::Text
        ),
        TypeClass::Uuid => target.is_string(),
        TypeClass::Unknown => target.is_string() || target == FieldType::Binary,
    }
}
