//! Source to target column type mapping.
//!
//! The mapping is a closed table: every source type name is normalized into
//! a [`SourceKind`] and each kind has exactly one [`TargetType`] rule. Names
//! that are not in the table fall into [`SourceKind::Unknown`], which maps to
//! `String`, so converting a schema never fails because of a type.
//!
//! Unsigned integer types keep their signed target (`int unsigned` becomes
//! `Int32`). Values above the signed range wrap when written.

use serde::{Deserialize, Serialize};
use std::fmt;

const DEFAULT_DECIMAL_PRECISION: u32 = 10;
const DEFAULT_DECIMAL_SCALE: u32 = 0;

/// Raw source column type as reported by introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceType {
    /// Type name, e.g. `decimal` or `varchar`. Case and modifiers are ignored.
    pub name: String,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
    pub length: Option<u64>,
    /// Labels of an `enum` or `set` column, in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<String>,
}

impl SourceType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            precision: None,
            scale: None,
            length: None,
            members: Vec::new(),
        }
    }

    pub fn with_precision(mut self, precision: u32, scale: u32) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }

    pub fn with_length(mut self, length: u64) -> Self {
        self.length = Some(length);
        self
    }

    pub fn with_members(mut self, members: Vec<String>) -> Self {
        self.members = members;
        self
    }

    pub fn kind(&self) -> SourceKind {
        SourceKind::from_name(&self.name)
    }
}

/// Normalized source type family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    TinyInt,
    SmallInt,
    MediumInt,
    Int,
    BigInt,
    Float,
    Double,
    Decimal,
    Bool,
    Bit,
    Year,
    Date,
    DateTime,
    Timestamp,
    Time,
    Char,
    VarChar,
    Text,
    Binary,
    Blob,
    Enum,
    Set,
    Json,
    Unknown,
}

impl SourceKind {
    /// Normalizes a type name such as `INT(11) UNSIGNED` or `varchar(255)`.
    pub fn from_name(name: &str) -> Self {
        let lowered = name.trim().to_ascii_lowercase();
        let base = lowered
            .split(|c: char| c == '(' || c.is_whitespace())
            .next()
            .unwrap_or_default();

        match base {
            "tinyint" => SourceKind::TinyInt,
            "smallint" => SourceKind::SmallInt,
            "mediumint" => SourceKind::MediumInt,
            "int" | "integer" => SourceKind::Int,
            "bigint" => SourceKind::BigInt,
            "float" => SourceKind::Float,
            "double" | "real" => SourceKind::Double,
            "decimal" | "numeric" => SourceKind::Decimal,
            "bool" | "boolean" => SourceKind::Bool,
            "bit" => SourceKind::Bit,
            "year" => SourceKind::Year,
            "date" => SourceKind::Date,
            "datetime" => SourceKind::DateTime,
            "timestamp" => SourceKind::Timestamp,
            "time" => SourceKind::Time,
            "char" => SourceKind::Char,
            "varchar" => SourceKind::VarChar,
            "tinytext" | "text" | "mediumtext" | "longtext" => SourceKind::Text,
            "binary" | "varbinary" => SourceKind::Binary,
            "tinyblob" | "blob" | "mediumblob" | "longblob" => SourceKind::Blob,
            "enum" => SourceKind::Enum,
            "set" => SourceKind::Set,
            "json" => SourceKind::Json,
            _ => SourceKind::Unknown,
        }
    }
}

/// ClickHouse column type, without nullability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt64,
    Float32,
    Float64,
    Decimal { precision: u32, scale: u32 },
    Bool,
    Date,
    DateTime,
    String,
}

impl TargetType {
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            TargetType::Int8
                | TargetType::Int16
                | TargetType::Int32
                | TargetType::Int64
                | TargetType::UInt8
                | TargetType::UInt16
                | TargetType::UInt64
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, TargetType::Float32 | TargetType::Float64)
    }

    /// Value written for a non-nullable column that has no value, e.g. the
    /// non-key columns of a delete marker.
    pub fn default_value(&self) -> serde_json::Value {
        match self {
            t if t.is_integer() => serde_json::Value::from(0),
            TargetType::Float32 | TargetType::Float64 => serde_json::Value::from(0.0),
            TargetType::Decimal { .. } => serde_json::Value::String("0".to_string()),
            TargetType::Bool => serde_json::Value::Bool(false),
            TargetType::Date => serde_json::Value::String("1970-01-01".to_string()),
            TargetType::DateTime => serde_json::Value::String("1970-01-01 00:00:00".to_string()),
            _ => serde_json::Value::String(String::new()),
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetType::Int8 => f.write_str("Int8"),
            TargetType::Int16 => f.write_str("Int16"),
            TargetType::Int32 => f.write_str("Int32"),
            TargetType::Int64 => f.write_str("Int64"),
            TargetType::UInt8 => f.write_str("UInt8"),
            TargetType::UInt16 => f.write_str("UInt16"),
            TargetType::UInt64 => f.write_str("UInt64"),
            TargetType::Float32 => f.write_str("Float32"),
            TargetType::Float64 => f.write_str("Float64"),
            TargetType::Decimal { precision, scale } => {
                write!(f, "Decimal({}, {})", precision, scale)
            }
            TargetType::Bool => f.write_str("Bool"),
            TargetType::Date => f.write_str("Date"),
            TargetType::DateTime => f.write_str("DateTime"),
            TargetType::String => f.write_str("String"),
        }
    }
}

/// Maps a source column type to its target type. Total: unknown names map
/// to `String`.
pub fn map_type(source: &SourceType) -> TargetType {
    match source.kind() {
        SourceKind::TinyInt => TargetType::Int8,
        SourceKind::SmallInt => TargetType::Int16,
        SourceKind::MediumInt | SourceKind::Int => TargetType::Int32,
        SourceKind::BigInt => TargetType::Int64,
        SourceKind::Float => TargetType::Float32,
        SourceKind::Double => TargetType::Float64,
        SourceKind::Decimal => TargetType::Decimal {
            precision: source.precision.unwrap_or(DEFAULT_DECIMAL_PRECISION),
            scale: source.scale.unwrap_or(DEFAULT_DECIMAL_SCALE),
        },
        SourceKind::Bool => TargetType::Bool,
        SourceKind::Bit => TargetType::UInt64,
        SourceKind::Year => TargetType::UInt16,
        SourceKind::Date => TargetType::Date,
        SourceKind::DateTime | SourceKind::Timestamp => TargetType::DateTime,
        SourceKind::Time
        | SourceKind::Char
        | SourceKind::VarChar
        | SourceKind::Text
        | SourceKind::Binary
        | SourceKind::Blob
        | SourceKind::Enum
        | SourceKind::Set
        | SourceKind::Json
        | SourceKind::Unknown => TargetType::String,
    }
}
