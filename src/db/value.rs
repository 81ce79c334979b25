//! Driver-native values.
//!
//! [`SqlValue`] is what actually travels to and from a [`Connection`](super::Connection):
//! bound parameters on the way in, column values on the way out. Domain types reach it
//! through the [`TypeConverter`](super::TypeConverter).

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// SQL dialect spoken by a connection provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Postgres,
    /// Embedded backend; no native arrays and no row locks.
    Sqlite,
}

impl Dialect {
    /// Parse the dialect from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::Postgres)
        } else if lower.starts_with("sqlite:") {
            Some(Self::Sqlite)
        } else {
            None
        }
    }

    /// Positional parameter marker, `n` is 1-based.
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Self::Postgres => format!("${}", n),
            Self::Sqlite => "?".to_string(),
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Postgres => "PostgreSQL",
            Self::Sqlite => "SQLite",
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Element type of a driver array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlType {
    Varchar,
    Bool,
    Int8,
    Float8,
    Numeric,
    Uuid,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Bytea,
    Jsonb,
}

impl SqlType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Varchar => "varchar",
            Self::Bool => "bool",
            Self::Int8 => "int8",
            Self::Float8 => "float8",
            Self::Numeric => "numeric",
            Self::Uuid => "uuid",
            Self::Date => "date",
            Self::Time => "time",
            Self::Timestamp => "timestamp",
            Self::TimestampTz => "timestamptz",
            Self::Bytea => "bytea",
            Self::Jsonb => "jsonb",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Numeric(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(JsonValue),
    Array(SqlType, Vec<SqlValue>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Array element type this value would produce; `None` for nulls and nested arrays.
    pub fn sql_type(&self) -> Option<SqlType> {
        match self {
            Self::Null | Self::Array(..) => None,
            Self::Bool(_) => Some(SqlType::Bool),
            Self::Int(_) => Some(SqlType::Int8),
            Self::Float(_) => Some(SqlType::Float8),
            Self::Numeric(_) => Some(SqlType::Numeric),
            Self::Text(_) => Some(SqlType::Varchar),
            Self::Bytes(_) => Some(SqlType::Bytea),
            Self::Uuid(_) => Some(SqlType::Uuid),
            Self::Date(_) => Some(SqlType::Date),
            Self::Time(_) => Some(SqlType::Time),
            Self::Timestamp(_) => Some(SqlType::Timestamp),
            Self::TimestampTz(_) => Some(SqlType::TimestampTz),
            Self::Json(_) => Some(SqlType::Jsonb),
        }
    }

    /// Short name of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Numeric(_) => "numeric",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Uuid(_) => "uuid",
            Self::Date(_) => "date",
            Self::Time(_) => "time",
            Self::Timestamp(_) => "timestamp",
            Self::TimestampTz(_) => "timestamptz",
            Self::Json(_) => "json",
            Self::Array(..) => "array",
        }
    }

    /// Textual form used when a driver has no native slot for the value.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Bool(v) => Some(v.to_string()),
            Self::Int(v) => Some(v.to_string()),
            Self::Float(v) => Some(v.to_string()),
            Self::Numeric(v) => Some(v.to_string()),
            Self::Text(v) => Some(v.clone()),
            Self::Bytes(v) => Some(encode_base64(v)),
            Self::Uuid(v) => Some(v.to_string()),
            Self::Date(v) => Some(v.to_string()),
            Self::Time(v) => Some(v.to_string()),
            Self::Timestamp(v) => Some(v.to_string()),
            Self::TimestampTz(v) => Some(v.to_rfc3339()),
            Self::Json(v) => Some(v.to_string()),
            Self::Array(..) => Some(self.to_json().to_string()),
        }
    }

    /// JSON rendering. Binary data is base64 encoded, decimals keep their exact text.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Null => JsonValue::Null,
            Self::Bool(v) => JsonValue::Bool(*v),
            Self::Int(v) => JsonValue::Number((*v).into()),
            Self::Float(v) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or_else(|| JsonValue::String(v.to_string())),
            Self::Numeric(v) => JsonValue::String(v.to_string()),
            // ISO form, as chrono's serde impl expects it.
            Self::Timestamp(v) => JsonValue::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            Self::Json(v) => v.clone(),
            Self::Array(_, items) => JsonValue::Array(items.iter().map(Self::to_json).collect()),
            other => other
                .to_text()
                .map(JsonValue::String)
                .unwrap_or(JsonValue::Null),
        }
    }

    /// Inverse of [`SqlValue::to_json`] as far as JSON allows: strings stay text.
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(v) => Self::Bool(*v),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => n.as_f64().map(Self::Float).unwrap_or(Self::Null),
            },
            JsonValue::String(s) => Self::Text(s.clone()),
            JsonValue::Array(items) => {
                let items: Vec<SqlValue> = items.iter().map(Self::from_json).collect();
                let ty = element_type(&items);
                Self::Array(ty, items)
            }
            JsonValue::Object(_) => Self::Json(value.clone()),
        }
    }
}

/// Element type of an array: taken from the first non-null element, text otherwise.
pub fn element_type(items: &[SqlValue]) -> SqlType {
    items
        .iter()
        .find(|v| !v.is_null())
        .and_then(SqlValue::sql_type)
        .unwrap_or(SqlType::Varchar)
}

fn encode_base64(bytes: &[u8]) -> String {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    STANDARD.encode(bytes)
}
