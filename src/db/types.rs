//! Row decoding for the sqlx backends.
//!
//! Decoding uses a two-phase approach:
//! 1. `TypeCategory` classifies the column's type name into a logical category
//! 2. Backend-specific decoders extract the value as a [`SqlValue`]
//!
//! PostgreSQL is strict about types, so integer and float columns are tried from the
//! narrowest Rust type up. SQLite values carry their own runtime type; when the declared
//! type does not fit the stored value, decoding falls back to the value's storage class.

use super::value::{Dialect, SqlType, SqlValue};
use crate::error::{DbError, DbResult};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgHasArrayType, PgRow};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Postgres, Row, Type, TypeInfo, ValueRef};
use tracing::warn;
use uuid::Uuid;

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Unknown,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, dialect: Dialect) -> TypeCategory {
    let lower = type_name.trim().to_lowercase();

    match lower.as_str() {
        "int2" | "int4" | "int8" | "smallint" | "int" | "integer" | "bigint" | "tinyint"
        | "mediumint" | "smallserial" | "serial" | "bigserial" => TypeCategory::Integer,
        // SQLite's NUMERIC is stored as a float
        "numeric" | "decimal" if dialect == Dialect::Sqlite => TypeCategory::Float,
        "numeric" | "decimal" => TypeCategory::Decimal,
        "bool" | "boolean" => TypeCategory::Boolean,
        "float4" | "float8" | "real" | "float" | "double" | "double precision" => {
            TypeCategory::Float
        }
        "text" | "varchar" | "character varying" | "char" | "character" | "bpchar" | "name"
        | "citext" | "clob" => TypeCategory::Text,
        "bytea" | "blob" => TypeCategory::Binary,
        "json" | "jsonb" => TypeCategory::Json,
        "uuid" => TypeCategory::Uuid,
        "date" => TypeCategory::Date,
        "time" => TypeCategory::Time,
        "timestamp" | "datetime" => TypeCategory::Timestamp,
        "timestamptz" => TypeCategory::TimestampTz,
        _ => TypeCategory::Unknown,
    }
}

/// Decode every column of a PostgreSQL row.
pub(crate) fn decode_pg_row(row: &PgRow) -> DbResult<Vec<SqlValue>> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, col)| {
            let type_name = col.type_info().name();
            match type_name.strip_suffix("[]") {
                Some(element) => postgres::decode_array(
                    row,
                    idx,
                    categorize_type(element, Dialect::Postgres),
                ),
                None => postgres::decode_column(
                    row,
                    idx,
                    type_name,
                    categorize_type(type_name, Dialect::Postgres),
                ),
            }
        })
        .collect()
}

/// Decode every column of a SQLite row.
pub(crate) fn decode_sqlite_row(row: &SqliteRow) -> DbResult<Vec<SqlValue>> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, col)| {
            let category = categorize_type(col.type_info().name(), Dialect::Sqlite);
            sqlite::decode_column(row, idx, category)
        })
        .collect()
}

/// Column names of a row, in select order.
pub(crate) fn column_names<R: Row>(row: &R) -> Vec<String> {
    row.columns()
        .iter()
        .map(|col| col.name().to_string())
        .collect()
}

fn or_null<T>(value: Option<T>, wrap: impl FnOnce(T) -> SqlValue) -> SqlValue {
    value.map(wrap).unwrap_or(SqlValue::Null)
}

mod postgres {
    use super::*;

    pub fn decode_column(
        row: &PgRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> DbResult<SqlValue> {
        match category {
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Decimal => decode::<Decimal>(row, idx, SqlValue::Numeric),
            TypeCategory::Boolean => decode::<bool>(row, idx, SqlValue::Bool),
            TypeCategory::Text => decode::<String>(row, idx, SqlValue::Text),
            TypeCategory::Binary => decode::<Vec<u8>>(row, idx, SqlValue::Bytes),
            TypeCategory::Json => decode::<JsonValue>(row, idx, SqlValue::Json),
            TypeCategory::Uuid => decode::<Uuid>(row, idx, SqlValue::Uuid),
            TypeCategory::Date => decode::<NaiveDate>(row, idx, SqlValue::Date),
            TypeCategory::Time => decode::<NaiveTime>(row, idx, SqlValue::Time),
            TypeCategory::Timestamp => decode::<NaiveDateTime>(row, idx, SqlValue::Timestamp),
            TypeCategory::TimestampTz => {
                decode::<DateTime<Utc>>(row, idx, SqlValue::TimestampTz)
            }
            TypeCategory::Unknown => decode_unknown(row, idx, type_name),
        }
    }

    fn decode<T>(row: &PgRow, idx: usize, wrap: impl FnOnce(T) -> SqlValue) -> DbResult<SqlValue>
    where
        T: for<'r> Decode<'r, Postgres> + Type<Postgres>,
    {
        let value = row.try_get::<Option<T>, _>(idx)?;
        Ok(or_null(value, wrap))
    }

    fn decode_integer(row: &PgRow, idx: usize) -> DbResult<SqlValue> {
        if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
            return Ok(or_null(v, |v| SqlValue::Int(v.into())));
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return Ok(or_null(v, |v| SqlValue::Int(v.into())));
        }
        decode::<i64>(row, idx, SqlValue::Int)
    }

    fn decode_float(row: &PgRow, idx: usize) -> DbResult<SqlValue> {
        if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
            return Ok(or_null(v, |v| SqlValue::Float(v.into())));
        }
        decode::<f64>(row, idx, SqlValue::Float)
    }

    fn decode_unknown(row: &PgRow, idx: usize, type_name: &str) -> DbResult<SqlValue> {
        match row.try_get::<Option<String>, _>(idx) {
            Ok(v) => Ok(or_null(v, SqlValue::Text)),
            Err(e) => {
                warn!(column = idx, type_name, error = %e, "Unsupported column type, returning null");
                Ok(SqlValue::Null)
            }
        }
    }

    fn array<T>(
        row: &PgRow,
        idx: usize,
        ty: SqlType,
        wrap: impl Fn(T) -> SqlValue,
    ) -> DbResult<SqlValue>
    where
        T: for<'r> Decode<'r, Postgres> + Type<Postgres> + PgHasArrayType,
    {
        let items = row.try_get::<Option<Vec<Option<T>>>, _>(idx)?;
        Ok(or_null(items, |items| {
            SqlValue::Array(
                ty,
                items.into_iter().map(|v| or_null(v, &wrap)).collect(),
            )
        }))
    }

    pub fn decode_array(row: &PgRow, idx: usize, element: TypeCategory) -> DbResult<SqlValue> {
        match element {
            TypeCategory::Integer => {
                if let Ok(v) = array::<i16>(row, idx, SqlType::Int8, |v| SqlValue::Int(v.into())) {
                    return Ok(v);
                }
                if let Ok(v) = array::<i32>(row, idx, SqlType::Int8, |v| SqlValue::Int(v.into())) {
                    return Ok(v);
                }
                array::<i64>(row, idx, SqlType::Int8, SqlValue::Int)
            }
            TypeCategory::Float => {
                if let Ok(v) = array::<f32>(row, idx, SqlType::Float8, |v| SqlValue::Float(v.into())) {
                    return Ok(v);
                }
                array::<f64>(row, idx, SqlType::Float8, SqlValue::Float)
            }
            TypeCategory::Decimal => array::<Decimal>(row, idx, SqlType::Numeric, SqlValue::Numeric),
            TypeCategory::Boolean => array::<bool>(row, idx, SqlType::Bool, SqlValue::Bool),
            TypeCategory::Binary => array::<Vec<u8>>(row, idx, SqlType::Bytea, SqlValue::Bytes),
            TypeCategory::Json => array::<JsonValue>(row, idx, SqlType::Jsonb, SqlValue::Json),
            TypeCategory::Uuid => array::<Uuid>(row, idx, SqlType::Uuid, SqlValue::Uuid),
            TypeCategory::Date => array::<NaiveDate>(row, idx, SqlType::Date, SqlValue::Date),
            TypeCategory::Time => array::<NaiveTime>(row, idx, SqlType::Time, SqlValue::Time),
            TypeCategory::Timestamp => {
                array::<NaiveDateTime>(row, idx, SqlType::Timestamp, SqlValue::Timestamp)
            }
            TypeCategory::TimestampTz => {
                array::<DateTime<Utc>>(row, idx, SqlType::TimestampTz, SqlValue::TimestampTz)
            }
            TypeCategory::Text | TypeCategory::Unknown => {
                array::<String>(row, idx, SqlType::Varchar, SqlValue::Text)
            }
        }
    }
}

mod sqlite {
    use super::*;

    pub fn decode_column(row: &SqliteRow, idx: usize, category: TypeCategory) -> DbResult<SqlValue> {
        if row.try_get_raw(idx)?.is_null() {
            return Ok(SqlValue::Null);
        }

        let typed = match category {
            TypeCategory::Integer => row.try_get::<i64, _>(idx).map(SqlValue::Int),
            TypeCategory::Float | TypeCategory::Decimal => {
                row.try_get::<f64, _>(idx).map(SqlValue::Float)
            }
            TypeCategory::Boolean => row.try_get::<bool, _>(idx).map(SqlValue::Bool),
            TypeCategory::Binary => row.try_get::<Vec<u8>, _>(idx).map(SqlValue::Bytes),
            TypeCategory::Date => row.try_get::<NaiveDate, _>(idx).map(SqlValue::Date),
            TypeCategory::Time => row.try_get::<NaiveTime, _>(idx).map(SqlValue::Time),
            TypeCategory::Timestamp => {
                row.try_get::<NaiveDateTime, _>(idx).map(SqlValue::Timestamp)
            }
            TypeCategory::TimestampTz => {
                row.try_get::<DateTime<Utc>, _>(idx).map(SqlValue::TimestampTz)
            }
            TypeCategory::Json => row
                .try_get::<String, _>(idx)
                .map(|text| match serde_json::from_str::<JsonValue>(&text) {
                    Ok(json) => SqlValue::Json(json),
                    Err(_) => SqlValue::Text(text),
                }),
            TypeCategory::Uuid => row
                .try_get::<String, _>(idx)
                .map(|text| match text.parse::<Uuid>() {
                    Ok(uuid) => SqlValue::Uuid(uuid),
                    Err(_) => SqlValue::Text(text),
                }),
            TypeCategory::Text | TypeCategory::Unknown => {
                row.try_get::<String, _>(idx).map(SqlValue::Text)
            }
        };

        match typed {
            Ok(value) => Ok(value),
            Err(_) => decode_dynamic(row, idx),
        }
    }

    /// Decode by the value's storage class, ignoring the declared type.
    fn decode_dynamic(row: &SqliteRow, idx: usize) -> DbResult<SqlValue> {
        if let Ok(v) = row.try_get::<i64, _>(idx) {
            return Ok(SqlValue::Int(v));
        }
        if let Ok(v) = row.try_get::<f64, _>(idx) {
            return Ok(SqlValue::Float(v));
        }
        if let Ok(v) = row.try_get::<String, _>(idx) {
            return Ok(SqlValue::Text(v));
        }
        row.try_get::<Vec<u8>, _>(idx)
            .map(SqlValue::Bytes)
            .map_err(|e| DbError::conversion(format!("column {}", idx), e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_type_integer() {
        assert_eq!(
            categorize_type("INT4", Dialect::Postgres),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("BIGINT", Dialect::Postgres),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("INTEGER", Dialect::Sqlite),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("SERIAL", Dialect::Postgres),
            TypeCategory::Integer
        );
    }

    #[test]
    fn test_categorize_type_does_not_match_substrings() {
        // "point" and "interval" contain "int"
        assert_eq!(
            categorize_type("POINT", Dialect::Postgres),
            TypeCategory::Unknown
        );
        assert_eq!(
            categorize_type("INTERVAL", Dialect::Postgres),
            TypeCategory::Unknown
        );
    }

    #[test]
    fn test_categorize_type_decimal() {
        assert_eq!(
            categorize_type("NUMERIC", Dialect::Postgres),
            TypeCategory::Decimal
        );
        // SQLite NUMERIC is a float
        assert_eq!(
            categorize_type("numeric", Dialect::Sqlite),
            TypeCategory::Float
        );
    }

    #[test]
    fn test_categorize_type_temporal() {
        assert_eq!(
            categorize_type("TIMESTAMPTZ", Dialect::Postgres),
            TypeCategory::TimestampTz
        );
        assert_eq!(
            categorize_type("TIMESTAMP", Dialect::Postgres),
            TypeCategory::Timestamp
        );
        assert_eq!(
            categorize_type("DATETIME", Dialect::Sqlite),
            TypeCategory::Timestamp
        );
        assert_eq!(categorize_type("DATE", Dialect::Sqlite), TypeCategory::Date);
        assert_eq!(categorize_type("TIME", Dialect::Postgres), TypeCategory::Time);
    }

    #[test]
    fn test_categorize_type_json_and_uuid() {
        assert_eq!(
            categorize_type("jsonb", Dialect::Postgres),
            TypeCategory::Json
        );
        assert_eq!(categorize_type("UUID", Dialect::Postgres), TypeCategory::Uuid);
        assert_eq!(categorize_type("BYTEA", Dialect::Postgres), TypeCategory::Binary);
        assert_eq!(categorize_type("BLOB", Dialect::Sqlite), TypeCategory::Binary);
    }

    #[test]
    fn test_or_null() {
        assert_eq!(or_null(Some(3_i64), SqlValue::Int), SqlValue::Int(3));
        assert_eq!(or_null(None::<i64>, SqlValue::Int), SqlValue::Null);
    }
}
