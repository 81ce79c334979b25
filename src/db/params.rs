//! Parameter binding for sqlx queries.
//!
//! Binds [`SqlValue`]s to database-specific query objects. Values are bound owned, so
//! the query only borrows its SQL text.

use super::value::{SqlType, SqlValue};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::{PgArgumentBuffer, PgArguments, PgTypeInfo, types::Oid};
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{Encode, Postgres, Sqlite, Type};

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;
type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// NULL sent without a declared type, so the server infers it from the context.
struct UntypedNull;

impl Type<Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl Encode<'_, Postgres> for UntypedNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        Ok(IsNull::Yes)
    }
}

/// Bind a parameter to a PostgreSQL query.
pub(crate) fn bind_postgres_param<'q>(query: PgQuery<'q>, param: &SqlValue) -> PgQuery<'q> {
    match param {
        SqlValue::Null => query.bind(UntypedNull),
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::Int(v) => query.bind(*v),
        SqlValue::Float(v) => query.bind(*v),
        SqlValue::Numeric(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.clone()),
        SqlValue::Bytes(v) => query.bind(v.clone()),
        SqlValue::Uuid(v) => query.bind(*v),
        SqlValue::Date(v) => query.bind(*v),
        SqlValue::Time(v) => query.bind(*v),
        SqlValue::Timestamp(v) => query.bind(*v),
        SqlValue::TimestampTz(v) => query.bind(*v),
        SqlValue::Json(v) => query.bind(Json(v.clone())),
        SqlValue::Array(ty, items) => bind_postgres_array(query, *ty, items),
    }
}

/// Elements of an array as `Option<T>`, or `None` if any element has another type.
fn elements<T>(items: &[SqlValue], pick: impl Fn(&SqlValue) -> Option<T>) -> Option<Vec<Option<T>>> {
    items
        .iter()
        .map(|item| match item {
            SqlValue::Null => Some(None),
            other => pick(other).map(Some),
        })
        .collect()
}

/// Bind a typed PostgreSQL array. Arrays that do not fit their element type (mixed or
/// nested values) are sent as `text[]`.
fn bind_postgres_array<'q>(query: PgQuery<'q>, ty: SqlType, items: &[SqlValue]) -> PgQuery<'q> {
    macro_rules! bind_as {
        ($variant:ident) => {
            if let Some(values) = elements(items, |v| match v {
                SqlValue::$variant(x) => Some(x.clone()),
                _ => None,
            }) {
                return query.bind(values);
            }
        };
    }

    match ty {
        SqlType::Bool => bind_as!(Bool),
        SqlType::Int8 => bind_as!(Int),
        SqlType::Float8 => bind_as!(Float),
        SqlType::Numeric => bind_as!(Numeric),
        SqlType::Uuid => bind_as!(Uuid),
        SqlType::Date => bind_as!(Date),
        SqlType::Time => bind_as!(Time),
        SqlType::Timestamp => bind_as!(Timestamp),
        SqlType::TimestampTz => bind_as!(TimestampTz),
        SqlType::Bytea => bind_as!(Bytes),
        SqlType::Jsonb => bind_as!(Json),
        SqlType::Varchar => bind_as!(Text),
    }

    let text: Vec<Option<String>> = items.iter().map(SqlValue::to_text).collect();
    query.bind(text)
}

/// Bind a parameter to a SQLite query.
pub(crate) fn bind_sqlite_param<'q>(query: SqliteQuery<'q>, param: &SqlValue) -> SqliteQuery<'q> {
    match param {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::Int(v) => query.bind(*v),
        SqlValue::Float(v) => query.bind(*v),
        SqlValue::Bytes(v) => query.bind(v.clone()),
        SqlValue::Date(v) => query.bind(*v),
        SqlValue::Time(v) => query.bind(*v),
        SqlValue::Timestamp(v) => query.bind(*v),
        SqlValue::TimestampTz(v) => query.bind(*v),
        // SQLite has no native decimal, uuid, json or array types; store their text
        other => query.bind(other.to_text()),
    }
}
