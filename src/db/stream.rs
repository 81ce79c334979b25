//! Lazy result streams.
//!
//! A [`ResultStream`] does nothing until it is first polled. It then leases a
//! connection, runs its statement and yields one mapped row per poll. The lease is
//! released exactly once, as soon as the cursor is exhausted, a row fails to map, or
//! the stream is dropped half-way.
//!
//! When a transaction for the stream's provider is current, its connection is used and
//! only locked while the statement executes; the transaction keeps the connection.

use super::convert::{FromSql, TypeConverter};
use super::predicate::Statement;
use super::provider::{Connection, Cursor, Provider};
use super::transaction::{Transaction, TransactionConnection};
use super::value::SqlValue;
use crate::error::{DbError, DbResult};
use futures_util::stream::{self, BoxStream, Stream, TryStreamExt};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::debug;

/// A connection borrowed for one statement or one result set.
pub(crate) enum Lease {
    /// Dedicated connection, released when the lease is dropped.
    Owned(Box<dyn Connection>),
    /// The current transaction's connection, locked while the lease lives.
    Transaction(TransactionConnection),
}

impl Lease {
    /// Use the current transaction's connection if there is one, otherwise open one.
    pub(crate) async fn acquire(provider: &Provider) -> DbResult<Self> {
        match Transaction::current_for(provider) {
            Some(transaction) => Ok(Self::Transaction(transaction.connection().await?)),
            None => Ok(Self::Owned(provider.open_connection().await?)),
        }
    }

    pub(crate) fn connection(&mut self) -> DbResult<&mut (dyn Connection + 'static)> {
        match self {
            Self::Owned(connection) => Ok(connection.as_mut()),
            Self::Transaction(guard) => guard.get(),
        }
    }
}

/// Column names of a result set, indexed once per query.
///
/// Lookups try the exact name first and fall back to a case-insensitive match, so
/// `"userId"` finds a column the driver reported as `"userid"`.
#[derive(Debug)]
pub struct Columns {
    names: Vec<String>,
    exact: HashMap<String, usize>,
    folded: HashMap<String, usize>,
}

impl Columns {
    pub fn new(names: Vec<String>) -> Self {
        let mut exact = HashMap::with_capacity(names.len());
        let mut folded = HashMap::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            exact.entry(name.clone()).or_insert(i);
            folded.entry(name.to_lowercase()).or_insert(i);
        }
        Self {
            names,
            exact,
            folded,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.exact
            .get(name)
            .or_else(|| self.folded.get(&name.to_lowercase()))
            .copied()
    }
}

/// One row of a result set.
#[derive(Clone)]
pub struct Row {
    columns: Arc<Columns>,
    values: Vec<SqlValue>,
    conv: Arc<TypeConverter>,
}

impl Row {
    pub fn new(columns: Arc<Columns>, values: Vec<SqlValue>, conv: Arc<TypeConverter>) -> Self {
        Self {
            columns,
            values,
            conv,
        }
    }

    pub fn columns(&self) -> &[String] {
        self.columns.names()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw value of a column.
    pub fn value(&self, column: &str) -> DbResult<&SqlValue> {
        self.columns
            .index_of(column)
            .and_then(|i| self.values.get(i))
            .ok_or_else(|| DbError::column_not_found(column))
    }

    pub fn value_at(&self, index: usize) -> DbResult<&SqlValue> {
        self.values
            .get(index)
            .ok_or_else(|| DbError::column_not_found(format!("#{}", index)))
    }

    /// Value of a column converted to `T`.
    pub fn get<T: FromSql>(&self, column: &str) -> DbResult<T> {
        let value = self.value(column)?.clone();
        self.conv.from(value)
    }

    pub fn get_at<T: FromSql>(&self, index: usize) -> DbResult<T> {
        let value = self.value_at(index)?.clone();
        self.conv.from(value)
    }

    pub fn into_values(self) -> Vec<SqlValue> {
        self.values
    }

    /// The row as a JSON object keyed by column name.
    pub fn to_json(&self) -> JsonValue {
        let mut object = Map::with_capacity(self.values.len());
        for (name, value) in self.columns.names().iter().zip(&self.values) {
            object.insert(name.clone(), value.to_json());
        }
        JsonValue::Object(object)
    }

    /// Build any deserializable type from the row, matching fields to column names.
    pub fn decode<T: DeserializeOwned>(&self) -> DbResult<T> {
        serde_json::from_value(self.to_json())
            .map_err(|e| DbError::conversion(std::any::type_name::<T>(), e.to_string()))
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, value) in self.columns.names().iter().zip(&self.values) {
            map.entry(name, value);
        }
        map.finish()
    }
}

pub(crate) type Mapper<R> = Arc<dyn Fn(&Row) -> DbResult<R> + Send + Sync>;

/// Lazy, single-pass stream of mapped rows.
#[must_use = "streams do nothing unless polled"]
pub struct ResultStream<R> {
    inner: BoxStream<'static, DbResult<R>>,
}

impl<R: Send + 'static> ResultStream<R> {
    pub(crate) fn new(
        provider: Provider,
        conv: Arc<TypeConverter>,
        statement: DbResult<Statement>,
        mapper: Mapper<R>,
    ) -> Self {
        let source = Source {
            provider,
            conv,
            mapper,
            statement: Some(statement),
            open: None,
        };
        Self {
            inner: Box::pin(stream::try_unfold(source, step)),
        }
    }

    /// Collect every row.
    pub async fn list(self) -> DbResult<Vec<R>> {
        self.try_collect().await
    }

    /// The first row, if any. The rest of the result set is discarded.
    pub async fn first(mut self) -> DbResult<Option<R>> {
        self.try_next().await
    }

    /// The first row; no rows is [`DbError::NotFound`].
    pub async fn one(self) -> DbResult<R> {
        self.first()
            .await?
            .ok_or_else(|| DbError::not_found("query returned no rows"))
    }
}

impl<R> Stream for ResultStream<R> {
    type Item = DbResult<R>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl<R> fmt::Debug for ResultStream<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultStream").finish_non_exhaustive()
    }
}

struct Source<R> {
    provider: Provider,
    conv: Arc<TypeConverter>,
    mapper: Mapper<R>,
    statement: Option<DbResult<Statement>>,
    open: Option<OpenCursor>,
}

// Fields drop in order: the cursor closes before its connection is released.
struct OpenCursor {
    cursor: Box<dyn Cursor>,
    columns: Arc<Columns>,
    connection: Option<Box<dyn Connection>>,
}

impl OpenCursor {
    async fn open(provider: &Provider, statement: &Statement) -> DbResult<Self> {
        debug!(sql = %statement.sql, params = statement.params.len(), "Executing query");
        match Lease::acquire(provider).await? {
            Lease::Transaction(mut guard) => {
                let cursor = guard
                    .get()?
                    .query(&statement.sql, &statement.params)
                    .await?;
                Ok(Self::with_cursor(cursor, None))
            }
            Lease::Owned(mut connection) => {
                let cursor = connection
                    .query(&statement.sql, &statement.params)
                    .await?;
                Ok(Self::with_cursor(cursor, Some(connection)))
            }
        }
    }

    fn with_cursor(cursor: Box<dyn Cursor>, connection: Option<Box<dyn Connection>>) -> Self {
        let columns = Arc::new(Columns::new(cursor.columns().to_vec()));
        Self {
            cursor,
            columns,
            connection,
        }
    }
}

async fn step<R>(mut source: Source<R>) -> DbResult<Option<(R, Source<R>)>> {
    if source.open.is_none() {
        let statement = match source.statement.take() {
            Some(statement) => statement?,
            None => return Ok(None),
        };
        source.open = Some(OpenCursor::open(&source.provider, &statement).await?);
    }

    let Some(open) = source.open.as_mut() else {
        return Ok(None);
    };

    match open.cursor.next().await? {
        Some(values) => {
            let row = Row::new(Arc::clone(&open.columns), values, Arc::clone(&source.conv));
            let mapped = (source.mapper)(&row)?;
            Ok(Some((mapped, source)))
        }
        None => {
            if let Some(open) = source.open.take() {
                debug!(
                    owned_connection = open.connection.is_some(),
                    "Result set exhausted"
                );
            }
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(names: &[&str], values: Vec<SqlValue>) -> Row {
        Row::new(
            Arc::new(Columns::new(names.iter().map(|n| n.to_string()).collect())),
            values,
            TypeConverter::shared(),
        )
    }

    #[test]
    fn test_column_lookup_is_case_tolerant() {
        let columns = Columns::new(vec!["id".into(), "userid".into(), "Name".into()]);
        assert_eq!(columns.index_of("id"), Some(0));
        assert_eq!(columns.index_of("userId"), Some(1));
        assert_eq!(columns.index_of("USERID"), Some(1));
        assert_eq!(columns.index_of("name"), Some(2));
        assert_eq!(columns.index_of("missing"), None);
    }

    #[test]
    fn test_exact_match_wins_over_folded() {
        let columns = Columns::new(vec!["ID".into(), "id".into()]);
        assert_eq!(columns.index_of("id"), Some(1));
        assert_eq!(columns.index_of("ID"), Some(0));
        assert_eq!(columns.index_of("Id"), Some(0));
    }

    #[test]
    fn test_row_get_converts() {
        let r = row(
            &["id", "name", "score"],
            vec![
                SqlValue::Int(7),
                SqlValue::Text("ada".into()),
                SqlValue::Null,
            ],
        );
        assert_eq!(r.get::<i32>("ID").unwrap(), 7);
        assert_eq!(r.get::<String>("name").unwrap(), "ada");
        assert_eq!(r.get::<Option<f64>>("score").unwrap(), None);
        assert!(matches!(
            r.get::<i64>("nope"),
            Err(DbError::ColumnNotFound { .. })
        ));
    }

    #[test]
    fn test_row_decode_into_struct() {
        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct User {
            id: i64,
            name: String,
            active: bool,
        }

        let r = row(
            &["id", "name", "active"],
            vec![
                SqlValue::Int(1),
                SqlValue::Text("ada".into()),
                SqlValue::Bool(true),
            ],
        );
        assert_eq!(
            r.decode::<User>().unwrap(),
            User {
                id: 1,
                name: "ada".into(),
                active: true
            }
        );
        assert!(r.decode::<(String, String)>().is_err());
    }

    #[test]
    fn test_row_to_json() {
        let r = row(&["a", "b"], vec![SqlValue::Int(1), SqlValue::Bytes(vec![0xff])]);
        assert_eq!(r.to_json(), serde_json::json!({"a": 1, "b": "/w=="}));
    }
}
