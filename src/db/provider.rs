//! Seams between the engine and a concrete driver.
//!
//! The engine never talks to a driver directly. It asks a [`ConnectionProvider`] for a
//! [`Connection`], runs statements on it and reads rows through a [`Cursor`]. Dropping
//! a connection releases it; dropping a cursor closes it.

use super::value::{Dialect, SqlValue};
use crate::error::DbResult;
use futures_util::future::BoxFuture;
use std::sync::Arc;

/// Source of connections for one database.
pub trait ConnectionProvider: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Open (or acquire from a pool) a fresh connection in auto-commit mode.
    fn open_connection(&self) -> BoxFuture<'_, DbResult<Box<dyn Connection>>>;
}

/// Shared handle to a provider. Two handles name the same provider only when they
/// point at the same allocation.
pub type Provider = Arc<dyn ConnectionProvider>;

/// Identity of a provider, used to match transactions against providers.
pub(crate) fn provider_key(provider: &Provider) -> usize {
    Arc::as_ptr(provider).cast::<()>() as usize
}

/// One open connection.
pub trait Connection: Send {
    fn dialect(&self) -> Dialect;

    fn is_auto_commit(&self) -> bool;

    fn set_auto_commit(&mut self, auto_commit: bool) -> BoxFuture<'_, DbResult<()>>;

    fn commit(&mut self) -> BoxFuture<'_, DbResult<()>>;

    fn rollback(&mut self) -> BoxFuture<'_, DbResult<()>>;

    /// Run a row-returning statement. The cursor does not borrow the connection.
    fn query<'a>(
        &'a mut self,
        sql: &'a str,
        params: &'a [SqlValue],
    ) -> BoxFuture<'a, DbResult<Box<dyn Cursor>>>;

    /// Run a statement and report the number of affected rows.
    fn execute<'a>(&'a mut self, sql: &'a str, params: &'a [SqlValue])
    -> BoxFuture<'a, DbResult<u64>>;
}

/// Forward-only row source.
pub trait Cursor: Send {
    fn columns(&self) -> &[String];

    fn next(&mut self) -> BoxFuture<'_, DbResult<Option<Vec<SqlValue>>>>;
}

/// A cursor over rows already in memory.
#[derive(Debug, Default)]
pub struct VecCursor {
    columns: Vec<String>,
    rows: std::collections::VecDeque<Vec<SqlValue>>,
}

impl VecCursor {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<SqlValue>>) -> Self {
        Self {
            columns,
            rows: rows.into(),
        }
    }
}

impl Cursor for VecCursor {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn next(&mut self) -> BoxFuture<'_, DbResult<Option<Vec<SqlValue>>>> {
        let row = self.rows.pop_front();
        Box::pin(async move { Ok(row) })
    }
}
