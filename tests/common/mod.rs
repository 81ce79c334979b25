//! Recording connection provider shared by the integration tests.
//!
//! Every connection, statement, commit and release is appended to an event log, so
//! tests can assert exactly what reached the "database".

#![allow(dead_code)]

use futures_util::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use txsql::db::{Connection, ConnectionProvider, Cursor, Dialect, Provider, SqlValue};
use txsql::{DbError, DbResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Open(usize),
    AutoCommit(usize, bool),
    Commit(usize),
    Rollback(usize),
    Query(usize, String, Vec<SqlValue>),
    Execute(usize, String, Vec<SqlValue>),
    CursorClosed(usize),
    Close(usize),
}

#[derive(Default)]
struct Script {
    results: VecDeque<(Vec<String>, Vec<Vec<SqlValue>>)>,
    fail_statement: Option<String>,
    fail_commit: bool,
    affected: u64,
}

pub struct MockProvider {
    dialect: Dialect,
    log: Arc<Mutex<Vec<Event>>>,
    script: Arc<Mutex<Script>>,
    next_id: AtomicUsize,
}

impl MockProvider {
    pub fn new(dialect: Dialect) -> Arc<Self> {
        Arc::new(Self {
            dialect,
            log: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(Mutex::new(Script {
                affected: 1,
                ..Script::default()
            })),
            next_id: AtomicUsize::new(1),
        })
    }

    pub fn postgres() -> Arc<Self> {
        Self::new(Dialect::Postgres)
    }

    /// Result of the next row-returning statement. Unscripted queries return no rows.
    pub fn push_rows(&self, columns: &[&str], rows: Vec<Vec<SqlValue>>) {
        let columns = columns.iter().map(|c| c.to_string()).collect();
        self.script.lock().unwrap().results.push_back((columns, rows));
    }

    /// Fail the next statement with a statement error.
    pub fn fail_next_statement(&self, message: &str) {
        self.script.lock().unwrap().fail_statement = Some(message.to_string());
    }

    /// Fail every commit from now on.
    pub fn fail_commits(&self) {
        self.script.lock().unwrap().fail_commit = true;
    }

    pub fn set_affected(&self, affected: u64) {
        self.script.lock().unwrap().affected = affected;
    }

    pub fn events(&self) -> Vec<Event> {
        self.log.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.log.lock().unwrap().clear();
    }

    pub fn opened(&self) -> usize {
        self.count(|e| matches!(e, Event::Open(_)))
    }

    pub fn closed(&self) -> usize {
        self.count(|e| matches!(e, Event::Close(_)))
    }

    pub fn commits(&self) -> usize {
        self.count(|e| matches!(e, Event::Commit(_)))
    }

    pub fn rollbacks(&self) -> usize {
        self.count(|e| matches!(e, Event::Rollback(_)))
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.log.lock().unwrap().iter().filter(|e| pred(e)).count()
    }

    /// SQL of every statement, in order.
    pub fn statements(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                Event::Query(_, sql, _) | Event::Execute(_, sql, _) => Some(sql.clone()),
                _ => None,
            })
            .collect()
    }

    /// Connection ids used by statements, in order.
    pub fn statement_connections(&self) -> Vec<usize> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                Event::Query(id, ..) | Event::Execute(id, ..) => Some(*id),
                _ => None,
            })
            .collect()
    }
}

impl ConnectionProvider for MockProvider {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn open_connection(&self) -> BoxFuture<'_, DbResult<Box<dyn Connection>>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(Event::Open(id));
        let connection = MockConnection {
            id,
            dialect: self.dialect,
            auto_commit: true,
            log: Arc::clone(&self.log),
            script: Arc::clone(&self.script),
        };
        Box::pin(async move { Ok(Box::new(connection) as Box<dyn Connection>) })
    }
}

/// Upcast helper: `Arc<MockProvider>` as the engine's provider handle.
pub fn provider(mock: &Arc<MockProvider>) -> Provider {
    Arc::clone(mock) as Provider
}

struct MockConnection {
    id: usize,
    dialect: Dialect,
    auto_commit: bool,
    log: Arc<Mutex<Vec<Event>>>,
    script: Arc<Mutex<Script>>,
}

impl MockConnection {
    fn record(&self, event: Event) {
        self.log.lock().unwrap().push(event);
    }

    fn check_failure(&self) -> DbResult<()> {
        match self.script.lock().unwrap().fail_statement.take() {
            Some(message) => Err(DbError::statement(message, Some("XX000".to_string()), "")),
            None => Ok(()),
        }
    }
}

impl Connection for MockConnection {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn is_auto_commit(&self) -> bool {
        self.auto_commit
    }

    fn set_auto_commit(&mut self, auto_commit: bool) -> BoxFuture<'_, DbResult<()>> {
        self.auto_commit = auto_commit;
        self.record(Event::AutoCommit(self.id, auto_commit));
        Box::pin(async { Ok(()) })
    }

    fn commit(&mut self) -> BoxFuture<'_, DbResult<()>> {
        self.record(Event::Commit(self.id));
        let fail = self.script.lock().unwrap().fail_commit;
        Box::pin(async move {
            if fail {
                Err(DbError::statement("commit failed", Some("40001".to_string()), ""))
            } else {
                Ok(())
            }
        })
    }

    fn rollback(&mut self) -> BoxFuture<'_, DbResult<()>> {
        self.record(Event::Rollback(self.id));
        Box::pin(async { Ok(()) })
    }

    fn query<'a>(
        &'a mut self,
        sql: &'a str,
        params: &'a [SqlValue],
    ) -> BoxFuture<'a, DbResult<Box<dyn Cursor>>> {
        Box::pin(async move {
            self.check_failure()?;
            self.record(Event::Query(self.id, sql.to_string(), params.to_vec()));
            let (columns, rows) = self
                .script
                .lock()
                .unwrap()
                .results
                .pop_front()
                .unwrap_or_default();
            Ok(Box::new(MockCursor {
                connection: self.id,
                columns,
                rows: rows.into(),
                log: Arc::clone(&self.log),
            }) as Box<dyn Cursor>)
        })
    }

    fn execute<'a>(
        &'a mut self,
        sql: &'a str,
        params: &'a [SqlValue],
    ) -> BoxFuture<'a, DbResult<u64>> {
        Box::pin(async move {
            self.check_failure()?;
            self.record(Event::Execute(self.id, sql.to_string(), params.to_vec()));
            Ok(self.script.lock().unwrap().affected)
        })
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.record(Event::Close(self.id));
    }
}

struct MockCursor {
    connection: usize,
    columns: Vec<String>,
    rows: VecDeque<Vec<SqlValue>>,
    log: Arc<Mutex<Vec<Event>>>,
}

impl Cursor for MockCursor {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn next(&mut self) -> BoxFuture<'_, DbResult<Option<Vec<SqlValue>>>> {
        let row = self.rows.pop_front();
        Box::pin(async move { Ok(row) })
    }
}

impl Drop for MockCursor {
    fn drop(&mut self) {
        self.log
            .lock()
            .unwrap()
            .push(Event::CursorClosed(self.connection));
    }
}

/// Let spawned cleanup tasks run.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
}
