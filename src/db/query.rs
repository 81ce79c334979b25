//! Fluent statement builders.
//!
//! [`Database`] is the entry point. Builders collect state and render it only when they
//! run (or when [`statement`](Select::statement) is asked for), so values go through the
//! [`TypeConverter`] with the provider's dialect in hand.
//!
//! Table and column names go through [`quote_identifier`](super::quote_identifier).
//! Raw fragments (the base text of [`Database::query`], join conditions, suffixes,
//! [`Database::exec`] statements) are inserted verbatim and must come from trusted code;
//! user-controlled values belong in predicates, which are always bound as parameters.

use super::convert::{SqlArg, TypeConverter};
use super::generated_key::KeySlot;
use super::predicate::{Arg, Predicate, SqlWriter, Statement, quote_identifier};
use super::provider::Provider;
use super::stream::{Lease, Mapper, ResultStream, Row};
use super::value::{Dialect, SqlValue};
use crate::error::{DbError, DbResult};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Query entry point bound to one provider.
#[derive(Clone)]
pub struct Database {
    provider: Provider,
    conv: Arc<TypeConverter>,
}

impl Database {
    /// Use the process-wide [`TypeConverter::shared`] registry.
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            conv: TypeConverter::shared(),
        }
    }

    pub fn with_converter(mut self, conv: Arc<TypeConverter>) -> Self {
        self.conv = conv;
        self
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    pub fn converter(&self) -> &Arc<TypeConverter> {
        &self.conv
    }

    pub fn dialect(&self) -> Dialect {
        self.provider.dialect()
    }

    /// `select * from <table>`.
    pub fn select(&self, table: &str) -> Select {
        Select::new(self.clone(), format!("select * from {}", quote_identifier(table)))
    }

    /// The row of `table` whose `id` column equals `id`.
    ///
    /// A missing row is [`DbError::NotFound`] reading `<table>:<id> not found`.
    pub async fn get<I>(&self, table: &str, id: I) -> DbResult<Row>
    where
        I: Into<Arg> + fmt::Display,
    {
        self.get_by(table, "id", id).await
    }

    /// Like [`get`](Self::get), matching on `column`. `table` may carry an alias or
    /// joins (`users u join teams t on ...`); only its first word names the row in the
    /// not-found message.
    pub async fn get_by<I>(&self, table: &str, column: &str, id: I) -> DbResult<Row>
    where
        I: Into<Arg> + fmt::Display,
    {
        let label = format!(
            "{}:{}",
            table.split_whitespace().next().unwrap_or(table),
            id
        );
        self.select(table)
            .filter([(column, id)])
            .first()
            .await?
            .ok_or_else(|| DbError::not_found(format!("{} not found", label)))
    }

    /// Start from a raw select statement.
    pub fn query(&self, sql: impl Into<String>) -> Select {
        Select::new(self.clone(), sql.into())
    }

    pub fn insert(&self, table: &str) -> Insert {
        Insert {
            db: self.clone(),
            table: table.to_string(),
            rows: Vec::new(),
            on_conflict: None,
        }
    }

    pub fn update(&self, table: &str) -> Update {
        Update {
            db: self.clone(),
            table: table.to_string(),
            set: Vec::new(),
            filter: Vec::new(),
        }
    }

    pub fn delete(&self, table: &str) -> Delete {
        Delete {
            db: self.clone(),
            table: table.to_string(),
            filter: Vec::new(),
        }
    }

    /// Run a raw statement with positional parameters written in the dialect's
    /// placeholder syntax. Returns the number of affected rows.
    pub async fn exec(&self, sql: &str, params: &[&dyn SqlArg]) -> DbResult<u64> {
        let hint = Some(self.dialect());
        let params = params
            .iter()
            .map(|p| p.convert(&self.conv, hint))
            .collect::<DbResult<Vec<_>>>()?;
        self.execute(Ok(Statement {
            sql: sql.to_string(),
            params,
        }))
        .await
    }

    /// `select count(*) from <table> where ...`.
    pub async fn count(
        &self,
        table: &str,
        filter: impl IntoIterator<Item = impl Into<Predicate>>,
    ) -> DbResult<i64> {
        Select::new(
            self.clone(),
            format!("select count(*) from {}", quote_identifier(table)),
        )
        .filter(filter)
        .map(|row| row.get_at::<i64>(0))
        .one()
        .await
    }

    async fn execute(&self, statement: DbResult<Statement>) -> DbResult<u64> {
        let statement = statement?;
        debug!(sql = %statement.sql, params = statement.params.len(), "Executing statement");
        let mut lease = Lease::acquire(&self.provider).await?;
        lease
            .connection()?
            .execute(&statement.sql, &statement.params)
            .await
    }

    fn writer(&self) -> SqlWriter<'_> {
        SqlWriter::new(self.dialect(), &self.conv)
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("dialect", &self.dialect())
            .field("converter", &self.conv)
            .finish()
    }
}

/// Row lock taken by a select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Update,
    UpdateNoWait,
    UpdateSkipLocked,
    Share,
}

impl LockMode {
    pub fn sql(&self) -> &'static str {
        match self {
            Self::Update => "for update",
            Self::UpdateNoWait => "for update nowait",
            Self::UpdateSkipLocked => "for update skip locked",
            Self::Share => "for share",
        }
    }
}

/// Select builder. Produces rows as [`Row`] until a mapper is set.
#[derive(Clone)]
pub struct Select {
    db: Database,
    base: String,
    joins: Vec<String>,
    filter: Vec<Predicate>,
    group_by: Vec<String>,
    order: Vec<(String, bool)>,
    suffix: Vec<String>,
    limit: Option<u64>,
    offset: Option<u64>,
    lock: Option<LockMode>,
}

impl Select {
    fn new(db: Database, base: String) -> Self {
        Self {
            db,
            base,
            joins: Vec::new(),
            filter: Vec::new(),
            group_by: Vec::new(),
            order: Vec::new(),
            suffix: Vec::new(),
            limit: None,
            offset: None,
            lock: None,
        }
    }

    /// `join <table> on <on>`; `on` is raw.
    pub fn join(mut self, table: &str, on: &str) -> Self {
        self.joins
            .push(format!("join {} on {}", quote_identifier(table), on));
        self
    }

    pub fn left_join(mut self, table: &str, on: &str) -> Self {
        self.joins
            .push(format!("left join {} on {}", quote_identifier(table), on));
        self
    }

    /// Append predicates to the where list.
    pub fn filter(mut self, predicates: impl IntoIterator<Item = impl Into<Predicate>>) -> Self {
        self.filter.extend(predicates.into_iter().map(Into::into));
        self
    }

    pub fn and(mut self, predicate: impl Into<Predicate>) -> Self {
        self.filter.push(predicate.into());
        self
    }

    pub fn group_by<S: AsRef<str>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.group_by
            .extend(columns.into_iter().map(|c| quote_identifier(c.as_ref())));
        self
    }

    pub fn order(mut self, column: &str, ascending: bool) -> Self {
        self.order.push((quote_identifier(column), ascending));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Raw fragment rendered after `group by`, e.g. a `having` clause.
    pub fn suffix(mut self, sql: impl Into<String>) -> Self {
        self.suffix.push(sql.into());
        self
    }

    /// Lock the selected rows. Ignored on SQLite, which has no row locks.
    pub fn for_update(mut self, mode: LockMode) -> Self {
        self.lock = Some(mode);
        self
    }

    pub fn statement(&self) -> DbResult<Statement> {
        let mut w = self.db.writer();
        w.push(&self.base);
        for join in &self.joins {
            w.push(" ").push(join);
        }
        w.write_where(&self.filter)?;
        if !self.group_by.is_empty() {
            w.push(" group by ").push(&self.group_by.join(", "));
        }
        for suffix in &self.suffix {
            w.push(" ").push(suffix);
        }
        if !self.order.is_empty() {
            let order: Vec<String> = self
                .order
                .iter()
                .map(|(column, ascending)| {
                    format!("{} {}", column, if *ascending { "asc" } else { "desc" })
                })
                .collect();
            w.push(" order by ").push(&order.join(", "));
        }
        if let Some(limit) = self.limit {
            w.push(&format!(" limit {}", limit));
        }
        if let Some(offset) = self.offset {
            w.push(&format!(" offset {}", offset));
        }
        if let Some(lock) = self.lock {
            if w.dialect() != Dialect::Sqlite {
                w.push(" ").push(lock.sql());
            }
        }
        Ok(w.finish())
    }

    /// Map every row with `mapper`.
    pub fn map<R, F>(self, mapper: F) -> Query<R>
    where
        F: Fn(&Row) -> DbResult<R> + Send + Sync + 'static,
    {
        Query {
            select: self,
            mapper: Arc::new(mapper),
        }
    }

    /// Deserialize every row into `T` by column name.
    pub fn decode<T: DeserializeOwned>(self) -> Query<T> {
        self.map(|row| row.decode::<T>())
    }

    pub fn run(self) -> ResultStream<Row> {
        self.map(|row| Ok(row.clone())).run()
    }

    pub async fn list(self) -> DbResult<Vec<Row>> {
        self.run().list().await
    }

    pub async fn first(self) -> DbResult<Option<Row>> {
        self.run().first().await
    }

    pub async fn one(self) -> DbResult<Row> {
        self.run().one().await
    }
}

impl fmt::Debug for Select {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Select")
            .field("base", &self.base)
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

/// A select with a row mapper.
pub struct Query<R> {
    select: Select,
    mapper: Mapper<R>,
}

impl<R: Send + 'static> Query<R> {
    pub fn statement(&self) -> DbResult<Statement> {
        self.select.statement()
    }

    pub fn run(self) -> ResultStream<R> {
        let statement = self.select.statement();
        let db = self.select.db;
        ResultStream::new(db.provider, db.conv, statement, self.mapper)
    }

    pub async fn list(self) -> DbResult<Vec<R>> {
        self.run().list().await
    }

    pub async fn first(self) -> DbResult<Option<R>> {
        self.run().first().await
    }

    pub async fn one(self) -> DbResult<R> {
        self.run().one().await
    }
}

impl<R> Clone for Query<R> {
    fn clone(&self) -> Self {
        Self {
            select: self.select.clone(),
            mapper: Arc::clone(&self.mapper),
        }
    }
}

/// What an insert does when it hits a unique constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnConflict {
    DoNothing,
    /// Overwrite these columns with the values of the rejected row.
    Update(Vec<String>),
}

/// Insert builder, one or more rows.
///
/// Columns and values are rendered in the order the predicates were set. Predicates
/// holding a [`GeneratedKey`](super::GeneratedKey) are left out of the value list and
/// requested back with `returning`; the returned rows fill the keys of the inserted rows
/// in order.
pub struct Insert {
    db: Database,
    table: String,
    rows: Vec<Vec<Predicate>>,
    on_conflict: Option<(Vec<String>, OnConflict)>,
}

fn is_key(predicate: &Predicate) -> bool {
    matches!(predicate.value(), Arg::GeneratedKey(_))
}

struct InsertPlan {
    statement: Statement,
    keys: Vec<Vec<Arc<dyn KeySlot>>>,
}

impl Insert {
    /// Add predicates to the current row.
    pub fn set(mut self, predicates: impl IntoIterator<Item = impl Into<Predicate>>) -> Self {
        if self.rows.is_empty() {
            self.rows.push(Vec::new());
        }
        if let Some(row) = self.rows.last_mut() {
            row.extend(predicates.into_iter().map(Into::into));
        }
        self
    }

    /// Start another row.
    pub fn row(mut self, predicates: impl IntoIterator<Item = impl Into<Predicate>>) -> Self {
        self.rows
            .push(predicates.into_iter().map(Into::into).collect());
        self
    }

    pub fn on_conflict<S: AsRef<str>>(
        mut self,
        columns: impl IntoIterator<Item = S>,
        action: OnConflict,
    ) -> Self {
        let columns = columns
            .into_iter()
            .map(|c| c.as_ref().to_string())
            .collect();
        self.on_conflict = Some((columns, action));
        self
    }

    pub fn statement(&self) -> DbResult<Statement> {
        self.plan().map(|plan| plan.statement)
    }

    fn plan(&self) -> DbResult<InsertPlan> {
        let Some(first) = self.rows.first() else {
            return Err(DbError::invalid_input(format!(
                "insert into {} has no values",
                self.table
            )));
        };
        let columns: Vec<&str> = first
            .iter()
            .filter(|p| !is_key(p))
            .map(Predicate::column)
            .collect();
        let key_columns: Vec<&str> = first
            .iter()
            .filter(|p| is_key(p))
            .map(Predicate::column)
            .collect();

        let mut w = self.db.writer();
        w.push("insert into ").push_identifier(&self.table);

        if columns.is_empty() {
            if self.rows.len() > 1 {
                return Err(DbError::invalid_input(
                    "multi-row insert needs at least one value column",
                ));
            }
            w.push(" default values");
        } else {
            let quoted: Vec<String> = columns.iter().map(|c| quote_identifier(c)).collect();
            w.push(" (").push(&quoted.join(", ")).push(") values ");
        }

        let mut keys = Vec::with_capacity(self.rows.len());
        for (i, row) in self.rows.iter().enumerate() {
            let row_columns: Vec<&str> = row
                .iter()
                .filter(|p| !is_key(p))
                .map(Predicate::column)
                .collect();
            let row_keys: Vec<&str> = row
                .iter()
                .filter(|p| is_key(p))
                .map(Predicate::column)
                .collect();
            if row_columns != columns || row_keys != key_columns {
                return Err(DbError::invalid_input(format!(
                    "row {} of insert into {} does not match the columns of the first row",
                    i + 1,
                    self.table
                )));
            }

            if !columns.is_empty() {
                if i > 0 {
                    w.push(", ");
                }
                w.push("(");
                for (j, predicate) in row.iter().filter(|p| !is_key(p)).enumerate() {
                    if j > 0 {
                        w.push(", ");
                    }
                    let value = w.value_of(predicate)?;
                    w.bind(value);
                }
                w.push(")");
            }

            keys.push(
                row.iter()
                    .filter_map(|p| match p.value() {
                        Arg::GeneratedKey(slot) => Some(Arc::clone(slot)),
                        _ => None,
                    })
                    .collect(),
            );
        }

        if let Some((targets, action)) = &self.on_conflict {
            let targets: Vec<String> = targets.iter().map(|c| quote_identifier(c)).collect();
            w.push(" on conflict (").push(&targets.join(", ")).push(")");
            match action {
                OnConflict::DoNothing => {
                    w.push(" do nothing");
                }
                OnConflict::Update(update) if update.is_empty() => {
                    return Err(DbError::invalid_input(
                        "on conflict update needs at least one column",
                    ));
                }
                OnConflict::Update(update) => {
                    let assignments: Vec<String> = update
                        .iter()
                        .map(|c| {
                            let column = quote_identifier(c);
                            format!("{} = excluded.{}", column, column)
                        })
                        .collect();
                    w.push(" do update set ").push(&assignments.join(", "));
                }
            }
        }

        if !key_columns.is_empty() {
            let quoted: Vec<String> = key_columns.iter().map(|c| quote_identifier(c)).collect();
            w.push(" returning ").push(&quoted.join(", "));
        }

        Ok(InsertPlan {
            statement: w.finish(),
            keys,
        })
    }

    /// Run the insert and return the number of inserted rows.
    pub async fn run(self) -> DbResult<u64> {
        let plan = self.plan();
        let has_keys = matches!(&plan, Ok(plan) if plan.keys.iter().any(|k| !k.is_empty()));
        if !has_keys {
            return self.db.execute(plan.map(|p| p.statement)).await;
        }
        let InsertPlan { statement, keys } = plan?;

        debug!(sql = %statement.sql, params = statement.params.len(), "Executing insert");
        let returned = {
            let mut lease = Lease::acquire(&self.db.provider).await?;
            let mut cursor = lease
                .connection()?
                .query(&statement.sql, &statement.params)
                .await?;
            let mut returned: Vec<Vec<SqlValue>> = Vec::with_capacity(keys.len());
            while let Some(values) = cursor.next().await? {
                returned.push(values);
            }
            returned
        };

        if returned.len() != keys.len() {
            // Rows skipped by `on conflict do nothing` return nothing; positions no
            // longer line up, so leave every key unassigned.
            warn!(
                table = %self.table,
                inserted = returned.len(),
                rows = keys.len(),
                "Returned keys do not match inserted rows; generated keys left unassigned"
            );
            return Ok(returned.len() as u64);
        }

        for (slots, values) in keys.iter().zip(returned.iter()) {
            for (slot, value) in slots.iter().zip(values.iter()) {
                slot.fill(value.clone(), &self.db.conv)?;
            }
        }
        Ok(returned.len() as u64)
    }
}

impl fmt::Debug for Insert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Insert")
            .field("table", &self.table)
            .field("rows", &self.rows)
            .field("on_conflict", &self.on_conflict)
            .finish_non_exhaustive()
    }
}

/// Update builder.
#[derive(Debug)]
pub struct Update {
    db: Database,
    table: String,
    set: Vec<Predicate>,
    filter: Vec<Predicate>,
}

impl Update {
    pub fn set(mut self, predicates: impl IntoIterator<Item = impl Into<Predicate>>) -> Self {
        self.set.extend(predicates.into_iter().map(Into::into));
        self
    }

    pub fn filter(mut self, predicates: impl IntoIterator<Item = impl Into<Predicate>>) -> Self {
        self.filter.extend(predicates.into_iter().map(Into::into));
        self
    }

    pub fn and(mut self, predicate: impl Into<Predicate>) -> Self {
        self.filter.push(predicate.into());
        self
    }

    pub fn statement(&self) -> DbResult<Statement> {
        if self.set.is_empty() {
            return Err(DbError::invalid_input(format!(
                "update of {} sets no columns",
                self.table
            )));
        }
        let mut w = self.db.writer();
        w.push("update ").push_identifier(&self.table).push(" set ");
        w.write_assignments(&self.set)?;
        w.write_where(&self.filter)?;
        Ok(w.finish())
    }

    /// Run the update and return the number of affected rows.
    pub async fn run(self) -> DbResult<u64> {
        self.db.execute(self.statement()).await
    }
}

/// Delete builder.
#[derive(Debug)]
pub struct Delete {
    db: Database,
    table: String,
    filter: Vec<Predicate>,
}

impl Delete {
    pub fn filter(mut self, predicates: impl IntoIterator<Item = impl Into<Predicate>>) -> Self {
        self.filter.extend(predicates.into_iter().map(Into::into));
        self
    }

    pub fn and(mut self, predicate: impl Into<Predicate>) -> Self {
        self.filter.push(predicate.into());
        self
    }

    pub fn statement(&self) -> DbResult<Statement> {
        let mut w = self.db.writer();
        w.push("delete from ").push_identifier(&self.table);
        w.write_where(&self.filter)?;
        Ok(w.finish())
    }

    /// Run the delete and return the number of affected rows.
    pub async fn run(self) -> DbResult<u64> {
        self.db.execute(self.statement()).await
    }
}
