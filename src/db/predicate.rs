//! Column predicates and their compilation into SQL.
//!
//! A where list is an ordered `Vec<Predicate>`. Compilation keeps that order for both
//! the clauses and the bound parameters:
//!
//! - `Arg::Null`, or a value converting to [`SqlValue::Null`] → `col is null`
//! - a collection → `col in (p1, p2, ..)`, one parameter per element; empty → `1 = 0`
//! - anything else → `col = p`
//!
//! Values never reach the SQL text; they are bound as parameters.

use super::convert::{SqlArg, ToSql, TypeConverter};
use super::generated_key::{GeneratedKey, KeySlot};
use super::value::{Dialect, SqlValue};
use crate::error::{DbError, DbResult};
use std::sync::Arc;

/// Build a `Vec<Predicate>` from `column => value` pairs.
///
/// ```ignore
/// db.select("users").filter(predicates!["status" => "active", "team_id" => ids]);
/// ```
#[macro_export]
macro_rules! predicates {
    () => {
        ::std::vec::Vec::<$crate::db::Predicate>::new()
    };
    ($($column:expr => $value:expr),+ $(,)?) => {
        ::std::vec![$($crate::db::Predicate::new($column, $value)),+]
    };
}

/// Right-hand side of a predicate.
#[derive(Debug, Clone)]
pub enum Arg {
    Null,
    Value(Arc<dyn SqlArg>),
    /// Filled by the database on insert.
    GeneratedKey(Arc<dyn KeySlot>),
}

impl Arg {
    pub fn value(value: impl ToSql) -> Self {
        Self::Value(Arc::new(value))
    }
}

impl<T: ToSql> From<T> for Arg {
    fn from(value: T) -> Self {
        Self::Value(Arc::new(value))
    }
}

/// Borrowed strings are copied. A `&str` that is not `'static` has no [`ToSql`] impl,
/// since converters are looked up by `TypeId`; pass `s.to_owned()` instead.
impl From<&String> for Arg {
    fn from(value: &String) -> Self {
        Self::Value(Arc::new(value.clone()))
    }
}

impl<K> From<GeneratedKey<K>> for Arg
where
    GeneratedKey<K>: KeySlot + 'static,
{
    fn from(key: GeneratedKey<K>) -> Self {
        Self::GeneratedKey(Arc::new(key))
    }
}

/// A `(column, value)` pair used in where and set lists.
#[derive(Debug, Clone)]
pub struct Predicate {
    column: String,
    value: Arg,
}

impl Predicate {
    pub fn new(column: impl Into<String>, value: impl Into<Arg>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn value(&self) -> &Arg {
        &self.value
    }
}

/// Shorthand for [`Predicate::new`].
pub fn col(column: impl Into<String>, value: impl Into<Arg>) -> Predicate {
    Predicate::new(column, value)
}

impl<V: Into<Arg>> From<(&str, V)> for Predicate {
    fn from((column, value): (&str, V)) -> Self {
        Predicate::new(column, value)
    }
}

impl<V: Into<Arg>> From<(String, V)> for Predicate {
    fn from((column, value): (String, V)) -> Self {
        Predicate::new(column, value)
    }
}

/// Quote a table or column name.
///
/// A single token made of letters, digits and underscores, optionally dot-qualified
/// (`public.users`), is quoted per part. Anything else (`*`, `u.id as user_id`,
/// `count(*)`, `"Mixed"`) is passed through as a raw fragment.
pub fn quote_identifier(name: &str) -> String {
    let simple = !name.is_empty()
        && name.split('.').all(|part| {
            !part.is_empty() && part.chars().all(|c| c.is_alphanumeric() || c == '_')
        });
    if !simple {
        return name.to_string();
    }
    name.split('.')
        .map(|part| format!("\"{}\"", part))
        .collect::<Vec<_>>()
        .join(".")
}

/// Rendered SQL together with its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// Accumulates SQL text and numbers placeholders as parameters are bound.
pub(crate) struct SqlWriter<'c> {
    sql: String,
    params: Vec<SqlValue>,
    dialect: Dialect,
    conv: &'c TypeConverter,
}

impl<'c> SqlWriter<'c> {
    pub(crate) fn new(dialect: Dialect, conv: &'c TypeConverter) -> Self {
        Self {
            sql: String::new(),
            params: Vec::new(),
            dialect,
            conv,
        }
    }

    pub(crate) fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub(crate) fn push(&mut self, fragment: &str) -> &mut Self {
        self.sql.push_str(fragment);
        self
    }

    pub(crate) fn push_identifier(&mut self, name: &str) -> &mut Self {
        let quoted = quote_identifier(name);
        self.push(&quoted)
    }

    pub(crate) fn convert(&self, arg: &dyn SqlArg) -> DbResult<SqlValue> {
        arg.convert(self.conv, Some(self.dialect))
    }

    pub(crate) fn bind(&mut self, value: SqlValue) {
        self.params.push(value);
        let placeholder = self.dialect.placeholder(self.params.len());
        self.sql.push_str(&placeholder);
    }

    pub(crate) fn finish(self) -> Statement {
        Statement {
            sql: self.sql,
            params: self.params,
        }
    }

    /// Write ` where ...` for a non-empty predicate list.
    pub(crate) fn write_where(&mut self, predicates: &[Predicate]) -> DbResult<()> {
        if predicates.is_empty() {
            return Ok(());
        }
        self.push(" where ");
        for (i, predicate) in predicates.iter().enumerate() {
            if i > 0 {
                self.push(" and ");
            }
            self.write_condition(predicate)?;
        }
        Ok(())
    }

    fn write_condition(&mut self, predicate: &Predicate) -> DbResult<()> {
        let column = quote_identifier(&predicate.column);
        match &predicate.value {
            Arg::Null => {
                self.push(&column).push(" is null");
            }
            Arg::GeneratedKey(_) => {
                return Err(DbError::invalid_input(format!(
                    "generated key cannot be used as a condition on {}",
                    predicate.column
                )));
            }
            Arg::Value(value) => match value.elements() {
                Some(items) if items.is_empty() => {
                    self.push("1 = 0");
                }
                Some(items) => {
                    self.push(&column).push(" in (");
                    for (i, item) in items.into_iter().enumerate() {
                        if i > 0 {
                            self.push(", ");
                        }
                        let converted = self.convert(item)?;
                        self.bind(converted);
                    }
                    self.push(")");
                }
                None => {
                    let converted = self.convert(value.as_ref())?;
                    if converted.is_null() {
                        self.push(&column).push(" is null");
                    } else {
                        self.push(&column).push(" = ");
                        self.bind(converted);
                    }
                }
            },
        }
        Ok(())
    }

    /// Write `col = p, ...` for an update's set list.
    pub(crate) fn write_assignments(&mut self, predicates: &[Predicate]) -> DbResult<()> {
        for (i, predicate) in predicates.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            self.push_identifier(&predicate.column).push(" = ");
            let value = self.value_of(predicate)?;
            self.bind(value);
        }
        Ok(())
    }

    /// Value of a predicate used as data (set lists, insert values).
    pub(crate) fn value_of(&self, predicate: &Predicate) -> DbResult<SqlValue> {
        match &predicate.value {
            Arg::Null => Ok(SqlValue::Null),
            Arg::Value(value) => self.convert(value.as_ref()),
            Arg::GeneratedKey(_) => Err(DbError::invalid_input(format!(
                "generated key cannot be assigned to {}",
                predicate.column
            ))),
        }
    }
}
