//! Placeholders for database-assigned keys.

use super::convert::{FromSql, TypeConverter};
use super::value::SqlValue;
use crate::error::{DbError, DbResult};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Type-erased write side of a [`GeneratedKey`].
pub trait KeySlot: Send + Sync + fmt::Debug {
    /// Store the key returned by the driver, converted to the slot's type.
    fn fill(&self, value: SqlValue, conv: &TypeConverter) -> DbResult<()>;

    fn is_filled(&self) -> bool;
}

/// A key the database assigns on insert.
///
/// Pass a clone to [`Insert::set`](super::Insert::set) in place of a value; once the
/// insert has run the original holds the converted key.
///
/// ```ignore
/// let id = GeneratedKey::<i64>::new();
/// db.insert("users").set(predicates!["id" => id.clone(), "name" => "ada"]).run().await?;
/// let id = id.value()?;
/// ```
pub struct GeneratedKey<T> {
    slot: Arc<OnceLock<T>>,
}

impl<T> GeneratedKey<T> {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(OnceLock::new()),
        }
    }

    pub fn get(&self) -> Option<&T> {
        self.slot.get()
    }
}

impl<T: Clone> GeneratedKey<T> {
    /// The assigned key, or an error if the insert has not run yet.
    pub fn value(&self) -> DbResult<T> {
        self.get()
            .cloned()
            .ok_or_else(|| DbError::invalid_input("generated key has not been assigned yet"))
    }
}

impl<T> Clone for GeneratedKey<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Default for GeneratedKey<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for GeneratedKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(value) => f.debug_tuple("GeneratedKey").field(value).finish(),
            None => f.write_str("GeneratedKey(<unassigned>)"),
        }
    }
}

impl<T> KeySlot for GeneratedKey<T>
where
    T: FromSql + Send + Sync + fmt::Debug,
{
    fn fill(&self, value: SqlValue, conv: &TypeConverter) -> DbResult<()> {
        let key = conv.from::<T>(value)?;
        self.slot
            .set(key)
            .map_err(|_| DbError::invalid_input("generated key was already assigned"))
    }

    fn is_filled(&self) -> bool {
        self.slot.get().is_some()
    }
}
