//! Conversion between domain types and [`SqlValue`].
//!
//! # Resolution order
//!
//! Towards the driver ([`TypeConverter::to`]):
//! 1. a converter registered for the exact type,
//! 2. native types pass through (`i64`, `String`, `Uuid`, `Decimal`, chrono types...),
//! 3. single-field wrappers unwrap ([`sql_wrapper!`](crate::sql_wrapper)),
//! 4. types with a string form convert via `Display` ([`sql_string!`](crate::sql_string)),
//! 5. collections convert element-wise into [`SqlValue::Array`],
//! 6. [`SqlValue`] itself passes through unchanged.
//!
//! A type with an empty `impl ToSql` relies on registration alone and fails with
//! [`DbError::Conversion`] when nothing is registered.
//!
//! Back from the driver ([`TypeConverter::from`]) registered converters win, then the
//! target type's [`FromSql`] impl applies.

use super::value::{Dialect, SqlValue, element_type};
use crate::error::{DbError, DbResult};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::Value as JsonValue;
use std::any::{Any, TypeId, type_name};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::SystemTime;
use uuid::Uuid;

/// Implement [`ToSql`] and [`FromSql`] for single-field tuple structs by delegating to
/// the wrapped value.
///
/// ```ignore
/// #[derive(Debug, Clone, PartialEq)]
/// struct UserId(uuid::Uuid);
/// txsql::sql_wrapper!(UserId);
/// ```
#[macro_export]
macro_rules! sql_wrapper {
    ($($wrapper:ty),+ $(,)?) => {$(
        impl $crate::db::ToSql for $wrapper {
            fn to_sql(
                &self,
                conv: &$crate::db::TypeConverter,
                hint: Option<$crate::db::Dialect>,
            ) -> $crate::DbResult<$crate::db::SqlValue> {
                conv.to(&self.0, hint)
            }
        }

        impl $crate::db::FromSql for $wrapper {
            fn from_sql(
                value: $crate::db::SqlValue,
                conv: &$crate::db::TypeConverter,
            ) -> $crate::DbResult<Self> {
                conv.from(value).map(Self)
            }
        }
    )+};
}

/// Implement [`ToSql`] and [`FromSql`] through the type's `Display`/`FromStr` pair.
#[macro_export]
macro_rules! sql_string {
    ($($ty:ty),+ $(,)?) => {$(
        impl $crate::db::ToSql for $ty {
            fn to_sql(
                &self,
                _conv: &$crate::db::TypeConverter,
                _hint: Option<$crate::db::Dialect>,
            ) -> $crate::DbResult<$crate::db::SqlValue> {
                Ok($crate::db::SqlValue::Text(self.to_string()))
            }
        }

        impl $crate::db::FromSql for $ty {
            fn from_sql(
                value: $crate::db::SqlValue,
                conv: &$crate::db::TypeConverter,
            ) -> $crate::DbResult<Self> {
                let text: String = conv.from(value)?;
                text.parse::<Self>()
                    .map_err(|e| $crate::DbError::conversion(stringify!($ty), e.to_string()))
            }
        }
    )+};
}

/// A domain value that can be sent to the driver.
///
/// Implementors are `'static` because registered converters are keyed by `TypeId`.
/// String literals qualify; other borrowed strings are passed as `String`.
pub trait ToSql: Any + Send + Sync + fmt::Debug {
    /// Conversion used when no converter is registered for the type.
    fn to_sql(&self, conv: &TypeConverter, hint: Option<Dialect>) -> DbResult<SqlValue> {
        let _ = (conv, hint);
        Err(DbError::conversion(
            type_name::<Self>(),
            "no converter registered and no string form",
        ))
    }

    /// Elements of a collection value. Predicates render these as `in (...)`.
    fn as_list(&self) -> Option<Vec<&dyn SqlArg>> {
        None
    }
}

/// Object-safe view of a [`ToSql`] value, as stored inside predicates.
pub trait SqlArg: Send + Sync + fmt::Debug {
    fn convert(&self, conv: &TypeConverter, hint: Option<Dialect>) -> DbResult<SqlValue>;
    fn elements(&self) -> Option<Vec<&dyn SqlArg>>;
}

impl<T: ToSql> SqlArg for T {
    fn convert(&self, conv: &TypeConverter, hint: Option<Dialect>) -> DbResult<SqlValue> {
        conv.to(self, hint)
    }

    fn elements(&self) -> Option<Vec<&dyn SqlArg>> {
        ToSql::as_list(self)
    }
}

/// A domain type that can be built from a driver value.
pub trait FromSql: Sized + 'static {
    fn from_sql(value: SqlValue, conv: &TypeConverter) -> DbResult<Self> {
        let _ = conv;
        Err(DbError::conversion(
            type_name::<Self>(),
            format!("no converter registered for {} values", value.kind()),
        ))
    }
}

type ToFn = Arc<dyn Fn(&dyn Any, Option<Dialect>) -> DbResult<SqlValue> + Send + Sync>;
type FromFn = Arc<dyn Fn(SqlValue) -> DbResult<Box<dyn Any + Send>> + Send + Sync>;

/// Registry of explicit converters plus the fixed fallback chain.
///
/// Reads happen on every bound parameter and are lock-shared; registration is expected
/// at startup.
pub struct TypeConverter {
    to: RwLock<HashMap<TypeId, ToFn>>,
    from: RwLock<HashMap<TypeId, FromFn>>,
}

impl TypeConverter {
    /// Create a converter with the default registrations.
    pub fn new() -> Self {
        let conv = Self::empty();
        conv.register::<SystemTime, _>(|v, _| Ok(SqlValue::TimestampTz(DateTime::<Utc>::from(*v))));
        conv.register_from::<SystemTime, _>(|v| timestamp_utc(v).map(SystemTime::from));
        conv.register::<DateTime<FixedOffset>, _>(|v, _| {
            Ok(SqlValue::TimestampTz(v.with_timezone(&Utc)))
        });
        conv
    }

    /// Create a converter without any registrations.
    pub fn empty() -> Self {
        Self {
            to: RwLock::new(HashMap::new()),
            from: RwLock::new(HashMap::new()),
        }
    }

    /// Process-wide converter used by [`Database`](super::Database) unless another is injected.
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<TypeConverter>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Arc::new(TypeConverter::new())))
    }

    /// Register a converter towards the driver for `T`, replacing any previous one.
    pub fn register<T, F>(&self, converter: F)
    where
        T: Any + Send + Sync,
        F: Fn(&T, Option<Dialect>) -> DbResult<SqlValue> + Send + Sync + 'static,
    {
        let erased: ToFn = Arc::new(move |value: &dyn Any, hint| match value.downcast_ref::<T>() {
            Some(value) => converter(value, hint),
            None => Err(DbError::conversion(type_name::<T>(), "converter type mismatch")),
        });
        self.to
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(TypeId::of::<T>(), erased);
    }

    /// Register a converter from the driver for `T`, replacing any previous one.
    pub fn register_from<T, F>(&self, converter: F)
    where
        T: Any + Send,
        F: Fn(SqlValue) -> DbResult<T> + Send + Sync + 'static,
    {
        let erased: FromFn =
            Arc::new(move |value| converter(value).map(|v| Box::new(v) as Box<dyn Any + Send>));
        self.from
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(TypeId::of::<T>(), erased);
    }

    pub fn is_registered<T: Any>(&self) -> bool {
        self.to
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&TypeId::of::<T>())
    }

    /// Convert a domain value to its driver representation.
    pub fn to<T: ToSql>(&self, value: &T, hint: Option<Dialect>) -> DbResult<SqlValue> {
        let registered = self
            .to
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&TypeId::of::<T>())
            .cloned();
        match registered {
            Some(converter) => converter(value as &dyn Any, hint),
            None => value.to_sql(self, hint),
        }
    }

    /// Convert a driver value to the requested domain type.
    pub fn from<T: FromSql>(&self, value: SqlValue) -> DbResult<T> {
        let registered = self
            .from
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&TypeId::of::<T>())
            .cloned();
        match registered {
            Some(converter) => converter(value)?
                .downcast::<T>()
                .map(|boxed| *boxed)
                .map_err(|_| DbError::conversion(type_name::<T>(), "converter type mismatch")),
            None => T::from_sql(value, self),
        }
    }
}

impl Default for TypeConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TypeConverter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let to = self.to.read().map(|m| m.len()).unwrap_or_default();
        let from = self.from.read().map(|m| m.len()).unwrap_or_default();
        f.debug_struct("TypeConverter")
            .field("to_converters", &to)
            .field("from_converters", &from)
            .finish()
    }
}

// =============================================================================
// Towards the driver
// =============================================================================

macro_rules! native_to_sql {
    ($($ty:ty => |$v:ident| $expr:expr),+ $(,)?) => {$(
        impl ToSql for $ty {
            fn to_sql(&self, _conv: &TypeConverter, _hint: Option<Dialect>) -> DbResult<SqlValue> {
                let $v = self;
                Ok($expr)
            }
        }
    )+};
}

native_to_sql! {
    bool => |v| SqlValue::Bool(*v),
    i16 => |v| SqlValue::Int(i64::from(*v)),
    i32 => |v| SqlValue::Int(i64::from(*v)),
    i64 => |v| SqlValue::Int(*v),
    u32 => |v| SqlValue::Int(i64::from(*v)),
    f32 => |v| SqlValue::Float(f64::from(*v)),
    f64 => |v| SqlValue::Float(*v),
    String => |v| SqlValue::Text(v.clone()),
    &'static str => |v| SqlValue::Text((*v).to_string()),
    Decimal => |v| SqlValue::Numeric(*v),
    Uuid => |v| SqlValue::Uuid(*v),
    NaiveDate => |v| SqlValue::Date(*v),
    NaiveTime => |v| SqlValue::Time(*v),
    NaiveDateTime => |v| SqlValue::Timestamp(*v),
    DateTime<Utc> => |v| SqlValue::TimestampTz(*v),
    JsonValue => |v| SqlValue::Json(v.clone()),
    SqlValue => |v| v.clone(),
}

// Registration-only types.
impl ToSql for SystemTime {}
impl ToSql for DateTime<FixedOffset> {}

sql_string!(url::Url, std::net::IpAddr);

impl<T: ToSql> ToSql for Option<T> {
    fn to_sql(&self, conv: &TypeConverter, hint: Option<Dialect>) -> DbResult<SqlValue> {
        match self {
            Some(value) => conv.to(value, hint),
            None => Ok(SqlValue::Null),
        }
    }

    fn as_list(&self) -> Option<Vec<&dyn SqlArg>> {
        self.as_ref().and_then(|v| ToSql::as_list(v))
    }
}

fn array_to_sql<'a, T: ToSql>(
    items: impl Iterator<Item = &'a T>,
    conv: &TypeConverter,
    hint: Option<Dialect>,
) -> DbResult<SqlValue> {
    let values = items
        .map(|item| conv.to(item, hint))
        .collect::<DbResult<Vec<_>>>()?;
    let array = SqlValue::Array(element_type(&values), values);
    Ok(match hint {
        // SQLite has no array type; store the JSON text instead.
        Some(Dialect::Sqlite) => SqlValue::Json(array.to_json()),
        _ => array,
    })
}

fn list_of<'a, T: ToSql>(items: impl Iterator<Item = &'a T>) -> Vec<&'a dyn SqlArg> {
    items.map(|item| item as &dyn SqlArg).collect()
}

impl<T: ToSql> ToSql for Vec<T> {
    fn to_sql(&self, conv: &TypeConverter, hint: Option<Dialect>) -> DbResult<SqlValue> {
        array_to_sql(self.iter(), conv, hint)
    }

    fn as_list(&self) -> Option<Vec<&dyn SqlArg>> {
        Some(list_of(self.iter()))
    }
}

impl<T: ToSql, const N: usize> ToSql for [T; N] {
    fn to_sql(&self, conv: &TypeConverter, hint: Option<Dialect>) -> DbResult<SqlValue> {
        array_to_sql(self.iter(), conv, hint)
    }

    fn as_list(&self) -> Option<Vec<&dyn SqlArg>> {
        Some(list_of(self.iter()))
    }
}

impl<T: ToSql + Eq + Hash> ToSql for HashSet<T> {
    fn to_sql(&self, conv: &TypeConverter, hint: Option<Dialect>) -> DbResult<SqlValue> {
        array_to_sql(self.iter(), conv, hint)
    }

    fn as_list(&self) -> Option<Vec<&dyn SqlArg>> {
        Some(list_of(self.iter()))
    }
}

impl<T: ToSql + Ord> ToSql for BTreeSet<T> {
    fn to_sql(&self, conv: &TypeConverter, hint: Option<Dialect>) -> DbResult<SqlValue> {
        array_to_sql(self.iter(), conv, hint)
    }

    fn as_list(&self) -> Option<Vec<&dyn SqlArg>> {
        Some(list_of(self.iter()))
    }
}

// =============================================================================
// Back from the driver
// =============================================================================

fn mismatch<T>(value: &SqlValue) -> DbError {
    DbError::conversion(type_name::<T>(), format!("unexpected {} value", value.kind()))
}

fn parse_text<T>(text: &str) -> DbResult<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    text.trim()
        .parse::<T>()
        .map_err(|e| DbError::conversion(type_name::<T>(), format!("{}: {:?}", e, text)))
}

fn integer(value: SqlValue) -> DbResult<i64> {
    match value {
        SqlValue::Int(v) => Ok(v),
        SqlValue::Bool(v) => Ok(i64::from(v)),
        SqlValue::Numeric(ref d) => d.to_i64().ok_or_else(|| mismatch::<i64>(&value)),
        SqlValue::Text(ref s) => parse_text(s),
        other => Err(mismatch::<i64>(&other)),
    }
}

fn narrow<T: TryFrom<i64>>(value: SqlValue) -> DbResult<T> {
    let wide = integer(value)?;
    T::try_from(wide).map_err(|_| DbError::conversion(type_name::<T>(), format!("{} out of range", wide)))
}

fn float(value: SqlValue) -> DbResult<f64> {
    match value {
        SqlValue::Float(v) => Ok(v),
        SqlValue::Int(v) => Ok(v as f64),
        SqlValue::Numeric(ref d) => d.to_f64().ok_or_else(|| mismatch::<f64>(&value)),
        SqlValue::Text(ref s) => parse_text(s),
        other => Err(mismatch::<f64>(&other)),
    }
}

fn naive_timestamp(text: &str) -> DbResult<NaiveDateTime> {
    let text = text.trim();
    NaiveDateTime::from_str(text)
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))
        .map_err(|e| DbError::conversion("NaiveDateTime", format!("{}: {:?}", e, text)))
}

/// Timestamps without zone are taken as UTC.
fn timestamp_utc(value: SqlValue) -> DbResult<DateTime<Utc>> {
    match value {
        SqlValue::TimestampTz(v) => Ok(v),
        SqlValue::Timestamp(v) => Ok(v.and_utc()),
        SqlValue::Text(ref s) => match DateTime::parse_from_rfc3339(s.trim()) {
            Ok(v) => Ok(v.with_timezone(&Utc)),
            Err(_) => naive_timestamp(s).map(|v| v.and_utc()),
        },
        other => Err(mismatch::<DateTime<Utc>>(&other)),
    }
}

impl FromSql for SqlValue {
    fn from_sql(value: SqlValue, _conv: &TypeConverter) -> DbResult<Self> {
        Ok(value)
    }
}

impl FromSql for bool {
    fn from_sql(value: SqlValue, _conv: &TypeConverter) -> DbResult<Self> {
        match value {
            SqlValue::Bool(v) => Ok(v),
            SqlValue::Int(v) => Ok(v != 0),
            SqlValue::Text(ref s) => parse_text(s),
            other => Err(mismatch::<bool>(&other)),
        }
    }
}

impl FromSql for i64 {
    fn from_sql(value: SqlValue, _conv: &TypeConverter) -> DbResult<Self> {
        integer(value)
    }
}

impl FromSql for i32 {
    fn from_sql(value: SqlValue, _conv: &TypeConverter) -> DbResult<Self> {
        narrow(value)
    }
}

impl FromSql for i16 {
    fn from_sql(value: SqlValue, _conv: &TypeConverter) -> DbResult<Self> {
        narrow(value)
    }
}

impl FromSql for u32 {
    fn from_sql(value: SqlValue, _conv: &TypeConverter) -> DbResult<Self> {
        narrow(value)
    }
}

impl FromSql for f64 {
    fn from_sql(value: SqlValue, _conv: &TypeConverter) -> DbResult<Self> {
        float(value)
    }
}

impl FromSql for f32 {
    fn from_sql(value: SqlValue, _conv: &TypeConverter) -> DbResult<Self> {
        float(value).map(|v| v as f32)
    }
}

impl FromSql for String {
    fn from_sql(value: SqlValue, _conv: &TypeConverter) -> DbResult<Self> {
        match value {
            SqlValue::Text(v) => Ok(v),
            other => other.to_text().ok_or_else(|| mismatch::<String>(&other)),
        }
    }
}

impl FromSql for Decimal {
    fn from_sql(value: SqlValue, _conv: &TypeConverter) -> DbResult<Self> {
        match value {
            SqlValue::Numeric(v) => Ok(v),
            SqlValue::Int(v) => Ok(Decimal::from(v)),
            SqlValue::Float(v) => {
                Decimal::try_from(v).map_err(|e| DbError::conversion("Decimal", e.to_string()))
            }
            SqlValue::Text(ref s) => parse_text(s),
            other => Err(mismatch::<Decimal>(&other)),
        }
    }
}

impl FromSql for Uuid {
    fn from_sql(value: SqlValue, _conv: &TypeConverter) -> DbResult<Self> {
        match value {
            SqlValue::Uuid(v) => Ok(v),
            SqlValue::Text(ref s) => parse_text(s),
            SqlValue::Bytes(ref b) => {
                Uuid::from_slice(b).map_err(|e| DbError::conversion("Uuid", e.to_string()))
            }
            other => Err(mismatch::<Uuid>(&other)),
        }
    }
}

impl FromSql for NaiveDate {
    fn from_sql(value: SqlValue, _conv: &TypeConverter) -> DbResult<Self> {
        match value {
            SqlValue::Date(v) => Ok(v),
            SqlValue::Timestamp(v) => Ok(v.date()),
            SqlValue::TimestampTz(v) => Ok(v.date_naive()),
            SqlValue::Text(ref s) => parse_text(s),
            other => Err(mismatch::<NaiveDate>(&other)),
        }
    }
}

impl FromSql for NaiveTime {
    fn from_sql(value: SqlValue, _conv: &TypeConverter) -> DbResult<Self> {
        match value {
            SqlValue::Time(v) => Ok(v),
            SqlValue::Text(ref s) => parse_text(s),
            other => Err(mismatch::<NaiveTime>(&other)),
        }
    }
}

impl FromSql for NaiveDateTime {
    fn from_sql(value: SqlValue, _conv: &TypeConverter) -> DbResult<Self> {
        match value {
            SqlValue::Timestamp(v) => Ok(v),
            SqlValue::TimestampTz(v) => Ok(v.naive_utc()),
            SqlValue::Text(ref s) => naive_timestamp(s),
            other => Err(mismatch::<NaiveDateTime>(&other)),
        }
    }
}

impl FromSql for DateTime<Utc> {
    fn from_sql(value: SqlValue, _conv: &TypeConverter) -> DbResult<Self> {
        timestamp_utc(value)
    }
}

impl FromSql for JsonValue {
    fn from_sql(value: SqlValue, _conv: &TypeConverter) -> DbResult<Self> {
        match value {
            SqlValue::Json(v) => Ok(v),
            SqlValue::Text(s) => {
                serde_json::from_str(&s).map_err(|e| DbError::conversion("JSON", e.to_string()))
            }
            other => Ok(other.to_json()),
        }
    }
}

impl FromSql for SystemTime {}

impl<T: FromSql> FromSql for Option<T> {
    fn from_sql(value: SqlValue, conv: &TypeConverter) -> DbResult<Self> {
        match value {
            SqlValue::Null => Ok(None),
            value => conv.from(value).map(Some),
        }
    }
}

/// Elements of a driver array, or of a JSON array stored where arrays are unsupported.
fn array_items<T>(value: SqlValue) -> DbResult<Vec<SqlValue>> {
    match value {
        SqlValue::Array(_, items) => Ok(items),
        SqlValue::Json(JsonValue::Array(items)) => Ok(items.iter().map(SqlValue::from_json).collect()),
        SqlValue::Text(ref s) => match serde_json::from_str::<JsonValue>(s) {
            Ok(JsonValue::Array(items)) => Ok(items.iter().map(SqlValue::from_json).collect()),
            _ => Err(mismatch::<T>(&value)),
        },
        other => Err(mismatch::<T>(&other)),
    }
}

impl<T: FromSql> FromSql for Vec<T> {
    fn from_sql(value: SqlValue, conv: &TypeConverter) -> DbResult<Self> {
        array_items::<Self>(value)?
            .into_iter()
            .map(|item| conv.from(item))
            .collect()
    }
}

impl<T: FromSql + Eq + Hash> FromSql for HashSet<T> {
    fn from_sql(value: SqlValue, conv: &TypeConverter) -> DbResult<Self> {
        array_items::<Self>(value)?
            .into_iter()
            .map(|item| conv.from(item))
            .collect()
    }
}

impl<T: FromSql + Ord> FromSql for BTreeSet<T> {
    fn from_sql(value: SqlValue, conv: &TypeConverter) -> DbResult<Self> {
        array_items::<Self>(value)?
            .into_iter()
            .map(|item| conv.from(item))
            .collect()
    }
}
