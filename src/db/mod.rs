//! Database access layer.
//!
//! This module provides:
//! - Transactions bound to the task that runs them, and their propagation across awaits
//! - A per-request transaction scope
//! - A fluent select/insert/update/delete builder with predicate compilation
//! - Lazy result streams with type conversion
//! - An sqlx-backed connection provider for PostgreSQL and SQLite

pub mod context;
pub mod convert;
pub mod generated_key;
pub mod params;
pub mod pool;
pub mod predicate;
pub mod provider;
pub mod query;
pub mod request;
pub mod stream;
pub mod transaction;
pub mod types;
pub mod value;

pub use context::{TransactionContext, TransactionExt, spawn};
pub use convert::{FromSql, SqlArg, ToSql, TypeConverter};
pub use generated_key::{GeneratedKey, KeySlot};
pub use pool::{DbPool, SqlxConnection, SqlxProvider, wait_for_accept_connections};
pub use predicate::{Arg, Predicate, Statement, col, quote_identifier};
pub use provider::{Connection, ConnectionProvider, Cursor, Provider, VecCursor};
pub use query::{Database, Delete, Insert, LockMode, OnConflict, Query, Select, Update};
pub use request::{Method, RequestTransactionScope, Route};
pub use stream::{Columns, ResultStream, Row};
pub use transaction::{Transaction, TransactionConnection};
pub use types::{TypeCategory, categorize_type};
pub use value::{Dialect, SqlType, SqlValue};
