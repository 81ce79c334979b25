//! txsql Library
//!
//! A transactional query execution engine: transactions that follow the task running
//! them across awaits, a fluent builder producing parameterized SQL, and lazy result
//! streams that release their connection as soon as they are done.

pub mod config;
pub mod db;
pub mod error;

pub use config::Config;
pub use error::{DbError, DbResult, ExpectedOutcome};
