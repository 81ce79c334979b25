//! Error types for txsql.
//!
//! All fallible operations return [`DbResult`]. Statement failures reported by the
//! driver propagate untouched; commit and rollback failures inside
//! [`Transaction::close`](crate::db::Transaction::close) are logged, never returned.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    /// The database could not be reached, or the pool gave up waiting for a connection.
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    /// The database rejected a statement.
    #[error("Statement failed: {message}")]
    Statement {
        message: String,
        /// Five-character SQLSTATE when the driver reports one
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Cannot convert {type_name}: {message}")]
    Conversion { type_name: String, message: String },

    #[error("Column not found: {column}")]
    ColumnNotFound { column: String },

    #[error("Transaction {transaction_id}: {message}")]
    Transaction {
        message: String,
        transaction_id: String,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn statement(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Statement {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// `type_name` names the Rust or SQL type that failed to convert.
    pub fn conversion(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Conversion {
            type_name: type_name.into(),
            message: message.into(),
        }
    }

    pub fn column_not_found(column: impl Into<String>) -> Self {
        Self::ColumnNotFound {
            column: column.into(),
        }
    }

    pub fn transaction(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Operator-facing hint attached to connection and statement failures.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } | Self::Statement { suggestion, .. } => {
                Some(suggestion)
            }
            _ => None,
        }
    }

    /// Connecting again later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Statement { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }
}

/// Marks errors that represent a deliberate, structured outcome rather than a fault.
///
/// [`RequestTransactionScope`](crate::db::RequestTransactionScope) still commits when a
/// unit of work fails with such an error; every other error rolls back.
pub trait ExpectedOutcome {
    fn is_expected_outcome(&self) -> bool;
}

impl ExpectedOutcome for DbError {
    fn is_expected_outcome(&self) -> bool {
        self.is_not_found()
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => DbError::statement(
                db_err.message(),
                db_err.code().map(|c| c.into_owned()),
                "Inspect the statement and the objects it references",
            ),
            sqlx::Error::RowNotFound => DbError::not_found("statement returned no rows"),
            sqlx::Error::PoolTimedOut => DbError::connection(
                "timed out waiting for a pooled connection",
                "Raise max_connections or acquire_timeout, or release connections sooner",
            ),
            sqlx::Error::PoolClosed => {
                DbError::connection("pool is closed", "Create a new provider")
            }
            sqlx::Error::Configuration(msg) => {
                DbError::connection(msg.to_string(), "Fix the data source URL")
            }
            err @ (sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::Protocol(_)) => {
                DbError::connection(err.to_string(), "Is the database server reachable?")
            }
            sqlx::Error::ColumnNotFound(col) => DbError::column_not_found(col),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::conversion(format!("column {}", index), source.to_string())
            }
            sqlx::Error::Decode(source) => DbError::conversion("value", source.to_string()),
            sqlx::Error::TypeNotFound { type_name } => {
                DbError::conversion(type_name, "unknown to the database")
            }
            other => DbError::internal(other.to_string()),
        }
    }
}

pub type DbResult<T> = Result<T, DbError>;
