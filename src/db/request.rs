//! Per-request transaction scope.
//!
//! Request handlers, background jobs and the CLI hand their unit of work to a
//! [`RequestTransactionScope`]. The work runs with a fresh [`Transaction`] attached, and
//! the transaction is committed or rolled back according to how the work ends:
//!
//! | outcome                                 | transaction |
//! |-----------------------------------------|-------------|
//! | `Ok(_)`                                 | commit      |
//! | `Err(e)` where `e.is_expected_outcome()`| commit      |
//! | any other `Err(_)`                      | rollback    |
//! | panic (re-raised afterwards)            | rollback    |
//! | future dropped before completion        | rollback    |

use super::context::TransactionExt;
use super::provider::Provider;
use super::transaction::Transaction;
use crate::error::{DbError, ExpectedOutcome};
use futures_util::FutureExt;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

/// HTTP request method of a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "HEAD" => Ok(Self::Head),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            "OPTIONS" => Ok(Self::Options),
            other => Err(DbError::invalid_input(format!(
                "Unknown request method: {}",
                other
            ))),
        }
    }
}

/// The unit of work a request maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub method: Method,
    pub path: String,
    /// Opt-out: run this route without a transaction.
    pub no_transaction: bool,
}

impl Route {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            no_transaction: false,
        }
    }

    pub fn without_transaction(mut self) -> Self {
        self.no_transaction = true;
        self
    }
}

/// Wraps units of work in a transaction of one provider.
#[derive(Clone)]
pub struct RequestTransactionScope {
    provider: Provider,
    excluded: HashSet<Method>,
}

impl RequestTransactionScope {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            excluded: HashSet::new(),
        }
    }

    /// Run routes with these methods without a transaction.
    pub fn exclude(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.excluded.extend(methods);
        self
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    pub fn is_excluded(&self, route: &Route) -> bool {
        route.no_transaction || self.excluded.contains(&route.method)
    }

    /// Run the work for `route`, inside a transaction unless the route is excluded.
    pub async fn decorate<W, Fut, T, E>(&self, route: &Route, work: W) -> Result<T, E>
    where
        W: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ExpectedOutcome,
    {
        if self.is_excluded(route) {
            debug!(method = %route.method, path = %route.path, "Running route without transaction");
            return work().await;
        }
        self.run(work()).await
    }

    /// Run the work inside a new transaction.
    pub async fn run<Fut, T, E>(&self, work: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        E: ExpectedOutcome,
    {
        let transaction = Transaction::open(Arc::clone(&self.provider));
        let _cancelled = CloseOnDrop(transaction.clone());
        debug!(transaction_id = %transaction.id(), "Starting unit of work");

        let outcome = AssertUnwindSafe(work.in_transaction(&transaction))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(value)) => {
                transaction.close(true).await;
                Ok(value)
            }
            Ok(Err(e)) => {
                let commit = e.is_expected_outcome();
                debug!(transaction_id = %transaction.id(), commit, "Unit of work failed");
                transaction.close(commit).await;
                Err(e)
            }
            Err(panic) => {
                warn!(transaction_id = %transaction.id(), "Unit of work panicked; rolling back");
                transaction.close(false).await;
                std::panic::resume_unwind(panic)
            }
        }
    }
}

impl fmt::Debug for RequestTransactionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestTransactionScope")
            .field("dialect", &self.provider.dialect())
            .field("excluded", &self.excluded)
            .finish()
    }
}

/// Rolls back a transaction whose unit of work was dropped before finishing.
///
/// Closing is async, so it is spawned onto the current runtime. Outside a runtime the
/// connection is released without a rollback when the last handle goes away.
struct CloseOnDrop(Transaction);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        if self.0.is_closed() {
            return;
        }

        let transaction = self.0.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    transaction.close(false).await;
                    warn!(
                        transaction_id = %transaction.id(),
                        "Transaction rolled back via Drop - unit of work was cancelled"
                    );
                });
            }
            Err(_) => warn!(
                transaction_id = %transaction.id(),
                "Unit of work cancelled outside a runtime; connection released without rollback"
            ),
        }
    }
}
