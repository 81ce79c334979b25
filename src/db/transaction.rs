//! Transactions bound to the task that runs them.
//!
//! A [`Transaction`] owns at most one connection from one provider. It becomes visible
//! to the query layer by being *attached* to the per-worker stack; the
//! [`TransactionContext`](super::TransactionContext) future wrapper attaches it on every
//! poll and detaches it afterwards, so the stack always reflects the task currently
//! being polled on that worker.
//!
//! The stack may hold transactions of several providers. Lookups return the topmost
//! entry for a provider, so attaching a second transaction for the same provider
//! shadows the first until it is detached.

use super::provider::{Connection, Provider, provider_key};
use crate::error::{DbError, DbResult};
use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error};
use uuid::Uuid;

thread_local! {
    static STACK: RefCell<Vec<Transaction>> = const { RefCell::new(Vec::new()) };
}

type Slot = Option<Box<dyn Connection>>;

struct Inner {
    id: Uuid,
    provider: Provider,
    connection: Arc<Mutex<Slot>>,
    closed: AtomicBool,
}

/// Handle to a database transaction. Clones share the same transaction.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<Inner>,
}

impl Transaction {
    /// Create an unattached transaction. No connection is opened until first use.
    pub fn open(provider: Provider) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                provider,
                connection: Arc::new(Mutex::new(None)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn provider(&self) -> &Provider {
        &self.inner.provider
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Whether this transaction draws its connection from `provider`.
    pub fn is_for(&self, provider: &Provider) -> bool {
        provider_key(&self.inner.provider) == provider_key(provider)
    }

    /// Whether both handles name the same transaction.
    pub fn same_as(&self, other: &Transaction) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Exclusive access to the transaction's connection, opening it on first use.
    ///
    /// A freshly opened connection is switched out of auto-commit before it is handed
    /// out. Statements of one transaction are serialized through the returned guard.
    pub async fn connection(&self) -> DbResult<TransactionConnection> {
        let mut slot = Arc::clone(&self.inner.connection).lock_owned().await;
        if self.is_closed() {
            return Err(DbError::transaction(
                "transaction is already closed",
                self.inner.id.to_string(),
            ));
        }

        if slot.is_none() {
            let mut connection = self.inner.provider.open_connection().await?;
            connection.set_auto_commit(false).await?;
            debug!(transaction_id = %self.inner.id, "Opened transaction connection");
            *slot = Some(connection);
        }

        Ok(TransactionConnection {
            transaction_id: self.inner.id,
            slot,
        })
    }

    /// Whether a connection has been opened for this transaction.
    pub async fn has_connection(&self) -> bool {
        self.inner.connection.lock().await.is_some()
    }

    /// Push this transaction onto the current worker's stack.
    pub fn attach(&self) -> &Self {
        STACK.with(|stack| stack.borrow_mut().push(self.clone()));
        self
    }

    /// Remove this transaction from the current worker's stack if it is the topmost
    /// entry for its provider. Otherwise nothing happens.
    pub fn detach(&self) {
        // The thread-local may already be gone during thread teardown.
        let _ = STACK.try_with(|stack| {
            let mut stack = stack.borrow_mut();
            let top = stack
                .iter()
                .rposition(|tx| tx.is_for(&self.inner.provider));
            if let Some(pos) = top {
                if stack[pos].same_as(self) {
                    stack.remove(pos);
                }
            }
        });
    }

    /// Topmost attached transaction for `provider` on the current worker.
    pub fn current_for(provider: &Provider) -> Option<Transaction> {
        STACK
            .try_with(|stack| {
                stack
                    .borrow()
                    .iter()
                    .rev()
                    .find(|tx| tx.is_for(provider))
                    .cloned()
            })
            .ok()
            .flatten()
    }

    /// Topmost attached transaction of any provider on the current worker.
    pub fn current() -> Option<Transaction> {
        STACK
            .try_with(|stack| stack.borrow().last().cloned())
            .ok()
            .flatten()
    }

    /// Commit the work done so far and keep the transaction open.
    pub async fn commit(&self) -> DbResult<()> {
        let mut slot = self.inner.connection.lock().await;
        match slot.as_mut() {
            Some(connection) if !connection.is_auto_commit() => connection.commit().await,
            _ => Ok(()),
        }
    }

    /// Roll back the work done so far and keep the transaction open.
    pub async fn rollback(&self) -> DbResult<()> {
        let mut slot = self.inner.connection.lock().await;
        match slot.as_mut() {
            Some(connection) if !connection.is_auto_commit() => connection.rollback().await,
            _ => Ok(()),
        }
    }

    /// Finish the transaction, committing or rolling back, and release its connection.
    ///
    /// Only the first call has any effect. Failures to commit, roll back or restore
    /// auto-commit are logged; the connection is released regardless.
    pub async fn close(&self, commit: bool) {
        let connection = {
            let mut slot = self.inner.connection.lock().await;
            if self.inner.closed.swap(true, Ordering::SeqCst) {
                None
            } else {
                Some(slot.take())
            }
        };

        if let Some(opened) = connection {
            match opened {
                Some(mut connection) => {
                    if !connection.is_auto_commit() {
                        let result = if commit {
                            connection.commit().await
                        } else {
                            connection.rollback().await
                        };
                        if let Err(e) = result {
                            error!(
                                transaction_id = %self.inner.id,
                                commit,
                                error = %e,
                                "Failed to finish transaction"
                            );
                        }
                        if let Err(e) = connection.set_auto_commit(true).await {
                            error!(
                                transaction_id = %self.inner.id,
                                error = %e,
                                "Failed to restore auto-commit"
                            );
                        }
                    }
                    drop(connection);
                    debug!(transaction_id = %self.inner.id, commit, "Transaction closed");
                }
                None => debug!(transaction_id = %self.inner.id, "Transaction closed unused"),
            }
        }

        self.detach();
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("dialect", &self.inner.provider.dialect())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Exclusive borrow of a transaction's connection.
pub struct TransactionConnection {
    transaction_id: Uuid,
    slot: OwnedMutexGuard<Slot>,
}

impl TransactionConnection {
    pub fn get(&mut self) -> DbResult<&mut (dyn Connection + 'static)> {
        match self.slot.as_deref_mut() {
            Some(connection) => Ok(connection),
            None => Err(DbError::transaction(
                "connection was released",
                self.transaction_id.to_string(),
            )),
        }
    }
}

impl fmt::Debug for TransactionConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionConnection")
            .field("transaction_id", &self.transaction_id)
            .finish_non_exhaustive()
    }
}
