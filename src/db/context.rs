//! Carrying the current transaction across await points.
//!
//! The transaction stack is per worker thread, while a tokio task may resume on any
//! worker. [`TransactionContext`] fixes this by attaching its transaction right before
//! polling the wrapped future and detaching it as soon as the poll returns, on whatever
//! worker that poll happens. A worker interleaving several tasks therefore sees exactly
//! the transaction of the task it is polling at that moment.

use super::transaction::Transaction;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::task::JoinHandle;

/// Future wrapper that makes a transaction current while the inner future is polled.
#[must_use = "futures do nothing unless polled"]
pub struct TransactionContext<F> {
    inner: Pin<Box<F>>,
    transaction: Option<Transaction>,
}

impl<F: Future> TransactionContext<F> {
    pub fn new(future: F, transaction: Option<Transaction>) -> Self {
        Self {
            inner: Box::pin(future),
            transaction,
        }
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }
}

impl<F: Future> Future for TransactionContext<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let _attached = this.transaction.as_ref().map(Attached::new);
        this.inner.as_mut().poll(cx)
    }
}

/// Detaches on drop, so a panicking poll does not leave the transaction behind.
struct Attached<'a>(&'a Transaction);

impl<'a> Attached<'a> {
    fn new(transaction: &'a Transaction) -> Self {
        transaction.attach();
        Self(transaction)
    }
}

impl Drop for Attached<'_> {
    fn drop(&mut self) {
        self.0.detach();
    }
}

/// Run futures inside a transaction context.
pub trait TransactionExt: Future + Sized {
    /// Make `transaction` current for every poll of this future.
    fn in_transaction(self, transaction: &Transaction) -> TransactionContext<Self> {
        TransactionContext::new(self, Some(transaction.clone()))
    }

    fn with_transaction(self, transaction: Option<Transaction>) -> TransactionContext<Self> {
        TransactionContext::new(self, transaction)
    }

    /// Capture the transaction current right now. Used for work handed to another task.
    fn in_current_transaction(self) -> TransactionContext<Self> {
        TransactionContext::new(self, Transaction::current())
    }
}

impl<F: Future> TransactionExt for F {}

/// Spawn a task that inherits the caller's current transaction.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(future.in_current_transaction())
}
