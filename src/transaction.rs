//! Transactions serialized per backend session.
//!
//! Every transaction is keyed by the `pg_backend_pid()` of the connection it
//! runs on. Attempts that end up on the same backend wait in a FIFO queue,
//! so at most one transaction body runs per backend at a time; attempts on
//! different backends run fully concurrently.
//!
//! # Guarantees
//!
//! - Success issues `COMMIT`; a failure of `BEGIN`, the work, or `COMMIT`
//!   issues `ROLLBACK` and returns a [`TransactionError`].
//! - If the `transaction` future is dropped while a transaction is open,
//!   a rollback is queued on the connection before it goes back to the
//!   pool, so abandoned work is never committed by a later user.
//! - The connection is released exactly once, after the terminal statement,
//!   on every path including cancellation.
//! - A failed backend id lookup releases the connection immediately and is
//!   not retried.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use sqlx::TransactionManager;
use sqlx::postgres::PgTransactionManager;
use tokio::sync::OwnedMutexGuard;

use crate::error::TransactionError;
use crate::gate::{ConnectionGate, HeldConnection};

/// Server process id identifying a backend session.
pub type BackendId = i32;

/// A physical connection that can host a transaction.
///
/// Dropping the connection releases it.
#[async_trait]
pub trait TransactionalConnection: Send {
    /// Queries the backend id of this session.
    async fn backend_id(&mut self) -> Result<BackendId, sqlx::Error>;

    /// Opens a transaction.
    async fn begin(&mut self) -> Result<(), sqlx::Error>;

    /// Commits the open transaction.
    async fn commit(&mut self) -> Result<(), sqlx::Error>;

    /// Rolls back the open transaction.
    async fn rollback(&mut self) -> Result<(), sqlx::Error>;

    /// Schedules a rollback without waiting for it. Called when the
    /// transaction is abandoned before a terminal statement completed; the
    /// rollback must run before the session is handed to anyone else.
    fn abandon(&mut self);
}

/// Hands out connections for transactions.
#[async_trait]
pub trait ConnectionSource: Send + Sync {
    /// Connection type handed to transaction work.
    type Connection: TransactionalConnection;

    /// Checks out a connection.
    async fn acquire(&self) -> Result<Self::Connection, sqlx::Error>;
}

#[async_trait]
impl TransactionalConnection for HeldConnection {
    async fn backend_id(&mut self) -> Result<BackendId, sqlx::Error> {
        self.backend_pid().await
    }

    async fn begin(&mut self) -> Result<(), sqlx::Error> {
        PgTransactionManager::begin(self.as_connection(), None).await
    }

    async fn commit(&mut self) -> Result<(), sqlx::Error> {
        PgTransactionManager::commit(self.as_connection()).await
    }

    async fn rollback(&mut self) -> Result<(), sqlx::Error> {
        PgTransactionManager::rollback(self.as_connection()).await
    }

    // The queued ROLLBACK is flushed by the pool's liveness check when the
    // connection is returned.
    fn abandon(&mut self) {
        PgTransactionManager::start_rollback(self.as_connection());
    }
}

#[async_trait]
impl ConnectionSource for ConnectionGate {
    type Connection = HeldConnection;

    async fn acquire(&self) -> Result<HeldConnection, sqlx::Error> {
        ConnectionGate::acquire(self).await
    }
}

/// Runs caller work inside `BEGIN`/`COMMIT` with per-backend ordering.
#[derive(Debug)]
pub struct TransactionCoordinator<S> {
    source: S,
    queues: TransactionQueues,
}

impl<S: ConnectionSource> TransactionCoordinator<S> {
    /// Creates a coordinator drawing connections from `source`.
    #[must_use]
    pub fn new(source: S) -> Self {
        Self {
            source,
            queues: TransactionQueues::default(),
        }
    }

    /// Connection source.
    #[must_use]
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Runs `work` in a transaction and returns its value after `COMMIT`.
    ///
    /// `work` receives the held connection; build it as
    /// `|conn| Box::pin(async move { ... })`.
    ///
    /// Dropping the returned future rolls back an open transaction.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::Acquire`] or
    /// [`TransactionError::BackendId`] before any transaction is opened, and
    /// [`TransactionError::Begin`], [`TransactionError::Work`] or
    /// [`TransactionError::Commit`] after the transaction was rolled back.
    pub async fn transaction<T, F>(&self, work: F) -> Result<T, TransactionError>
    where
        F: for<'c> FnOnce(&'c mut S::Connection) -> BoxFuture<'c, anyhow::Result<T>>,
    {
        let mut conn = self
            .source
            .acquire()
            .await
            .map_err(TransactionError::Acquire)?;

        let backend = match conn.backend_id().await {
            Ok(backend) => backend,
            Err(e) => {
                drop(conn);
                tracing::error!(error = %e, "failed to query backend id, transaction not attempted");
                return Err(TransactionError::BackendId(e));
            }
        };

        let slot = self.queues.enter(backend).await;
        let outcome = run_transaction(&mut conn, backend, work).await;
        drop(conn);
        drop(slot);

        if let Err(e) = &outcome {
            tracing::error!(backend, error = %e, "transaction failed");
        }
        outcome
    }
}

/// Abandons the open transaction on drop unless disarmed.
struct RollbackOnDrop<'a, C: TransactionalConnection> {
    conn: &'a mut C,
    backend: BackendId,
    armed: bool,
}

impl<C: TransactionalConnection> Drop for RollbackOnDrop<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!(backend = self.backend, "transaction abandoned, rolling back");
            self.conn.abandon();
        }
    }
}

async fn run_transaction<C, T, F>(conn: &mut C, backend: BackendId, work: F) -> Result<T, TransactionError>
where
    C: TransactionalConnection,
    F: for<'c> FnOnce(&'c mut C) -> BoxFuture<'c, anyhow::Result<T>>,
{
    if let Err(source) = conn.begin().await {
        rollback(conn, backend).await;
        return Err(TransactionError::Begin { backend, source });
    }

    let mut guard = RollbackOnDrop {
        conn,
        backend,
        armed: true,
    };

    let value = match work(&mut *guard.conn).await {
        Ok(value) => value,
        Err(source) => {
            if rollback(&mut *guard.conn, backend).await {
                guard.armed = false;
            }
            return Err(TransactionError::Work { backend, source });
        }
    };

    if let Err(source) = guard.conn.commit().await {
        if rollback(&mut *guard.conn, backend).await {
            guard.armed = false;
        }
        return Err(TransactionError::Commit { backend, source });
    }
    guard.armed = false;
    Ok(value)
}

/// Returns whether the rollback went through. A failure is logged; the
/// caller reports the original error.
async fn rollback<C: TransactionalConnection>(conn: &mut C, backend: BackendId) -> bool {
    match conn.rollback().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(backend, error = %e, "rollback failed");
            false
        }
    }
}

/// FIFO queues keyed by backend id.
///
/// The map lock is held only to look up or prune a queue; waiting happens
/// on the per-backend mutex, which tokio hands out in request order.
#[derive(Debug, Default)]
struct TransactionQueues {
    queues: Mutex<HashMap<BackendId, Arc<tokio::sync::Mutex<()>>>>,
}

/// A turn in a backend's queue. Dropping it lets the next waiter in and
/// prunes the queue once nobody is waiting.
struct QueueSlot<'a> {
    queues: &'a TransactionQueues,
    backend: BackendId,
    turn: Option<OwnedMutexGuard<()>>,
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        let mut map = self.queues.queues.lock();
        drop(self.turn.take());
        if map
            .get(&self.backend)
            .is_some_and(|queue| Arc::strong_count(queue) == 1)
        {
            map.remove(&self.backend);
        }
    }
}

impl TransactionQueues {
    async fn enter(&self, backend: BackendId) -> QueueSlot<'_> {
        let queue = Arc::clone(self.queues.lock().entry(backend).or_default());
        let mut slot = QueueSlot {
            queues: self,
            backend,
            turn: None,
        };
        slot.turn = Some(queue.lock_owned().await);
        slot
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.queues.lock().len()
    }
}
