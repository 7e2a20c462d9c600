//! Commit-on-success transaction scopes.
//!
//! A [`CommitOnSuccess`] scope opens a transaction on entry (unless an outer
//! scope already did), commits when the wrapped work succeeds and rolls back
//! when it fails. Nesting is tracked on the [`ManagedConnection`]; only the
//! outermost scope starts the transaction and restores autocommit.
//!
//! Two forms are offered:
//! - [`CommitOnSuccess::run`] wraps a closure (decorator form).
//! - [`CommitOnSuccess::enter`] / [`CommitOnSuccess::exit`] for callers that
//!   need to manage the scope boundaries themselves.

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;
use tracing::{debug, warn};

const READ_COMMITTED_SQL: &str = "SET TRANSACTION ISOLATION LEVEL READ COMMITTED";

/// Database engine behind a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Vendor {
    Sqlite,
    MySql,
    PostgreSql,
}

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Cannot be inside an atomic block.")]
    InsideAtomicBlock,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type TransactionResult<T> = Result<T, TransactionError>;

/// Low-level transaction controls a connection has to provide.
#[async_trait]
pub trait TransactionBackend: Send {
    fn vendor(&self) -> Vendor;

    /// True when a transaction was opened outside of commit-on-success
    /// management and is still active.
    fn in_atomic_block(&self) -> bool;

    /// Some drivers (SQLite) do not open transactions by themselves once
    /// autocommit is off. Those need an explicit `BEGIN` instead.
    fn autocommits_when_autocommit_is_off(&self) -> bool;

    async fn execute(&mut self, sql: &str) -> Result<(), sqlx::Error>;

    async fn start_transaction_under_autocommit(&mut self) -> Result<(), sqlx::Error>;

    /// Update the autocommit flag without talking to the driver.
    fn mark_autocommit(&mut self, autocommit: bool);

    async fn set_autocommit(&mut self, autocommit: bool) -> Result<(), sqlx::Error>;

    async fn commit(&mut self) -> Result<(), sqlx::Error>;

    async fn rollback(&mut self) -> Result<(), sqlx::Error>;

    /// Drop the underlying connection. Used when a rollback failed and the
    /// connection state can no longer be trusted.
    async fn close(&mut self);
}

/// A backend plus the commit-on-success nesting depth.
pub struct ManagedConnection<B> {
    backend: B,
    depth: u32,
}

impl<B: TransactionBackend> ManagedConnection<B> {
    pub fn new(backend: B) -> Self {
        Self { backend, depth: 0 }
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}

/// Transaction scope that commits on success and rolls back on failure.
#[derive(Clone, Copy, Debug)]
pub struct CommitOnSuccess {
    read_committed: bool,
    enabled: bool,
}

impl Default for CommitOnSuccess {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitOnSuccess {
    pub fn new() -> Self {
        Self {
            read_committed: false,
            enabled: true,
        }
    }

    /// Same as [`CommitOnSuccess::new`] but asks for READ COMMITTED isolation
    /// on the transaction. Only MySQL honours the request.
    pub fn read_committed() -> Self {
        Self {
            read_committed: true,
            enabled: true,
        }
    }

    /// A disabled scope does nothing on enter and exit.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Open the scope.
    ///
    /// Fails with [`TransactionError::InsideAtomicBlock`] when a transaction
    /// not managed by commit-on-success is already open.
    pub async fn enter<B: TransactionBackend>(
        &self,
        conn: &mut ManagedConnection<B>,
    ) -> TransactionResult<()> {
        if !self.enabled {
            return Ok(());
        }

        if conn.backend.in_atomic_block() {
            return Err(TransactionError::InsideAtomicBlock);
        }

        if conn.depth > 0 {
            conn.depth += 1;
            debug!(depth = conn.depth, "joined outer commit-on-success scope");
            return Ok(());
        }

        conn.depth = 1;
        if let Err(err) = self.begin(&mut conn.backend).await {
            conn.depth = 0;
            return Err(err.into());
        }
        debug!(read_committed = self.read_committed, "opened commit-on-success scope");
        Ok(())
    }

    async fn begin<B: TransactionBackend>(&self, backend: &mut B) -> Result<(), sqlx::Error> {
        // Applies to the next transaction, so it has to run before it starts.
        if self.read_committed {
            match backend.vendor() {
                Vendor::MySql => backend.execute(READ_COMMITTED_SQL).await?,
                vendor => debug!(?vendor, "isolation level request ignored for vendor"),
            }
        }

        if backend.autocommits_when_autocommit_is_off() {
            backend.start_transaction_under_autocommit().await?;
            backend.mark_autocommit(false);
        } else {
            backend.set_autocommit(false).await?;
        }
        Ok(())
    }

    /// Close the scope, committing when `succeeded` is true and rolling back
    /// otherwise.
    ///
    /// A failed commit is followed by a rollback and reported. A failed
    /// rollback closes the connection; on the failure path that error is not
    /// reported, the caller already has one.
    pub async fn exit<B: TransactionBackend>(
        &self,
        conn: &mut ManagedConnection<B>,
        succeeded: bool,
    ) -> TransactionResult<()> {
        if !self.enabled {
            return Ok(());
        }

        let outcome = if succeeded {
            match conn.backend.commit().await {
                Ok(()) => Ok(()),
                Err(commit_err) => {
                    warn!(error = %commit_err, "commit failed, rolling back");
                    rollback_or_close(&mut conn.backend).await;
                    Err(TransactionError::Database(commit_err))
                }
            }
        } else {
            rollback_or_close(&mut conn.backend).await;
            Ok(())
        };

        conn.depth = conn.depth.saturating_sub(1);
        if conn.depth == 0 {
            if conn.backend.autocommits_when_autocommit_is_off() {
                conn.backend.mark_autocommit(true);
            } else {
                conn.backend.set_autocommit(true).await?;
            }
            debug!(committed = succeeded && outcome.is_ok(), "closed commit-on-success scope");
        }

        outcome
    }

    /// Run `work` inside the scope.
    ///
    /// Returns the result of `work`, unless opening or closing the scope
    /// fails, in which case that error wins.
    pub async fn run<B, T, E, F>(&self, conn: &mut ManagedConnection<B>, work: F) -> Result<T, E>
    where
        B: TransactionBackend,
        E: From<TransactionError>,
        F: for<'c> FnOnce(&'c mut ManagedConnection<B>) -> BoxFuture<'c, Result<T, E>>,
    {
        self.enter(conn).await?;
        let result = work(conn).await;
        self.exit(conn, result.is_ok()).await?;
        result
    }
}

async fn rollback_or_close<B: TransactionBackend>(backend: &mut B) {
    if let Err(err) = backend.rollback().await {
        warn!(error = %err, "rollback failed, closing connection");
        backend.close().await;
    }
}
