//! SQLite implementation of [`TransactionBackend`].
//!
//! SQLite has no session-level autocommit switch; a transaction is either
//! open (`BEGIN` .. `COMMIT`) or every statement commits on its own. The
//! backend keeps an autocommit flag and, while it is off, begins a new
//! transaction lazily the next time the connection is handed out.

use super::transaction::{ManagedConnection, TransactionBackend, Vendor};
use async_trait::async_trait;
use sqlx::{
    SqliteConnection, SqlitePool,
    pool::PoolConnection,
    sqlite::Sqlite,
};
use tracing::{debug, warn};

pub struct SqliteBackend {
    conn: Option<PoolConnection<Sqlite>>,
    autocommit: bool,
    in_transaction: bool,
}

pub type SqliteManagedConnection = ManagedConnection<SqliteBackend>;

impl SqliteBackend {
    pub fn new(conn: PoolConnection<Sqlite>) -> Self {
        Self {
            conn: Some(conn),
            autocommit: true,
            in_transaction: false,
        }
    }

    /// Check a connection out of `pool` and wrap it for commit-on-success use.
    pub async fn acquire(pool: &SqlitePool) -> Result<SqliteManagedConnection, sqlx::Error> {
        let conn = pool.acquire().await?;
        Ok(ManagedConnection::new(Self::new(conn)))
    }

    pub fn is_autocommit(&self) -> bool {
        self.autocommit
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Raw connection for running queries.
    pub async fn connection(&mut self) -> Result<&mut SqliteConnection, sqlx::Error> {
        if !self.autocommit && !self.in_transaction {
            self.begin().await?;
        }
        let conn = self.conn.as_mut().ok_or(sqlx::Error::PoolClosed)?;
        Ok(&mut **conn)
    }

    /// Open a plain atomic block, outside of commit-on-success management.
    pub async fn begin_atomic(&mut self) -> Result<(), sqlx::Error> {
        self.begin().await
    }

    /// Takes the write lock up front so a read-then-write scope waits on the
    /// busy timeout instead of failing with SQLITE_BUSY on lock upgrade.
    async fn begin(&mut self) -> Result<(), sqlx::Error> {
        self.raw("BEGIN IMMEDIATE").await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn raw(&mut self, sql: &str) -> Result<(), sqlx::Error> {
        let conn = self.conn.as_mut().ok_or(sqlx::Error::PoolClosed)?;
        sqlx::query(sql).execute(&mut **conn).await?;
        Ok(())
    }
}

#[async_trait]
impl TransactionBackend for SqliteBackend {
    fn vendor(&self) -> Vendor {
        Vendor::Sqlite
    }

    fn in_atomic_block(&self) -> bool {
        self.in_transaction && self.autocommit
    }

    fn autocommits_when_autocommit_is_off(&self) -> bool {
        true
    }

    async fn execute(&mut self, sql: &str) -> Result<(), sqlx::Error> {
        if !self.autocommit && !self.in_transaction {
            self.begin().await?;
        }
        self.raw(sql).await
    }

    async fn start_transaction_under_autocommit(&mut self) -> Result<(), sqlx::Error> {
        self.begin().await
    }

    fn mark_autocommit(&mut self, autocommit: bool) {
        self.autocommit = autocommit;
    }

    async fn set_autocommit(&mut self, autocommit: bool) -> Result<(), sqlx::Error> {
        if autocommit && self.in_transaction {
            self.commit().await?;
        }
        self.autocommit = autocommit;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), sqlx::Error> {
        if !self.in_transaction {
            return Ok(());
        }
        self.raw("COMMIT").await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), sqlx::Error> {
        if !self.in_transaction {
            return Ok(());
        }
        self.raw("ROLLBACK").await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn close(&mut self) {
        self.in_transaction = false;
        if let Some(conn) = self.conn.take() {
            match conn.close().await {
                Ok(()) => debug!("closed sqlite connection"),
                Err(err) => warn!(error = %err, "failed to close sqlite connection"),
            }
        }
    }
}

/// A backend dropped with a transaction still open (a cancelled request,
/// say) must not hand that transaction back to the pool. The connection is
/// detached instead and closes, rolling the transaction back.
impl Drop for SqliteBackend {
    fn drop(&mut self) {
        if !self.in_transaction {
            return;
        }
        if let Some(conn) = self.conn.take() {
            warn!("sqlite connection dropped inside a transaction, discarding it");
            drop(conn.detach());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::transaction::{CommitOnSuccess, TransactionError};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("CREATE TABLE counters (name TEXT PRIMARY KEY, value INTEGER NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();
        pool
    }

    async fn insert(conn: &mut SqliteManagedConnection, name: &str) -> Result<(), sqlx::Error> {
        let c = conn.backend_mut().connection().await?;
        sqlx::query("INSERT INTO counters (name, value) VALUES (?, 1)")
            .bind(name)
            .execute(&mut *c)
            .await?;
        Ok(())
    }

    async fn count(conn: &mut SqliteManagedConnection) -> i64 {
        let c = conn.backend_mut().connection().await.unwrap();
        sqlx::query_scalar("SELECT COUNT(*) FROM counters")
            .fetch_one(&mut *c)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn committed_work_is_kept() {
        let pool = pool().await;
        let mut conn = SqliteBackend::acquire(&pool).await.unwrap();

        let result: Result<(), TransactionError> = CommitOnSuccess::new()
            .run(&mut conn, |conn| {
                Box::pin(async move { insert(conn, "a").await.map_err(TransactionError::from) })
            })
            .await;

        result.unwrap();
        assert!(conn.backend().is_autocommit());
        assert!(!conn.backend().in_transaction());
        assert_eq!(count(&mut conn).await, 1);
    }

    #[tokio::test]
    async fn failed_work_is_rolled_back() {
        let pool = pool().await;
        let mut conn = SqliteBackend::acquire(&pool).await.unwrap();
        let tx = CommitOnSuccess::new();

        tx.enter(&mut conn).await.unwrap();
        insert(&mut conn, "a").await.unwrap();
        // duplicate key
        assert!(insert(&mut conn, "a").await.is_err());
        tx.exit(&mut conn, false).await.unwrap();

        assert_eq!(count(&mut conn).await, 0);
    }

    #[tokio::test]
    async fn atomic_block_blocks_commit_on_success() {
        let pool = pool().await;
        let mut conn = SqliteBackend::acquire(&pool).await.unwrap();
        conn.backend_mut().begin_atomic().await.unwrap();

        let err = CommitOnSuccess::new().enter(&mut conn).await.unwrap_err();
        assert!(matches!(err, TransactionError::InsideAtomicBlock));

        conn.backend_mut().rollback().await.unwrap();
        assert!(!conn.backend().in_atomic_block());
    }

    #[tokio::test]
    async fn closed_connection_is_reported() {
        let pool = pool().await;
        let mut conn = SqliteBackend::acquire(&pool).await.unwrap();
        conn.backend_mut().close().await;

        assert!(matches!(
            conn.backend_mut().connection().await,
            Err(sqlx::Error::PoolClosed)
        ));
    }

    #[tokio::test]
    async fn dropped_scope_does_not_leak_its_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("tx.db").display());
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await
            .unwrap();
        sqlx::query("CREATE TABLE counters (name TEXT PRIMARY KEY, value INTEGER NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();

        {
            let mut conn = SqliteBackend::acquire(&pool).await.unwrap();
            CommitOnSuccess::new().enter(&mut conn).await.unwrap();
            insert(&mut conn, "lost").await.unwrap();
        }

        let mut conn = SqliteBackend::acquire(&pool).await.unwrap();
        let result: Result<(), TransactionError> = CommitOnSuccess::new()
            .run(&mut conn, |conn| {
                Box::pin(async move { insert(conn, "kept").await.map_err(TransactionError::from) })
            })
            .await;
        result.unwrap();
        drop(conn);

        let names: Vec<String> = sqlx::query_scalar("SELECT name FROM counters")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(names, vec!["kept".to_string()]);
    }

    #[tokio::test]
    async fn idle_backend_returns_connection_to_pool() {
        let pool = pool().await;
        {
            let mut conn = SqliteBackend::acquire(&pool).await.unwrap();
            assert_eq!(count(&mut conn).await, 0);
        }
        // Same in-memory database, so the connection went back to the pool.
        let mut conn = SqliteBackend::acquire(&pool).await.unwrap();
        assert_eq!(count(&mut conn).await, 0);
    }
}
