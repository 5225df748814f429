//! Pool construction and migration running.

use std::path::Path;
use std::time::Duration;

use ledgerflow_core::CoreError;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::info;

use crate::migrations::migrations;

/// Connection pool for one sqlite database file.
#[derive(Clone)]
pub struct SqliteConnection {
    pool: SqlitePool,
}

impl SqliteConnection {
    /// Opens (creating if missing) the database at `path` and brings its
    /// schema up to date.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|err| {
                CoreError::StoreError(format!("open {}: {err}", path.display()))
            })?;

        let conn = SqliteConnection { pool };
        conn.run_migrations().await?;
        info!(path = %path.display(), "checkpoint database ready");
        Ok(conn)
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes the pool, flushing WAL content.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn run_migrations(&self) -> Result<(), CoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS _migrations (name TEXT PRIMARY KEY, applied_at TEXT NOT NULL)",
        )
        .execute(&self.pool)
        .await
        .map_err(|err| CoreError::StoreError(format!("migration table: {err}")))?;

        for (name, sql) in migrations() {
            let applied: Option<String> =
                sqlx::query_scalar("SELECT name FROM _migrations WHERE name = ?")
                    .bind(name)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|err| CoreError::StoreError(format!("migration check: {err}")))?;
            if applied.is_some() {
                continue;
            }

            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|err| CoreError::StoreError(format!("migration begin: {err}")))?;
            sqlx::raw_sql(sql)
                .execute(&mut *tx)
                .await
                .map_err(|err| CoreError::StoreError(format!("migration {name}: {err}")))?;
            sqlx::query("INSERT INTO _migrations (name, applied_at) VALUES (?, ?)")
                .bind(name)
                .bind(chrono::Utc::now().to_rfc3339())
                .execute(&mut *tx)
                .await
                .map_err(|err| CoreError::StoreError(format!("migration record: {err}")))?;
            tx.commit()
                .await
                .map_err(|err| CoreError::StoreError(format!("migration commit: {err}")))?;
            info!(migration = name, "applied");
        }
        Ok(())
    }
}
