//! SQLite State Store
//!
//! Durable checkpoint persistence for the gyre runtime. Checkpoints are
//! stored as deterministic JSON alongside a version counter; writes are
//! conditional on the expected version inside a transaction, which is
//! what keeps two workers from running cycles of the same task
//! concurrently.

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::debug;

use gyre_core::{Checkpoint, StateStore, StateStoreError, VersionedCheckpoint};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS checkpoints (
    task_id TEXT PRIMARY KEY,
    version INTEGER NOT NULL,
    payload TEXT NOT NULL
)
";

/// Checkpoint store backed by a SQLite database file.
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Open (or create) the database at `path` and ensure the schema.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, StateStoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        Self::with_options(options).await
    }

    /// Private in-memory database, for tests and ephemeral runs.
    pub async fn in_memory() -> Result<Self, StateStoreError> {
        Self::with_options(SqliteConnectOptions::new().filename(":memory:")).await
    }

    async fn with_options(options: SqliteConnectOptions) -> Result<Self, StateStoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(backend_err)?;
        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(backend_err)?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn backend_err(err: sqlx::Error) -> StateStoreError {
    StateStoreError::Backend(err.to_string())
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn save(
        &self,
        checkpoint: &Checkpoint,
        expected_version: Option<u64>,
    ) -> Result<u64, StateStoreError> {
        let payload = checkpoint.to_json()?;
        let task_id = checkpoint.task_id().to_string();

        let mut tx = self.pool.begin().await.map_err(backend_err)?;
        let current: Option<i64> =
            sqlx::query("SELECT version FROM checkpoints WHERE task_id = ?1")
                .bind(&task_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(backend_err)?
                .map(|row| row.get::<i64, _>(0));
        let current = current.map(|v| v as u64);

        let next = match (expected_version, current) {
            (None, None) => 1,
            (Some(expected), Some(found)) if expected == found => found + 1,
            (expected, found) => {
                return Err(StateStoreError::VersionConflict {
                    task_id,
                    expected: expected.unwrap_or(0),
                    found: found.unwrap_or(0),
                })
            }
        };

        sqlx::query(
            "INSERT INTO checkpoints (task_id, version, payload) VALUES (?1, ?2, ?3)
             ON CONFLICT(task_id) DO UPDATE SET version = ?2, payload = ?3",
        )
        .bind(&task_id)
        .bind(next as i64)
        .bind(&payload)
        .execute(&mut *tx)
        .await
        .map_err(backend_err)?;
        tx.commit().await.map_err(backend_err)?;

        debug!(task_id = %task_id, version = next, "checkpoint saved");
        Ok(next)
    }

    async fn load(&self, task_id: &str) -> Result<Option<VersionedCheckpoint>, StateStoreError> {
        let row = sqlx::query("SELECT version, payload FROM checkpoints WHERE task_id = ?1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        match row {
            None => Ok(None),
            Some(row) => {
                let version: i64 = row.get(0);
                let payload: String = row.get(1);
                Ok(Some(VersionedCheckpoint {
                    checkpoint: Checkpoint::from_json(&payload)?,
                    version: version as u64,
                }))
            }
        }
    }

    async fn delete(&self, task_id: &str) -> Result<(), StateStoreError> {
        sqlx::query("DELETE FROM checkpoints WHERE task_id = ?1")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, StateStoreError> {
        let rows = sqlx::query("SELECT task_id FROM checkpoints ORDER BY task_id")
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(rows.iter().map(|row| row.get::<String, _>(0)).collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
