//! Persistence backends
//!
//! Durable storage for cell values, keyed by cell key with the value stored as JSON.

use crate::error::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Durable key/value storage for persistent cells
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Previously stored value, if any
    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>>;

    /// Store (insert or replace) a value
    async fn store(&self, key: &str, value: &serde_json::Value) -> Result<()>;
}

/// SQLite-backed repository
#[derive(Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    /// Create repository over an existing pool (schema must exist)
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database and ensure the schema
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // A single connection keeps `sqlite::memory:` databases coherent
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        let repo = Self::new(pool);
        repo.migrate().await?;

        tracing::info!(database_url = %database_url, "SQLite persistence opened");
        Ok(repo)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cell_values (
                cell_key TEXT PRIMARY KEY NOT NULL,
                value_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl PersistenceBackend for SqliteRepository {
    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value_json FROM cell_values WHERE cell_key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((json,)) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn store(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let json = serde_json::to_string(value)?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO cell_values (cell_key, value_json, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(cell_key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(&json)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Volatile in-memory backend (no DATABASE_URL configured)
#[derive(Default)]
pub struct MemoryRepository {
    values: Mutex<HashMap<String, serde_json::Value>>,
    writes: AtomicU64,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.values.lock().get(key).cloned()
    }

    /// Number of store calls served
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PersistenceBackend for MemoryRepository {
    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.get(key))
    }

    async fn store(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        self.values.lock().insert(key.to_string(), value.clone());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
