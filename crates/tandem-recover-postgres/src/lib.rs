//! PostgreSQL implementation of the Tandem recovery store.
//!
//! This crate provides a production implementation of the `RecoveryStore`
//! trait: durable `head`/`tail` counters and persistent-subset Context
//! snapshots keyed by transaction id.
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE tandem_counters (
//!     name TEXT PRIMARY KEY,
//!     value BIGINT NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//!
//! CREATE TABLE tandem_snapshots (
//!     id BIGINT PRIMARY KEY,
//!     context JSONB NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use tandem_recover_postgres::PgRecoveryStore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/mydb").await?;
//! let store = PgRecoveryStore::new(pool);
//!
//! let tm = TransactionManager::builder(space, "txn")
//!     .with_store(Arc::new(store))
//!     .build()?;
//! ```
//!
//! Counter and snapshot writes are single upserts; a transaction id is only
//! ever touched by the one worker session driving it, so no row locking is
//! needed. Store failures surface to the manager operation in progress and
//! are never retried here.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Row};
use tandem_core::RecoveryStore;

/// PostgreSQL recovery store implementation.
#[derive(Clone)]
pub struct PgRecoveryStore {
    pool: PgPool,
}

impl PgRecoveryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RecoveryStore for PgRecoveryStore {
    async fn put_counter(&self, name: &str, value: u64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tandem_counters (name, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (name) DO UPDATE
            SET value = EXCLUDED.value,
                updated_at = NOW()
            "#,
        )
        .bind(name)
        .bind(value as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_counter(&self, name: &str) -> Result<Option<u64>> {
        let row = sqlx::query("SELECT value FROM tandem_counters WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<i64, _>("value") as u64))
    }

    async fn put_snapshot(&self, id: u64, snapshot: Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tandem_snapshots (id, context, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (id) DO UPDATE
            SET context = EXCLUDED.context,
                updated_at = NOW()
            "#,
        )
        .bind(id as i64)
        .bind(snapshot)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_snapshot(&self, id: u64) -> Result<Option<Value>> {
        let row = sqlx::query("SELECT context FROM tandem_snapshots WHERE id = $1")
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<Value, _>("context")))
    }

    async fn delete_snapshot(&self, id: u64) -> Result<()> {
        sqlx::query("DELETE FROM tandem_snapshots WHERE id = $1")
            .bind(id as i64)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn snapshot_ids(&self) -> Result<Vec<u64>> {
        let rows = sqlx::query("SELECT id FROM tandem_snapshots ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|r| r.get::<i64, _>("id") as u64)
            .collect())
    }
}

/// Maintenance helpers.
impl PgRecoveryStore {
    /// Delete snapshots older than `older_than`. Resolved transactions
    /// delete their snapshot inline; this catches rows orphaned by managers
    /// that never came back.
    pub async fn cleanup_stale(&self, older_than: chrono::DateTime<chrono::Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM tandem_snapshots WHERE updated_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Number of unresolved snapshots currently stored.
    pub async fn backlog(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM tandem_snapshots")
            .fetch_one(&self.pool)
            .await?;

        Ok(row.get("n"))
    }
}
