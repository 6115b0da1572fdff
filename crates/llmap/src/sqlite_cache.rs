//! SQLite-backed [`CacheStore`].
//!
//! One row per cache key in the `responses` table. Each write is a single
//! `INSERT … ON CONFLICT DO NOTHING`, so a reader sees either the complete
//! response or nothing, and the first answer stored for a key is kept.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::path::Path;

use llmap_core::cache::{CacheEntry, CacheError, CacheStore};
use llmap_core::fingerprint::CacheKey;

use crate::{db, migrate};

/// SQLite implementation of the [`CacheStore`] trait.
pub struct SqliteCacheStore {
    pool: SqlitePool,
}

fn unavailable(e: impl std::fmt::Display) -> CacheError {
    CacheError::Unavailable(e.to_string())
}

impl SqliteCacheStore {
    /// Open (creating if needed) the store at `path` and verify its
    /// integrity.
    ///
    /// Returns [`CacheError::Corrupt`] when the file is not a database or
    /// fails `PRAGMA quick_check`, and [`CacheError::Unavailable`] when it
    /// cannot be opened at all.
    pub async fn open(path: &Path) -> Result<Self, CacheError> {
        let pool = db::connect(path).await.map_err(|e| {
            let message = format!("{:#}", e);
            if message.contains("not a database") {
                CacheError::Corrupt(message)
            } else {
                CacheError::Unavailable(message)
            }
        })?;
        quick_check(&pool).await?;
        migrate::create_schema(&pool)
            .await
            .map_err(|e| unavailable(format!("{:#}", e)))?;
        Ok(Self { pool })
    }

    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Number of stored responses.
    pub async fn len(&self) -> Result<i64, CacheError> {
        sqlx::query_scalar("SELECT COUNT(*) FROM responses")
            .fetch_one(&self.pool)
            .await
            .map_err(unavailable)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn quick_check(pool: &SqlitePool) -> Result<(), CacheError> {
    let rows: Vec<String> = sqlx::query_scalar("PRAGMA quick_check")
        .fetch_all(pool)
        .await
        .map_err(|e| {
            let message = e.to_string();
            if message.contains("not a database") || message.contains("malformed") {
                CacheError::Corrupt(message)
            } else {
                CacheError::Unavailable(message)
            }
        })?;
    match rows.as_slice() {
        [only] if only == "ok" => Ok(()),
        _ => Err(CacheError::Corrupt(rows.join("; "))),
    }
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let row = sqlx::query("SELECT response, created_at FROM responses WHERE cache_key = ?")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;

        Ok(row.map(|r| CacheEntry {
            response: r.get("response"),
            created_at: r.get("created_at"),
        }))
    }

    async fn put(&self, key: &CacheKey, response: &str) -> Result<(), CacheError> {
        sqlx::query(
            r#"
            INSERT INTO responses (cache_key, response, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(cache_key) DO NOTHING
            "#,
        )
        .bind(key.as_str())
        .bind(response)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn discard(&self, key: &CacheKey) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM responses WHERE cache_key = ?")
            .bind(key.as_str())
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}
