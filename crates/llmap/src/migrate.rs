use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the cache schema if it does not exist. Idempotent.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS responses (
            cache_key TEXT PRIMARY KEY,
            response TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the configured cache database and its schema (`llmap init`).
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(&config.cache.path).await?;
    create_schema(&pool).await?;
    pool.close().await;
    Ok(())
}
