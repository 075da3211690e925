//! Cache database migrations.

use crate::error::{KilnError, Result};
use sqlx::SqlitePool;
use tracing::{info, instrument};

const SCHEMA_VERSION: i64 = 2;

#[instrument(skip(pool))]
pub async fn run(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| KilnError::MigrationFailed { reason: e.to_string() })?;

    let current_version: Option<i64> =
        sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
            .fetch_optional(pool)
            .await
            .map_err(|e| KilnError::MigrationFailed { reason: e.to_string() })?;

    let current_version = current_version.unwrap_or(0);

    if current_version >= SCHEMA_VERSION {
        info!("Cache schema is up to date (version {})", current_version);
        return Ok(());
    }

    info!("Migrating cache database from version {} to {}", current_version, SCHEMA_VERSION);

    if current_version < 1 {
        migrate_to_v1(pool).await?;
    }

    if current_version < 2 {
        migrate_to_v2(pool).await?;
    }

    sqlx::query("DELETE FROM schema_version")
        .execute(pool)
        .await
        .map_err(|e| KilnError::MigrationFailed { reason: e.to_string() })?;
    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(pool)
        .await
        .map_err(|e| KilnError::MigrationFailed { reason: e.to_string() })?;

    Ok(())
}

/// v1: the three append-only tables.
async fn migrate_to_v1(pool: &SqlitePool) -> Result<()> {
    info!("Running migration v1: records, results, links");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            key TEXT NOT NULL,
            vertex TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (key, vertex)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| KilnError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS results (
            key TEXT NOT NULL,
            vertex TEXT NOT NULL,
            result_id TEXT NOT NULL,
            chain TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (key, vertex, result_id)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| KilnError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS links (
            parent_key TEXT NOT NULL,
            vertex TEXT NOT NULL,
            input INTEGER NOT NULL,
            selector TEXT NOT NULL,
            child_key TEXT NOT NULL,
            PRIMARY KEY (parent_key, vertex, input, selector, child_key)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| KilnError::MigrationFailed { reason: e.to_string() })?;

    Ok(())
}

/// v2: indexes for TTL pruning and backlink walks.
async fn migrate_to_v2(pool: &SqlitePool) -> Result<()> {
    info!("Running migration v2: prune and backlink indexes");

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_created_at ON records (created_at)")
        .execute(pool)
        .await
        .map_err(|e| KilnError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_links_child_key ON links (child_key)")
        .execute(pool)
        .await
        .map_err(|e| KilnError::MigrationFailed { reason: e.to_string() })?;

    Ok(())
}
