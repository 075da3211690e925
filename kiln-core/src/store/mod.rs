//! Durable cache storage over SQLite.
//!
//! The store is a map from cache keys to records, plus a link table
//! recording which child keys depend on which parent keys through which
//! normalized link. Writes are transactional, so a crash leaves every save
//! wholly visible or wholly absent; a link written without both endpoint
//! records is a tolerable partial state and is pruned on the next open.

use crate::digest::Digest;
use crate::error::{KilnError, Result};
use crate::types::LayerChain;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{ConnectOptions, Row};
use std::path::Path;
use std::str::FromStr;
use tracing::{info, instrument, warn};

pub mod migrations;

/// A persisted cache record: the vertex digest it proves work for and the
/// results observed for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
    pub vertex: Digest,
    pub results: Vec<StoredResult>,
    pub created_at: DateTime<Utc>,
}

/// One result attached to a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResult {
    /// Worker handle identity; opaque to the store.
    pub result_id: String,
    pub chain: LayerChain,
    pub created_at: DateTime<Utc>,
}

/// The normalized form of a dependency edge: `childKey` depends on
/// `parentKey` through input slot `input` of the op `vertex`, restricted by
/// `selector`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NormalizedLink {
    pub vertex: Digest,
    pub input: usize,
    pub selector: String,
}

/// Durable cache-key storage.
#[derive(Clone)]
pub struct CacheStore {
    pool: SqlitePool,
}

impl CacheStore {
    /// Open an in-memory store (for tests).
    pub async fn new_in_memory() -> Result<Self> {
        Self::new(":memory:").await
    }

    /// Open (or create) the store at `db_path`, run migrations, and prune
    /// links left dangling by an earlier crash.
    #[instrument(skip(db_path))]
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        info!("Opening cache store at {:?}", db_path);

        if db_path != Path::new(":memory:") {
            if let Some(parent) = db_path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| KilnError::InvalidConfig {
                    reason: format!("failed to create {}: {}", parent.display(), e),
                })?;
            }
        }

        let mut options = SqliteConnectOptions::from_str(db_path.to_str().ok_or_else(|| {
            KilnError::InvalidConfig { reason: "invalid cache database path".to_string() }
        })?)
        .map_err(|e| KilnError::Store(e.to_string()))?;

        options = options.create_if_missing(true).log_statements(tracing::log::LevelFilter::Debug);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| KilnError::Store(e.to_string()))?;

        let store = Self { pool };
        migrations::run(&store.pool).await?;

        let dangling = store.prune_orphan_links().await?;
        if dangling > 0 {
            warn!(dangling, "Pruned links without endpoint records");
        }

        Ok(store)
    }

    /// All records stored under `key`, newest result first.
    #[instrument(skip(self), fields(key = %key.short()))]
    pub async fn load(&self, key: &Digest) -> Result<Vec<CacheRecord>> {
        let record_rows = sqlx::query(
            "SELECT vertex, created_at FROM records WHERE key = ? ORDER BY vertex",
        )
        .bind(key.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| self.store_err("load", e))?;

        let mut records = Vec::with_capacity(record_rows.len());
        for row in record_rows {
            let vertex: String = row.get("vertex");
            let created_at: i64 = row.get("created_at");

            let result_rows = sqlx::query(
                r#"
                SELECT result_id, chain, created_at FROM results
                WHERE key = ? AND vertex = ?
                ORDER BY created_at DESC, result_id
                "#,
            )
            .bind(key.as_str())
            .bind(&vertex)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.store_err("load", e))?;

            let mut results = Vec::with_capacity(result_rows.len());
            for row in result_rows {
                let chain_json: String = row.get("chain");
                let chain: LayerChain = serde_json::from_str(&chain_json)
                    .map_err(|e| KilnError::Store(format!("corrupt chain column: {}", e)))?;
                results.push(StoredResult {
                    result_id: row.get("result_id"),
                    chain,
                    created_at: timestamp(row.get("created_at")),
                });
            }

            records.push(CacheRecord {
                vertex: Digest::parse(&vertex)?,
                results,
                created_at: timestamp(created_at),
            });
        }

        // Newest result first; records without results sort last.
        records.sort_by_key(|r| {
            std::cmp::Reverse(r.results.first().map(|res| res.created_at.timestamp()))
        });
        Ok(records)
    }

    /// Idempotent upsert: saving equal content twice collapses to one entry.
    #[instrument(skip(self, record), fields(key = %key.short(), vertex = %record.vertex.short()))]
    pub async fn save(&self, key: &Digest, record: &CacheRecord) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| self.store_err("save", e))?;

        sqlx::query(
            r#"
            INSERT INTO records (key, vertex, created_at) VALUES (?, ?, ?)
            ON CONFLICT (key, vertex) DO NOTHING
            "#,
        )
        .bind(key.as_str())
        .bind(record.vertex.as_str())
        .bind(record.created_at.timestamp())
        .execute(&mut *tx)
        .await
        .map_err(|e| self.store_err("save", e))?;

        for result in &record.results {
            let chain_json = serde_json::to_string(&result.chain)
                .map_err(|e| KilnError::Store(format!("failed to serialize chain: {}", e)))?;
            sqlx::query(
                r#"
                INSERT INTO results (key, vertex, result_id, chain, created_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT (key, vertex, result_id) DO NOTHING
                "#,
            )
            .bind(key.as_str())
            .bind(record.vertex.as_str())
            .bind(&result.result_id)
            .bind(chain_json)
            .bind(result.created_at.timestamp())
            .execute(&mut *tx)
            .await
            .map_err(|e| self.store_err("save", e))?;
        }

        tx.commit().await.map_err(|e| self.store_err("save", e))
    }

    /// Record that `child` depends on `parent` through `link`.
    #[instrument(skip(self, link), fields(parent = %parent.short(), child = %child.short()))]
    pub async fn add_link(
        &self,
        parent: &Digest,
        link: &NormalizedLink,
        child: &Digest,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO links (parent_key, vertex, input, selector, child_key)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (parent_key, vertex, input, selector, child_key) DO NOTHING
            "#,
        )
        .bind(parent.as_str())
        .bind(link.vertex.as_str())
        .bind(link.input as i64)
        .bind(&link.selector)
        .bind(child.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| self.store_err("add_link", e))?;
        Ok(())
    }

    /// Enumerate the children depending on `parent`.
    pub async fn walk_links(&self, parent: &Digest) -> Result<Vec<(NormalizedLink, Digest)>> {
        let rows = sqlx::query(
            r#"
            SELECT vertex, input, selector, child_key FROM links
            WHERE parent_key = ?
            ORDER BY vertex, input, selector, child_key
            "#,
        )
        .bind(parent.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| self.store_err("walk_links", e))?;

        rows.into_iter().map(|row| self.row_to_link(row, "child_key")).collect()
    }

    /// Enumerate the parents `child` depends on.
    pub async fn walk_backlinks(&self, child: &Digest) -> Result<Vec<(NormalizedLink, Digest)>> {
        let rows = sqlx::query(
            r#"
            SELECT vertex, input, selector, parent_key FROM links
            WHERE child_key = ?
            ORDER BY vertex, input, selector, parent_key
            "#,
        )
        .bind(child.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| self.store_err("walk_backlinks", e))?;

        rows.into_iter().map(|row| self.row_to_link(row, "parent_key")).collect()
    }

    /// Drop a key: its records, its results, and every link that references
    /// it on either side.
    #[instrument(skip(self), fields(key = %key.short()))]
    pub async fn release(&self, key: &Digest) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| self.store_err("release", e))?;

        sqlx::query("DELETE FROM results WHERE key = ?")
            .bind(key.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| self.store_err("release", e))?;
        sqlx::query("DELETE FROM records WHERE key = ?")
            .bind(key.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| self.store_err("release", e))?;
        sqlx::query("DELETE FROM links WHERE parent_key = ? OR child_key = ?")
            .bind(key.as_str())
            .bind(key.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| self.store_err("release", e))?;

        tx.commit().await.map_err(|e| self.store_err("release", e))
    }

    /// Drop records older than `keep_duration_secs`, with their results and
    /// links. Returns the number of records removed.
    #[instrument(skip(self))]
    pub async fn prune(&self, keep_duration_secs: u64) -> Result<u64> {
        let cutoff = Utc::now().timestamp() - keep_duration_secs as i64;
        let mut tx = self.pool.begin().await.map_err(|e| self.store_err("prune", e))?;

        let expired = sqlx::query("SELECT DISTINCT key FROM records WHERE created_at < ?")
            .bind(cutoff)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| self.store_err("prune", e))?;

        for row in &expired {
            let key: String = row.get("key");
            sqlx::query("DELETE FROM results WHERE key = ?")
                .bind(&key)
                .execute(&mut *tx)
                .await
                .map_err(|e| self.store_err("prune", e))?;
            sqlx::query("DELETE FROM links WHERE parent_key = ? OR child_key = ?")
                .bind(&key)
                .bind(&key)
                .execute(&mut *tx)
                .await
                .map_err(|e| self.store_err("prune", e))?;
        }

        let removed = sqlx::query("DELETE FROM records WHERE created_at < ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .map_err(|e| self.store_err("prune", e))?
            .rows_affected();

        tx.commit().await.map_err(|e| self.store_err("prune", e))?;

        if removed > 0 {
            info!(removed, "Pruned expired cache records");
        }
        Ok(removed)
    }

    /// Enumerate every stored key.
    pub async fn keys(&self) -> Result<Vec<Digest>> {
        let rows = sqlx::query("SELECT DISTINCT key FROM records ORDER BY key")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.store_err("keys", e))?;
        rows.into_iter().map(|row| Digest::parse(&row.get::<String, _>("key"))).collect()
    }

    /// Remove links whose endpoints have no record. Run at open; a crash
    /// between `add_link` and `save` can leave these behind.
    async fn prune_orphan_links(&self) -> Result<u64> {
        let removed = sqlx::query(
            r#"
            DELETE FROM links
            WHERE parent_key NOT IN (SELECT key FROM records)
               OR child_key NOT IN (SELECT key FROM records)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| self.store_err("prune_orphan_links", e))?
        .rows_affected();
        Ok(removed)
    }

    fn row_to_link(
        &self,
        row: sqlx::sqlite::SqliteRow,
        endpoint: &str,
    ) -> Result<(NormalizedLink, Digest)> {
        let vertex: String = row.get("vertex");
        let other: String = row.get(endpoint);
        Ok((
            NormalizedLink {
                vertex: Digest::parse(&vertex)?,
                input: row.get::<i64, _>("input") as usize,
                selector: row.get("selector"),
            },
            Digest::parse(&other)?,
        ))
    }

    fn store_err(&self, operation: &'static str, err: impl std::fmt::Display) -> KilnError {
        metrics::counter!("kiln_store_errors_total", "operation" => operation).increment(1);
        KilnError::Store(err.to_string())
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}
