//! Durable rows behind the answer cache.
//!
//! One record per cache key: the answer text, its citations serialized as
//! JSON, the model that produced it, a confidence score and an expiration
//! timestamp (Unix seconds).  The store never decides freshness on its own;
//! callers pass `now` so the in-memory index and the disk agree on time.

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::db::Database;
use crate::error::StoreResult;

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// A persisted cache record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponseRow {
    /// Deterministic hash of the normalized query and its context label.
    pub key: String,
    /// Full answer text.
    pub text: String,
    /// JSON array of citations, opaque to this crate.
    pub citations_json: String,
    /// Model identifier that produced the answer.
    pub model: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Unix timestamp after which the row must not be served.
    pub expires_at: i64,
}

// ═══════════════════════════════════════════════════════════════════════
//  ResponseStore
// ═══════════════════════════════════════════════════════════════════════

/// CRUD operations on the `response_cache` table.
#[derive(Clone)]
pub struct ResponseStore {
    db: Database,
}

impl ResponseStore {
    /// Create a new response store backed by `db`.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a row, replacing any existing row with the same key.
    #[instrument(skip(self, row), fields(key = %row.key))]
    pub async fn upsert(&self, row: CachedResponseRow) -> StoreResult<()> {
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO response_cache (key, text, citations_json, model, confidence, expires_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                     ON CONFLICT(key) DO UPDATE SET \
                        text = excluded.text, \
                        citations_json = excluded.citations_json, \
                        model = excluded.model, \
                        confidence = excluded.confidence, \
                        expires_at = excluded.expires_at",
                    rusqlite::params![
                        row.key,
                        row.text,
                        row.citations_json,
                        row.model,
                        row.confidence,
                        row.expires_at
                    ],
                )?;
                Ok(())
            })
            .await?;

        debug!("response row persisted");
        Ok(())
    }

    /// Load every row that is still valid at `now` (Unix seconds).
    ///
    /// A row is valid while `now <= expires_at`.
    #[instrument(skip(self))]
    pub async fn load_unexpired(&self, now: i64) -> StoreResult<Vec<CachedResponseRow>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT key, text, citations_json, model, confidence, expires_at \
                     FROM response_cache WHERE expires_at >= ?1",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![now], |row| {
                        Ok(CachedResponseRow {
                            key: row.get(0)?,
                            text: row.get(1)?,
                            citations_json: row.get(2)?,
                            model: row.get(3)?,
                            confidence: row.get(4)?,
                            expires_at: row.get(5)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Delete every row whose expiration lies strictly before `now`.
    ///
    /// Returns the number of rows removed.
    #[instrument(skip(self))]
    pub async fn prune_expired(&self, now: i64) -> StoreResult<usize> {
        let removed = self
            .db
            .execute(move |conn| {
                let n = conn.execute(
                    "DELETE FROM response_cache WHERE expires_at < ?1",
                    rusqlite::params![now],
                )?;
                Ok(n)
            })
            .await?;

        if removed > 0 {
            debug!(removed, "pruned expired response rows");
        }
        Ok(removed)
    }

    /// Delete a single row. Deleting a missing key is not an error.
    #[instrument(skip(self))]
    pub async fn delete(&self, key: &str) -> StoreResult<()> {
        let key = key.to_string();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "DELETE FROM response_cache WHERE key = ?1",
                    rusqlite::params![key],
                )?;
                Ok(())
            })
            .await
    }

    /// Delete `key` only if its row expired before `now`.  A row that was
    /// refreshed since the caller saw it stale is left alone.
    ///
    /// Returns whether a row was removed.
    #[instrument(skip(self))]
    pub async fn delete_expired(&self, key: &str, now: i64) -> StoreResult<bool> {
        let key = key.to_string();
        self.db
            .execute(move |conn| {
                let n = conn.execute(
                    "DELETE FROM response_cache WHERE key = ?1 AND expires_at < ?2",
                    rusqlite::params![key, now],
                )?;
                Ok(n > 0)
            })
            .await
    }

    /// Delete every row.
    #[instrument(skip(self))]
    pub async fn clear(&self) -> StoreResult<()> {
        self.db
            .execute(|conn| {
                conn.execute("DELETE FROM response_cache", [])?;
                Ok(())
            })
            .await
    }

    /// Count rows, expired or not.
    pub async fn count(&self) -> StoreResult<i64> {
        self.db
            .execute(|conn| {
                let c: i64 =
                    conn.query_row("SELECT count(*) FROM response_cache", [], |row| row.get(0))?;
                Ok(c)
            })
            .await
    }
}

// ── tests ────────────────────────────────────────────────────────────
