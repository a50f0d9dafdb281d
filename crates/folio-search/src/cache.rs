//! Answer cache.
//!
//! A [`DashMap`] index fronts the `response_cache` table in `folio-store`.
//! Reads only touch the index; writes go to the index first and are then
//! persisted best-effort, so a failed write costs a future miss and nothing
//! else.  Expired entries are evicted lazily when they are read, and pruned
//! from disk when the cache is opened.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use folio_store::{CachedResponseRow, ResponseStore};

use crate::error::Result;
use crate::types::{Answer, Citation};

/// Default time-to-live of a cached answer.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Default bound on the in-memory index.
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

// ── keys ─────────────────────────────────────────────────────────────

/// Deterministic cache key for a query and its optional context label.
///
/// The query is lowercased, trimmed and whitespace-collapsed before hashing
/// so trivially different spellings share an entry.  The digest is SHA-256,
/// encoded as URL-safe base64.
pub fn cache_key(text: &str, context: Option<&str>) -> String {
    let normalized = normalize(text);
    let context = context.map(str::trim).unwrap_or_default();

    let mut ctx = ring::digest::Context::new(&ring::digest::SHA256);
    ctx.update(normalized.as_bytes());
    // Separator byte that cannot appear in normalized text.
    ctx.update(&[0x1f]);
    ctx.update(context.as_bytes());
    URL_SAFE_NO_PAD.encode(ctx.finish().as_ref())
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

// ── stats ────────────────────────────────────────────────────────────

struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of cache activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Lookups served from the index.
    pub hits: u64,
    /// Lookups that found nothing or an expired entry.
    pub misses: u64,
    /// Entries currently indexed.
    pub size: usize,
}

impl CacheStats {
    /// Total lookups (hits + misses).
    pub fn total(&self) -> u64 {
        self.hits + self.misses
    }

    /// Hit rate as a value between 0.0 and 1.0 (returns 0.0 if no lookups).
    pub fn hit_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} size={} rate={:.2}%",
            self.hits,
            self.misses,
            self.size,
            self.hit_rate() * 100.0,
        )
    }
}

// ── cache ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct CacheEntry {
    answer: Answer,
    expires_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Time-bounded answer cache with an optional durable backing store.
pub struct ResponseCache {
    index: DashMap<String, CacheEntry>,
    counters: Counters,
    store: Option<ResponseStore>,
    default_ttl: Duration,
    max_entries: usize,
}

impl ResponseCache {
    /// Memory-only cache.
    pub fn in_memory(default_ttl: Duration, max_entries: usize) -> Self {
        Self {
            index: DashMap::new(),
            counters: Counters::new(),
            store: None,
            default_ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Cache backed by `store`.  Expired rows are pruned and the rest are
    /// loaded into the index.
    pub async fn open(store: ResponseStore, default_ttl: Duration, max_entries: usize) -> Result<Self> {
        let mut cache = Self::in_memory(default_ttl, max_entries);
        let now = Utc::now();

        let pruned = store.prune_expired(now.timestamp()).await?;
        let rows = store.load_unexpired(now.timestamp()).await?;
        let mut loaded = 0usize;
        for row in rows {
            match entry_from_row(&row) {
                Ok((key, entry)) => {
                    cache.insert_bounded(key, entry);
                    loaded += 1;
                }
                Err(e) => tracing::warn!(key = %row.key, error = %e, "skipping unreadable cache row"),
            }
        }

        tracing::info!(loaded, pruned, "response cache opened");
        cache.store = Some(store);
        Ok(cache)
    }

    /// Default TTL applied by [`set_with_ttl`](Self::set_with_ttl) callers.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Look up an unexpired answer.  An expired entry is evicted (from disk
    /// too, best-effort) and reported as a miss.
    pub async fn get(&self, key: &str) -> Option<Answer> {
        self.get_at(key, Utc::now()).await
    }

    async fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<Answer> {
        if let Some(entry) = self.index.get(key)
            && !entry.is_expired(now)
        {
            self.counters.record_hit();
            tracing::debug!(key, "cache hit");
            return Some(entry.answer.clone());
        }

        self.counters.record_miss();
        if self
            .index
            .remove_if(key, |_, entry| entry.is_expired(now))
            .is_some()
        {
            tracing::debug!(key, "evicted expired cache entry");
            if let Some(store) = &self.store
                && let Err(e) = store.delete_expired(key, now.timestamp()).await
            {
                tracing::warn!(key, error = %e, "failed to delete expired cache row");
            }
        } else {
            tracing::debug!(key, "cache miss");
        }
        None
    }

    /// Insert or replace an answer that expires at `expires_at`.
    pub async fn set(&self, key: &str, answer: Answer, expires_at: DateTime<Utc>) {
        let entry = CacheEntry { answer, expires_at };
        let row = self.store.as_ref().map(|_| row_from_entry(key, &entry));
        self.insert_bounded(key.to_owned(), entry);

        let (Some(store), Some(row)) = (&self.store, row) else {
            return;
        };
        match row {
            Ok(row) => {
                if let Err(e) = store.upsert(row).await {
                    tracing::warn!(key, error = %e, "failed to persist cache entry");
                }
            }
            Err(e) => tracing::warn!(key, error = %e, "failed to encode cache entry"),
        }
    }

    /// Insert an answer that lives for `ttl` from now.
    pub async fn set_with_ttl(&self, key: &str, answer: Answer, ttl: Duration) {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = Utc::now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.set(key, answer, expires_at).await;
    }

    /// Drop every entry from memory and disk.  Counters are kept.
    pub async fn clear(&self) -> Result<()> {
        self.index.clear();
        if let Some(store) = &self.store {
            store.clear().await?;
        }
        tracing::info!("response cache cleared");
        Ok(())
    }

    /// Current hit/miss counters and index size.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            size: self.index.len(),
        }
    }

    /// Insert, evicting the entry closest to expiry when the index is full.
    fn insert_bounded(&self, key: String, entry: CacheEntry) {
        if !self.index.contains_key(&key) && self.index.len() >= self.max_entries {
            let victim = self
                .index
                .iter()
                .min_by_key(|e| e.value().expires_at)
                .map(|e| e.key().clone());
            if let Some(victim) = victim {
                self.index.remove(&victim);
                tracing::debug!(key = %victim, "cache full, evicted entry closest to expiry");
            }
        }
        self.index.insert(key, entry);
    }
}

fn row_from_entry(key: &str, entry: &CacheEntry) -> Result<CachedResponseRow> {
    Ok(CachedResponseRow {
        key: key.to_owned(),
        text: entry.answer.text.clone(),
        citations_json: serde_json::to_string(&entry.answer.citations)?,
        model: entry.answer.model.clone(),
        confidence: entry.answer.confidence,
        expires_at: entry.expires_at.timestamp(),
    })
}

fn entry_from_row(row: &CachedResponseRow) -> Result<(String, CacheEntry)> {
    let citations: Vec<Citation> = serde_json::from_str(&row.citations_json)?;
    let expires_at = Utc
        .timestamp_opt(row.expires_at, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    let answer = Answer {
        text: row.text.clone(),
        citations,
        model: row.model.clone(),
        confidence: row.confidence,
        cached: false,
        is_final: true,
    };
    Ok((row.key.clone(), CacheEntry { answer, expires_at }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
