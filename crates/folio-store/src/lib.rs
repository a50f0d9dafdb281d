//! # folio-store
//!
//! Storage engine for Folio.
//!
//! Provides SQLite-backed persistence with WAL mode and mmap for the
//! durable half of the answer cache.  The in-memory index that fronts it
//! lives in `folio-search`; this crate only knows about rows.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  ResponseStore (response_cache rows)    │
//! ├─────────────────────────────────────────┤
//! │  Database (rusqlite WAL + mmap)         │
//! │  Migrations (versioned, transactional)  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use folio_store::{Database, ResponseStore};
//!
//! let db = Database::open_and_migrate("data/folio.db").await?;
//! let store = ResponseStore::new(db);
//! let live = store.load_unexpired(chrono::Utc::now().timestamp()).await?;
//! ```

pub mod db;
pub mod error;
pub mod migration;
pub mod response;

// ── re-exports ───────────────────────────────────────────────────────

pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use response::{CachedResponseRow, ResponseStore};
