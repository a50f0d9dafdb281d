//! # folio-search
//!
//! Streaming question answering for Folio.
//!
//! A reader's question goes through a small pipeline that returns a cited
//! answer incrementally while keeping cost and provider load in check.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  SearchPipeline  (stream / ask / cache stats / events)   │
//! ├──────────────┬──────────────┬────────────────────────────┤
//! │ ResponseCache│ RateLimiter  │ StreamProcessor            │
//! │ (DashMap +   │ RequestQueue │  ├─ RequestTemplate        │
//! │  folio-store)│ (priority)   │  ├─ frames (SSE decoding)  │
//! │              │              │  ├─ TokenBatcher           │
//! │              │              │  └─ citations              │
//! ├──────────────┴──────────────┴────────────────────────────┤
//! │  ModelSelector (complexity-based routing)                │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`pipeline`] -- The facade and per-query answer streams.
//! - [`provider`] -- Request construction, wire decoding, reconnection.
//! - [`cache`] -- Time-bounded answer cache over SQLite.
//! - [`rate_limiter`] / [`queue`] -- Fixed-window admission and the
//!   priority queue for deferred requests.
//! - [`batcher`] -- Coalesces tokens into UI-sized updates.
//! - [`citations`] -- Citation parsing, credibility and anchoring.
//! - [`complexity`] -- Query classification and model choice.
//! - [`config`] / [`events`] / [`error`] -- Ambient plumbing.

pub mod batcher;
pub mod cache;
pub mod citations;
pub mod complexity;
pub mod config;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod provider;
pub mod queue;
pub mod rate_limiter;
pub mod types;

pub use cache::{CacheStats, ResponseCache, cache_key};
pub use complexity::{ComplexityAnalyzer, ModelSelector, QueryComplexity};
pub use config::PipelineConfig;
pub use error::{Result, SearchError};
pub use events::{EventSink, PipelineEvent};
pub use pipeline::{AnswerStream, SearchPipeline};
pub use rate_limiter::RateLimiter;
pub use types::{Answer, Citation, Priority, Query};
