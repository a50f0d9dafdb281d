//! The query pipeline facade.
//!
//! ```text
//! stream(query)
//!   ├─ cache lookup ───────────── hit ──> final Answer (cached = true)
//!   ├─ admission: rate limiter, else priority queue
//!   └─ StreamProcessor ──> TokenBatcher ──> partial Answers
//!                     └──> final Answer (cached, emitted last)
//! ```
//!
//! Each query runs on its own task.  The caller reads its answers from an
//! [`AnswerStream`]; dropping the stream aborts the task, which cancels the
//! HTTP transfer, any backoff sleep and any queue wait.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::Utc;
use folio_store::{Database, ResponseStore};
use futures::Stream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::batcher::{BatchEvent, BatchTiming, TokenBatcher};
use crate::cache::{CacheStats, ResponseCache, cache_key};
use crate::complexity::ModelSelector;
use crate::config::PipelineConfig;
use crate::error::{Result, SearchError};
use crate::events::{EventSink, PipelineEvent};
use crate::provider::{RequestTemplate, StreamJob, StreamProcessor};
use crate::queue::RequestQueue;
use crate::rate_limiter::RateLimiter;
use crate::types::{Answer, Priority, Query};

/// Answers buffered per stream.  Partial answers beyond this are dropped
/// while the consumer lags; the final answer is always delivered.
const STREAM_BUFFER: usize = 32;

// ---------------------------------------------------------------------------
// AnswerStream
// ---------------------------------------------------------------------------

/// Answers for one query: zero or more partial answers, then exactly one
/// final answer or one error.
pub struct AnswerStream {
    query_id: Uuid,
    rx: mpsc::Receiver<Result<Answer>>,
    task: JoinHandle<()>,
}

impl AnswerStream {
    /// Identifier used in [`PipelineEvent`]s for this query.
    pub fn query_id(&self) -> Uuid {
        self.query_id
    }

    /// Skip partial answers and wait for the final one.
    pub async fn final_answer(mut self) -> Result<Answer> {
        while let Some(item) = self.rx.recv().await {
            let answer = item?;
            if answer.is_final {
                return Ok(answer);
            }
        }
        Err(SearchError::Cancelled)
    }
}

impl Stream for AnswerStream {
    type Item = Result<Answer>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for AnswerStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ---------------------------------------------------------------------------
// SearchPipeline
// ---------------------------------------------------------------------------

/// Long-lived, shareable query pipeline.  Cheap to clone.
#[derive(Clone)]
pub struct SearchPipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    cache: Arc<ResponseCache>,
    limiter: Arc<RateLimiter>,
    queue: RequestQueue,
    processor: StreamProcessor,
    selector: ModelSelector,
    events: EventSink,
    batch_timing: BatchTiming,
}

impl SearchPipeline {
    /// Build a pipeline from validated configuration.
    ///
    /// Opens (and migrates) the cache database unless `cache.persist` is
    /// off.  Must be called inside a Tokio runtime.
    pub async fn open(config: PipelineConfig, api_key: impl Into<String>) -> Result<Self> {
        config.validate()?;
        let api_key = api_key.into();

        let cache = if config.cache.persist {
            let db = Database::open_and_migrate(config.cache.path.clone()).await?;
            ResponseCache::open(
                ResponseStore::new(db),
                config.cache_ttl(),
                config.cache.max_entries,
            )
            .await?
        } else {
            ResponseCache::in_memory(config.cache_ttl(), config.cache.max_entries)
        };
        let cache = Arc::new(cache);

        let events = EventSink::default();
        let template = RequestTemplate::new(
            &config.provider.base_url,
            &api_key,
            config.provider.temperature,
            config.provider.max_tokens,
        )?;
        let processor = StreamProcessor::new(
            template,
            config.retry_policy(),
            config.request_timeout(),
            Arc::clone(&cache),
            events.clone(),
        )?;

        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit.capacity,
            config.rate_window(),
        ));
        let queue = RequestQueue::start(Arc::clone(&limiter), config.queue_limits());
        let batch_timing = config.batch_timing();

        tracing::info!(
            base_url = %config.provider.base_url,
            persist = config.cache.persist,
            capacity = config.rate_limit.capacity,
            "search pipeline ready"
        );

        Ok(Self {
            inner: Arc::new(PipelineInner {
                cache,
                limiter,
                queue,
                processor,
                selector: ModelSelector::new(
                    config.provider.cheap_model,
                    config.provider.premium_model,
                ),
                events,
                batch_timing,
            }),
        })
    }

    /// Stream answers for `text`, optionally scoped by a context label.
    pub fn stream(&self, text: impl Into<String>, context: Option<&str>) -> AnswerStream {
        let mut query = Query::new(text);
        if let Some(context) = context {
            query = query.with_context(context);
        }
        self.stream_query(query)
    }

    /// Stream answers for a fully specified query.
    pub fn stream_query(&self, query: Query) -> AnswerStream {
        let query_id = Uuid::now_v7();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.drive(query_id, query, tx).await });
        AnswerStream { query_id, rx, task }
    }

    /// Convenience: wait for the final answer only.
    pub async fn ask(&self, text: impl Into<String>, context: Option<&str>) -> Result<Answer> {
        self.stream(text, context).final_answer().await
    }

    /// Drop every cached answer.
    pub async fn clear_cache(&self) -> Result<()> {
        self.inner.cache.clear().await
    }

    /// Cache hit/miss counters and size.
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Requests currently waiting for rate-limit capacity.
    pub fn queue_depth(&self) -> usize {
        self.inner.queue.depth()
    }

    /// Requests admitted in the current rate window.
    pub fn window_count(&self) -> u32 {
        self.inner.limiter.window().count
    }

    /// Subscribe to pipeline notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<PipelineEvent>> {
        self.inner.events.subscribe()
    }
}

impl PipelineInner {
    async fn drive(&self, query_id: Uuid, query: Query, tx: mpsc::Sender<Result<Answer>>) {
        self.events.emit(PipelineEvent::QuerySubmitted {
            query_id,
            text: query.text.clone(),
            priority: query.priority,
            timestamp: Utc::now(),
        });

        let outcome = self.answer(query_id, &query, &tx).await;
        match &outcome {
            Ok(answer) => self.events.emit(PipelineEvent::QueryCompleted {
                query_id,
                cached: answer.cached,
                confidence: answer.confidence,
                citations: answer.citations.len(),
                timestamp: Utc::now(),
            }),
            Err(e) => {
                tracing::warn!(%query_id, error = %e, "query failed");
                self.events.emit(PipelineEvent::QueryFailed {
                    query_id,
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
            }
        }
        // A closed receiver means the caller stopped listening.
        let _ = tx.send(outcome).await;
    }

    async fn answer(
        &self,
        query_id: Uuid,
        query: &Query,
        tx: &mpsc::Sender<Result<Answer>>,
    ) -> Result<Answer> {
        let key = cache_key(&query.text, query.context.as_deref());
        if let Some(mut hit) = self.cache.get(&key).await {
            hit.cached = true;
            hit.is_final = true;
            return Ok(hit);
        }

        self.admit(query_id, query.priority).await?;

        let model = self.selector.select(&query.text).to_owned();
        self.events.emit(PipelineEvent::QueryStarted {
            query_id,
            model: model.clone(),
            timestamp: Utc::now(),
        });

        let (batch_tx, mut batch_rx) = mpsc::unbounded_channel();
        let batcher = TokenBatcher::spawn(self.batch_timing, batch_tx);
        let mut partial = String::new();

        let result = {
            let run = self.processor.run(
                StreamJob {
                    query_id,
                    query,
                    model: &model,
                    cache_key: &key,
                },
                &batcher,
            );
            tokio::pin!(run);

            loop {
                tokio::select! {
                    res = &mut run => break res,
                    Some(event) = batch_rx.recv() => {
                        forward_partial(event, &mut partial, &model, tx);
                    }
                }
            }
        };

        batcher.finish().await;
        while let Some(event) = batch_rx.recv().await {
            forward_partial(event, &mut partial, &model, tx);
        }

        result
    }

    /// Wait until the rate limiter lets this query through.
    async fn admit(&self, query_id: Uuid, priority: Priority) -> Result<()> {
        if self.queue.try_admit_now() {
            return Ok(());
        }

        let ticket = self.queue.enqueue(query_id, priority)?;
        self.events.emit(PipelineEvent::QueryQueued {
            query_id,
            depth: self.queue.depth(),
            timestamp: Utc::now(),
        });

        let waited = ticket.admitted().await?;
        tracing::debug!(%query_id, ?waited, "queued query admitted");
        Ok(())
    }
}

/// Turn a batcher event into a partial answer for the caller.
///
/// Never waits on the consumer: the provider stream keeps being read while
/// the caller is slow.  Each partial carries the whole text so far, so a
/// dropped one is superseded by the next.
fn forward_partial(
    event: BatchEvent,
    partial: &mut String,
    model: &str,
    tx: &mpsc::Sender<Result<Answer>>,
) {
    match event {
        BatchEvent::Flush(chunk) => {
            partial.push_str(&chunk);
            let answer = Answer::assemble(partial.clone(), Vec::new(), model);
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(Ok(answer)) {
                tracing::trace!(bytes = partial.len(), "consumer lagging, dropped partial answer");
            }
        }
        BatchEvent::Restart => partial.clear(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
