//! Streaming exchange with the provider.
//!
//! One [`StreamProcessor::run`] call drives a single query: it issues the
//! request, feeds content tokens to the caller's [`TokenBatcher`], merges
//! citations as they arrive, and on `[DONE]` assembles the final answer and
//! writes it to the cache.
//!
//! A transport failure (connection error, read error, per-attempt timeout,
//! or the body ending before `[DONE]`) reissues the same request from
//! scratch after an exponential backoff.  Text from the failed attempt is
//! discarded and the batcher is told to restart.  A non-200 status is fatal.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use reqwest::StatusCode;
use serde_json::Value;
use uuid::Uuid;

use crate::batcher::TokenBatcher;
use crate::cache::ResponseCache;
use crate::citations::CitationSet;
use crate::error::{Result, SearchError};
use crate::events::{EventSink, PipelineEvent};
use crate::provider::frames::{Frame, LineBuffer, decode_line};
use crate::provider::request::RequestTemplate;
use crate::types::{Answer, Query};

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Reconnection settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base of the backoff; retry `n` waits `base_delay * 2^n`.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (starting at 1).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(retry))
    }
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

/// What to run: the query, its routing decision and where to cache it.
#[derive(Debug, Clone, Copy)]
pub struct StreamJob<'a> {
    pub query_id: Uuid,
    pub query: &'a Query,
    pub model: &'a str,
    pub cache_key: &'a str,
}

/// Text and citations gathered by one successful attempt.
#[derive(Debug, Default)]
struct Collected {
    text: String,
    citations: CitationSet,
    frames: usize,
    skipped: usize,
}

/// Executes streaming exchanges against the provider.
pub struct StreamProcessor {
    http: reqwest::Client,
    template: RequestTemplate,
    retry: RetryPolicy,
    request_timeout: Duration,
    cache: Arc<ResponseCache>,
    events: EventSink,
}

impl StreamProcessor {
    /// Create a processor.
    pub fn new(
        template: RequestTemplate,
        retry: RetryPolicy,
        request_timeout: Duration,
        cache: Arc<ResponseCache>,
        events: EventSink,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| SearchError::Config {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            template,
            retry,
            request_timeout,
            cache,
            events,
        })
    }

    /// Run one query to completion.
    ///
    /// Content tokens go to `batcher` as they arrive.  The returned answer is
    /// final and has already been written to the cache.
    pub async fn run(&self, job: StreamJob<'_>, batcher: &TokenBatcher) -> Result<Answer> {
        let body = self.template.body(job.query, job.model);
        let max_attempts = self.retry.max_retries.saturating_add(1);

        let mut collected = None;
        for attempt in 1..=max_attempts {
            tracing::debug!(query_id = %job.query_id, attempt, max_attempts, "stream attempt");

            let result = tokio::time::timeout(self.request_timeout, self.attempt(&body, batcher))
                .await
                .unwrap_or_else(|_elapsed| {
                    Err(SearchError::TransportFailure {
                        reason: format!("timed out after {:?}", self.request_timeout),
                    })
                });

            match result {
                Ok(c) => {
                    collected = Some(c);
                    break;
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        query_id = %job.query_id,
                        attempt,
                        delay = ?delay,
                        error = %e,
                        "stream interrupted, restarting query"
                    );
                    batcher.restart();
                    self.events.emit(PipelineEvent::QueryRetrying {
                        query_id: job.query_id,
                        attempt,
                        delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        reason: e.to_string(),
                        timestamp: Utc::now(),
                    });
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_retryable() => {
                    return Err(SearchError::ExhaustedRetries {
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        let Some(collected) = collected else {
            // `max_attempts` is at least one, so the loop always breaks or returns.
            return Err(SearchError::ExhaustedRetries {
                attempts: 0,
                last_error: "no attempt was made".into(),
            });
        };

        if collected.skipped > 0 {
            tracing::warn!(
                query_id = %job.query_id,
                skipped = collected.skipped,
                "skipped malformed frames"
            );
        }

        let citations = collected.citations.resolve(&collected.text);
        let answer = Answer::assemble(collected.text, citations, job.model).into_final();
        tracing::info!(
            query_id = %job.query_id,
            model = job.model,
            frames = collected.frames,
            bytes = answer.text.len(),
            citations = answer.citations.len(),
            confidence = answer.confidence,
            "answer assembled"
        );

        self.cache
            .set_with_ttl(job.cache_key, answer.clone(), self.cache.default_ttl())
            .await;
        Ok(answer)
    }

    /// One request/response exchange.  Ends `Ok` only on `[DONE]`.
    async fn attempt(&self, body: &Value, batcher: &TokenBatcher) -> Result<Collected> {
        tracing::debug!(url = %self.template.endpoint(), model = %body["model"], "sending provider request");

        let resp = self
            .http
            .post(self.template.endpoint().clone())
            .headers(self.template.headers().clone())
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        if status != StatusCode::OK {
            let text = resp.text().await.unwrap_or_default();
            return Err(SearchError::InvalidResponse {
                status: status.as_u16(),
                body: text,
            });
        }

        let mut collected = Collected::default();
        let mut lines = LineBuffer::new();
        let mut byte_stream = resp.bytes_stream();

        while let Some(chunk) = byte_stream.next().await {
            lines.push(&chunk?);
            while let Some(line) = lines.next_line() {
                if consume_line(line, &mut collected, batcher) {
                    return Ok(collected);
                }
            }
        }

        if let Some(line) = lines.finish()
            && consume_line(line, &mut collected, batcher)
        {
            return Ok(collected);
        }

        Err(SearchError::TransportFailure {
            reason: "stream ended before [DONE]".into(),
        })
    }
}

/// Apply one line to the attempt state.  Returns `true` on `[DONE]`.
fn consume_line(line: Result<String>, collected: &mut Collected, batcher: &TokenBatcher) -> bool {
    match line.and_then(|l| decode_line(&l)) {
        Ok(Some(Frame::Done)) => true,
        Ok(Some(Frame::Delta { content, citations })) => {
            collected.frames += 1;
            if let Some(token) = content {
                collected.text.push_str(&token);
                batcher.push(token);
            }
            if !citations.is_empty() {
                collected.citations.merge(citations);
            }
            false
        }
        Ok(None) => false,
        Err(e) => {
            tracing::debug!(error = %e, "skipping frame");
            collected.skipped += 1;
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
