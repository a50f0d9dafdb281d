//! Priority queue for requests the rate limiter has deferred.
//!
//! Deferred callers receive a [`Ticket`] and wait on it.  A background
//! worker drains the queue strictly by (priority desc, arrival asc) whenever
//! the limiter admits, and wakes up again when the current window can reset
//! or the oldest entry is about to expire.
//!
//! The queue is bounded: beyond `max_depth` waiting entries new requests are
//! rejected with [`SearchError::QueueFull`], and entries older than
//! `max_wait` are failed with [`SearchError::QueueExpired`].  Entries whose
//! caller has already gone away are discarded without consuming limiter
//! capacity.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{Result, SearchError};
use crate::rate_limiter::RateLimiter;
use crate::types::Priority;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Bounds applied to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    /// Maximum number of waiting requests.
    pub max_depth: usize,
    /// Maximum time a request may wait before it is rejected.
    pub max_wait: Duration,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_depth: 64,
            max_wait: Duration::from_secs(120),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue entries
// ---------------------------------------------------------------------------

/// A request waiting for admission.
struct QueuedRequest {
    query_id: Uuid,
    priority: Priority,
    seq: u64,
    enqueued_at: Instant,
    ticket: oneshot::Sender<Result<()>>,
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    /// Max-heap order: higher priority first, then lower sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Handle a deferred caller awaits until the queue admits its request.
#[derive(Debug)]
pub struct Ticket {
    rx: oneshot::Receiver<Result<()>>,
    enqueued_at: Instant,
}

impl Ticket {
    /// Wait for admission.  Returns how long the request waited.
    pub async fn admitted(self) -> Result<Duration> {
        match self.rx.await {
            Ok(Ok(())) => Ok(self.enqueued_at.elapsed()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SearchError::Cancelled),
        }
    }
}

// ---------------------------------------------------------------------------
// RequestQueue
// ---------------------------------------------------------------------------

/// Bounded priority queue drained by a background worker.
pub struct RequestQueue {
    inner: Arc<QueueInner>,
    worker: JoinHandle<()>,
}

struct QueueInner {
    heap: Mutex<BinaryHeap<QueuedRequest>>,
    next_seq: AtomicU64,
    notify: Notify,
    limiter: Arc<RateLimiter>,
    limits: QueueLimits,
}

impl RequestQueue {
    /// Create the queue and spawn its drain worker onto the current runtime.
    pub fn start(limiter: Arc<RateLimiter>, limits: QueueLimits) -> Self {
        let inner = Arc::new(QueueInner {
            heap: Mutex::new(BinaryHeap::new()),
            next_seq: AtomicU64::new(0),
            notify: Notify::new(),
            limiter,
            limits,
        });

        let worker_inner = Arc::clone(&inner);
        let worker = tokio::spawn(async move {
            tracing::debug!("request queue worker started");
            worker_inner.drain_loop().await;
        });

        Self { inner, worker }
    }

    /// Admit immediately if nothing is waiting and the limiter has capacity.
    ///
    /// Returns `false` when the caller must [`enqueue`](Self::enqueue).
    pub fn try_admit_now(&self) -> bool {
        if !self.inner.lock_heap().is_empty() {
            return false;
        }
        !self.inner.limiter.should_queue()
    }

    /// Queue a request.  Fails fast when the queue is full.
    pub fn enqueue(&self, query_id: Uuid, priority: Priority) -> Result<Ticket> {
        let (tx, rx) = oneshot::channel();
        let enqueued_at = Instant::now();

        {
            let mut heap = self.inner.lock_heap();
            if heap.len() >= self.inner.limits.max_depth {
                tracing::warn!(
                    %query_id,
                    depth = heap.len(),
                    "request queue full, rejecting"
                );
                return Err(SearchError::QueueFull {
                    capacity: self.inner.limits.max_depth,
                });
            }

            let seq = self.inner.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
            heap.push(QueuedRequest {
                query_id,
                priority,
                seq,
                enqueued_at,
                ticket: tx,
            });
            tracing::debug!(%query_id, ?priority, depth = heap.len(), "request queued");
        }

        self.inner.notify.notify_one();
        Ok(Ticket { rx, enqueued_at })
    }

    /// Number of requests currently waiting.
    pub fn depth(&self) -> usize {
        self.inner.lock_heap().len()
    }
}

impl Drop for RequestQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

impl QueueInner {
    fn lock_heap(&self) -> MutexGuard<'_, BinaryHeap<QueuedRequest>> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn drain_loop(&self) {
        loop {
            match self.drain_once(Instant::now()) {
                None => self.notify.notified().await,
                Some(wait) => {
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.notify.notified() => {}
                    }
                }
            }
        }
    }

    /// Expire stale entries and admit as many as the limiter allows.
    ///
    /// Returns how long to sleep before the next attempt, or `None` when the
    /// queue is empty.
    fn drain_once(&self, now: Instant) -> Option<Duration> {
        let mut heap = self.lock_heap();
        self.expire_stale(&mut heap, now);

        while let Some(top) = heap.peek() {
            if top.ticket.is_closed() {
                if let Some(dropped) = heap.pop() {
                    tracing::debug!(query_id = %dropped.query_id, "dropping abandoned queued request");
                }
                continue;
            }

            if self.limiter.should_queue() {
                break;
            }

            if let Some(next) = heap.pop() {
                tracing::debug!(
                    query_id = %next.query_id,
                    priority = ?next.priority,
                    waited = ?now.saturating_duration_since(next.enqueued_at),
                    "admitting queued request"
                );
                // The caller may have left between the check and the send;
                // the slot it consumed is lost, which only errs on the safe side.
                let _ = next.ticket.send(Ok(()));
            }
        }

        if heap.is_empty() {
            return None;
        }

        let until_expiry = heap
            .iter()
            .map(|r| (r.enqueued_at + self.limits.max_wait).saturating_duration_since(now))
            .min()
            .unwrap_or(self.limits.max_wait);

        Some(self.limiter.time_until_reset().min(until_expiry))
    }

    fn expire_stale(&self, heap: &mut BinaryHeap<QueuedRequest>, now: Instant) {
        let has_stale = heap
            .iter()
            .any(|r| now.saturating_duration_since(r.enqueued_at) >= self.limits.max_wait);
        if !has_stale {
            return;
        }

        let entries = std::mem::take(heap).into_vec();
        let mut keep = Vec::with_capacity(entries.len());
        for entry in entries {
            let waited = now.saturating_duration_since(entry.enqueued_at);
            if waited >= self.limits.max_wait {
                tracing::warn!(query_id = %entry.query_id, ?waited, "queued request expired");
                let _ = entry.ticket.send(Err(SearchError::QueueExpired { waited }));
            } else {
                keep.push(entry);
            }
        }
        *heap = BinaryHeap::from(keep);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
