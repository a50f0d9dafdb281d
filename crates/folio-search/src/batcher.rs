//! Token batching.
//!
//! Provider deltas are often a handful of characters each.  The batcher
//! coalesces them so the consumer sees at most one update per `interval`:
//! every token pushes the pending flush out to `now + interval`, bounded by
//! `max_latency` measured from the first token of the batch so a steady
//! trickle cannot postpone output forever.
//!
//! The batcher is an actor owning its buffer; the stream processor talks to
//! it through [`TokenBatcher`] and reads [`BatchEvent`]s from the channel it
//! handed in.  Pending text is *not* flushed when the batcher finishes: the
//! final answer always carries the complete text.

use std::future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Timing knobs for a batcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchTiming {
    /// Quiet period after the last token before a flush.
    pub interval: Duration,
    /// Upper bound on how long a buffered token may wait.
    pub max_latency: Duration,
}

impl Default for BatchTiming {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(50),
            max_latency: Duration::from_millis(250),
        }
    }
}

/// Output of the batcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchEvent {
    /// Coalesced text since the previous flush.
    Flush(String),
    /// The stream restarted; text flushed so far is void.
    Restart,
}

enum BatchInput {
    Token(String),
    Restart,
}

/// Handle to a running batcher actor.
#[derive(Debug)]
pub struct TokenBatcher {
    tx: mpsc::UnboundedSender<BatchInput>,
    task: JoinHandle<()>,
}

impl TokenBatcher {
    /// Spawn a batcher that writes its output to `out`.
    pub fn spawn(timing: BatchTiming, out: mpsc::UnboundedSender<BatchEvent>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(timing, rx, out));
        Self { tx, task }
    }

    /// Buffer a token.  Empty tokens are ignored.
    pub fn push(&self, token: impl Into<String>) {
        let token = token.into();
        if token.is_empty() {
            return;
        }
        // A closed actor means the consumer is gone; nothing left to batch for.
        let _ = self.tx.send(BatchInput::Token(token));
    }

    /// Discard the buffer and tell the consumer to forget earlier flushes.
    pub fn restart(&self) {
        let _ = self.tx.send(BatchInput::Restart);
    }

    /// Stop the actor and wait until every event it produced has been sent.
    pub async fn finish(self) {
        drop(self.tx);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "token batcher task failed");
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => future::pending().await,
    }
}

async fn run(
    timing: BatchTiming,
    mut rx: mpsc::UnboundedReceiver<BatchInput>,
    out: mpsc::UnboundedSender<BatchEvent>,
) {
    let mut buffer = String::new();
    let mut batch_started: Option<Instant> = None;
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            input = rx.recv() => match input {
                Some(BatchInput::Token(token)) => {
                    let now = Instant::now();
                    let started = *batch_started.get_or_insert(now);
                    buffer.push_str(&token);
                    deadline = Some((now + timing.interval).min(started + timing.max_latency));
                }
                Some(BatchInput::Restart) => {
                    buffer.clear();
                    batch_started = None;
                    deadline = None;
                    if out.send(BatchEvent::Restart).is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = sleep_until_deadline(deadline) => {
                batch_started = None;
                deadline = None;
                let chunk = std::mem::take(&mut buffer);
                tracing::trace!(chars = chunk.len(), "flushing token batch");
                if out.send(BatchEvent::Flush(chunk)).is_err() {
                    break;
                }
            }
        }
    }

    if !buffer.is_empty() {
        tracing::trace!(chars = buffer.len(), "batcher finished with unflushed text");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
