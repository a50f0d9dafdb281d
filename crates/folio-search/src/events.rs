//! Pipeline notifications.
//!
//! UI-facing state ("is a query running", "how long did it wait") lives
//! outside the pipeline.  The pipeline pushes plain [`PipelineEvent`]s into
//! a broadcast channel and whoever cares subscribes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::types::Priority;

/// Something that happened to a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PipelineEvent {
    /// A query entered the pipeline.
    QuerySubmitted {
        query_id: Uuid,
        text: String,
        priority: Priority,
        timestamp: DateTime<Utc>,
    },

    /// The rate limiter deferred a query.
    QueryQueued {
        query_id: Uuid,
        /// Requests waiting, including this one.
        depth: usize,
        timestamp: DateTime<Utc>,
    },

    /// A query started talking to the provider.
    QueryStarted {
        query_id: Uuid,
        model: String,
        timestamp: DateTime<Utc>,
    },

    /// A stream broke and is being reissued.
    QueryRetrying {
        query_id: Uuid,
        /// Retry number, starting at 1.
        attempt: u32,
        delay_ms: u64,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A query produced its final answer.
    QueryCompleted {
        query_id: Uuid,
        cached: bool,
        confidence: f64,
        citations: usize,
        timestamp: DateTime<Utc>,
    },

    /// A query failed.
    QueryFailed {
        query_id: Uuid,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl PipelineEvent {
    /// The query this event is about.
    pub fn query_id(&self) -> Uuid {
        match self {
            Self::QuerySubmitted { query_id, .. }
            | Self::QueryQueued { query_id, .. }
            | Self::QueryStarted { query_id, .. }
            | Self::QueryRetrying { query_id, .. }
            | Self::QueryCompleted { query_id, .. }
            | Self::QueryFailed { query_id, .. } => *query_id,
        }
    }
}

/// Broadcast sink for [`PipelineEvent`]s.  Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: broadcast::Sender<Arc<PipelineEvent>>,
}

impl EventSink {
    /// Create a sink buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event.  Having no subscribers is normal.
    pub fn emit(&self, event: PipelineEvent) {
        match self.sender.send(Arc::new(event)) {
            Ok(n) => tracing::trace!(receivers = n, "pipeline event published"),
            Err(_) => tracing::trace!("pipeline event published but no active receivers"),
        }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<PipelineEvent>> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(256)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let sink = EventSink::new(8);
        let mut rx = sink.subscribe();
        let id = Uuid::now_v7();

        sink.emit(PipelineEvent::QueryStarted {
            query_id: id,
            model: "sonar".into(),
            timestamp: Utc::now(),
        });
        sink.emit(PipelineEvent::QueryFailed {
            query_id: id,
            error: "boom".into(),
            timestamp: Utc::now(),
        });

        let first = rx.recv().await.unwrap();
        assert!(matches!(first.as_ref(), PipelineEvent::QueryStarted { .. }));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.query_id(), id);
        assert!(matches!(second.as_ref(), PipelineEvent::QueryFailed { .. }));
    }

    #[test]
    fn emit_without_subscribers_is_harmless() {
        let sink = EventSink::default();
        assert_eq!(sink.subscriber_count(), 0);
        sink.emit(PipelineEvent::QueryQueued {
            query_id: Uuid::now_v7(),
            depth: 1,
            timestamp: Utc::now(),
        });
    }
}
