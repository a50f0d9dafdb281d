//! Core types that cross the pipeline boundary.
//!
//! Callers hand in a [`Query`] and get back a sequence of [`Answer`]s.
//! Nothing else (cache entries, queue slots, rate windows) leaves the
//! pipeline.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// Scheduling priority of a query.  Higher variants drain first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work such as prefetching.
    Low = 0,
    /// Default priority.
    #[default]
    Normal = 1,
    /// User-visible but not blocking.
    High = 2,
    /// The user is actively waiting on this answer.
    Interactive = 3,
}

/// A user question plus an optional short context label (e.g. the title
/// and author of the book being read).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// The question text, as typed.
    pub text: String,
    /// Optional context label folded into the system prompt and cache key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Scheduling priority used when the rate limiter defers the query.
    #[serde(default)]
    pub priority: Priority,
}

impl Query {
    /// Create a query with no context and normal priority.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            context: None,
            priority: Priority::Normal,
        }
    }

    /// Attach a context label.  Blank labels are ignored.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let context = context.into();
        self.context = if context.trim().is_empty() {
            None
        } else {
            Some(context)
        };
        self
    }

    /// Set the scheduling priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

// ---------------------------------------------------------------------------
// Answer
// ---------------------------------------------------------------------------

/// A source the answer relies on, anchored to a position in the answer text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    /// Quoted or titled text of the citation.
    pub text: String,
    /// Source domain (e.g. `plato.stanford.edu`).
    pub source: String,
    /// Link to the source, when the provider supplied one.
    #[serde(default)]
    pub url: Option<String>,
    /// Heuristic trustworthiness in `[0, 1]`.
    pub credibility: f64,
    /// Character offset into the final answer text.
    pub position: usize,
}

/// An incremental or final answer to a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    /// Answer text.  Partial answers hold the text accumulated so far.
    pub text: String,
    /// Citations ordered by ascending position.
    pub citations: Vec<Citation>,
    /// Model that produced the answer.
    pub model: String,
    /// Confidence in `[0, 1]`, see [`Answer::compute_confidence`].
    pub confidence: f64,
    /// Whether this answer was served from the cache.
    #[serde(default)]
    pub cached: bool,
    /// Whether this is the terminal answer of its stream.
    #[serde(default)]
    pub is_final: bool,
}

/// Answer length (in characters) at which the length term saturates.
const CONFIDENCE_FULL_LENGTH: f64 = 500.0;

impl Answer {
    /// Assemble an answer, computing its confidence from text and citations.
    pub fn assemble(text: String, citations: Vec<Citation>, model: impl Into<String>) -> Self {
        let confidence = Self::compute_confidence(&text, &citations);
        Self {
            text,
            citations,
            model: model.into(),
            confidence,
            cached: false,
            is_final: false,
        }
    }

    /// `0.3 * min(1, chars / 500) + 0.7 * mean(credibility)`.
    ///
    /// The citation term is zero when there are no citations.
    pub fn compute_confidence(text: &str, citations: &[Citation]) -> f64 {
        let length_term = (text.chars().count() as f64 / CONFIDENCE_FULL_LENGTH).min(1.0);
        let citation_term = if citations.is_empty() {
            0.0
        } else {
            citations.iter().map(|c| c.credibility).sum::<f64>() / citations.len() as f64
        };
        (0.3 * length_term + 0.7 * citation_term).clamp(0.0, 1.0)
    }

    /// Mark this answer as the terminal value of its stream.
    pub fn into_final(mut self) -> Self {
        self.is_final = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn citation(credibility: f64) -> Citation {
        Citation {
            text: "t".into(),
            source: "example.com".into(),
            url: None,
            credibility,
            position: 0,
        }
    }

    #[test]
    fn confidence_without_citations_uses_length_only() {
        let text = "a".repeat(250);
        let c = Answer::compute_confidence(&text, &[]);
        assert!((c - 0.15).abs() < 1e-9);
    }

    #[test]
    fn confidence_saturates_length_term() {
        let text = "a".repeat(5_000);
        let c = Answer::compute_confidence(&text, &[citation(0.95), citation(0.75)]);
        assert!((c - (0.3 + 0.7 * 0.85)).abs() < 1e-9);
    }

    #[test]
    fn confidence_counts_characters_not_bytes() {
        let text = "é".repeat(500);
        let c = Answer::compute_confidence(&text, &[]);
        assert!((c - 0.3).abs() < 1e-9);
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::Interactive > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn blank_context_is_dropped() {
        let q = Query::new("what is this").with_context("   ");
        assert!(q.context.is_none());

        let q = Query::new("what is this").with_context("Dune by Frank Herbert");
        assert_eq!(q.context.as_deref(), Some("Dune by Frank Herbert"));
    }
}
