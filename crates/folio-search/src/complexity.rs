//! Query complexity and model selection.
//!
//! Routes queries to a cheap or a premium model based on estimated
//! complexity.  Classification is a pure function of the query text.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Complexity estimation
// ---------------------------------------------------------------------------

/// Estimated complexity of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryComplexity {
    /// Short factual lookups.
    Simple,
    /// Everything between simple and complex.
    Moderate,
    /// Long questions or questions that ask for reasoning.
    Complex,
}

/// Above this many words a query is always complex.
const COMPLEX_WORD_COUNT: usize = 30;

/// Below this many words a query may be simple.
const SIMPLE_WORD_COUNT: usize = 10;

/// Moderate queries longer than this (in characters) get the premium model.
const MODERATE_PREMIUM_CHARS: usize = 100;

/// Phrases that ask the model to reason rather than recall.
static REASONING_INDICATORS: LazyLock<Option<Regex>> = LazyLock::new(|| {
    compile_pattern(
        "reasoning indicators",
        r"(?i)\b(?:why|how does|what if|explain the relationship|what are the implications|how would you)\b",
    )
});

/// Analytical verbs.  Prefix match so inflections ("compares") count.
static COMPLEX_TERMS: LazyLock<Option<Regex>> = LazyLock::new(|| {
    compile_pattern(
        "complex terms",
        r"(?i)\b(?:analy[sz]e|compare|contrast|evaluate|synthesi[sz]e|critique|examine|interpret)",
    )
});

/// Compile a classifier pattern.  A pattern that fails to build is logged
/// and never matches.
fn compile_pattern(name: &str, pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::error!(name, error = %e, "failed to compile classifier pattern");
            None
        }
    }
}

fn pattern_matches(re: &Option<Regex>, text: &str) -> bool {
    re.as_ref().is_some_and(|re| re.is_match(text))
}

/// Stateless classifier over query text.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComplexityAnalyzer;

impl ComplexityAnalyzer {
    /// Classify a query.
    ///
    /// - `Complex` if it has more than 30 words or contains a reasoning
    ///   indicator.
    /// - `Simple` if it has fewer than 10 words, no analytical term and no
    ///   reasoning indicator.
    /// - `Moderate` otherwise.
    pub fn classify(text: &str) -> QueryComplexity {
        let word_count = text.split_whitespace().count();
        let reasoning = pattern_matches(&REASONING_INDICATORS, text);

        if word_count > COMPLEX_WORD_COUNT || reasoning {
            return QueryComplexity::Complex;
        }

        if word_count < SIMPLE_WORD_COUNT && !pattern_matches(&COMPLEX_TERMS, text) {
            QueryComplexity::Simple
        } else {
            QueryComplexity::Moderate
        }
    }
}

// ---------------------------------------------------------------------------
// Model selection
// ---------------------------------------------------------------------------

/// Picks between a cheap and a premium model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelector {
    cheap: String,
    premium: String,
}

impl ModelSelector {
    /// Create a selector over the two model identifiers.
    pub fn new(cheap: impl Into<String>, premium: impl Into<String>) -> Self {
        Self {
            cheap: cheap.into(),
            premium: premium.into(),
        }
    }

    /// Model for an already-classified query.
    pub fn for_complexity(&self, complexity: QueryComplexity, text: &str) -> &str {
        match complexity {
            QueryComplexity::Simple => &self.cheap,
            QueryComplexity::Complex => &self.premium,
            QueryComplexity::Moderate if text.chars().count() > MODERATE_PREMIUM_CHARS => {
                &self.premium
            }
            QueryComplexity::Moderate => &self.cheap,
        }
    }

    /// Classify the query and pick its model in one step.
    pub fn select(&self, text: &str) -> &str {
        let complexity = ComplexityAnalyzer::classify(text);
        let model = self.for_complexity(complexity, text);
        tracing::debug!(?complexity, model, "selected model for query");
        model
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
