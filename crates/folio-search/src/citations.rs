//! Citation extraction and scoring.
//!
//! The provider sends citations either as bare URLs or as small objects.
//! Each raw record is scored by the tier its domain falls into and anchored
//! at the first place its text occurs in the answer.  Records that cannot
//! be found in the answer get a synthetic position (`index * 100`) so their
//! relative order survives sorting.

use std::sync::LazyLock;

use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use serde_json::Value;

use crate::types::Citation;

// ---------------------------------------------------------------------------
// Credibility tiers
// ---------------------------------------------------------------------------

/// Score for domains that match no tier.
pub const DEFAULT_CREDIBILITY: f64 = 0.6;

/// Spacing between synthetic positions of unanchored citations.
const FALLBACK_POSITION_STRIDE: usize = 100;

/// A family of domains sharing one credibility score.
struct SourceTier {
    name: &'static str,
    score: f64,
    matcher: AhoCorasick,
}

/// Tier definitions in match order.  Patterns are matched against the
/// domain wrapped in dots (`.news.bbc.co.uk.`), so `.edu.` only hits real
/// `.edu` labels and `.x.com.` does not hit `fox.com`.
const TIER_PATTERNS: &[(&str, f64, &[&str])] = &[
    (
        "academic",
        0.95,
        &[".edu.", "scholar", "jstor", "pubmed", "arxiv"],
    ),
    (
        "news",
        0.85,
        &[
            "nytimes",
            "washingtonpost",
            ".bbc.",
            "reuters",
            "apnews",
            "theguardian",
            ".wsj.",
            ".npr.",
            "economist",
            "bloomberg",
            ".ft.com.",
        ],
    ),
    (
        "encyclopedic",
        0.75,
        &["wikipedia", "britannica", "encyclopedia"],
    ),
    (
        "social",
        0.4,
        &[
            "twitter",
            ".x.com.",
            "facebook",
            "reddit",
            "instagram",
            "tiktok",
            "quora",
        ],
    ),
];

static TIERS: LazyLock<Vec<SourceTier>> = LazyLock::new(|| {
    TIER_PATTERNS
        .iter()
        .filter_map(|&(name, score, patterns)| {
            match AhoCorasickBuilder::new()
                .ascii_case_insensitive(true)
                .build(patterns)
            {
                Ok(matcher) => Some(SourceTier {
                    name,
                    score,
                    matcher,
                }),
                Err(e) => {
                    tracing::error!(tier = name, error = %e, "failed to build source tier matcher");
                    None
                }
            }
        })
        .collect()
});

/// Credibility score for a source domain.
pub fn credibility_for(domain: &str) -> f64 {
    let haystack = format!(".{}.", domain.trim_matches('.'));
    TIERS
        .iter()
        .find(|tier| tier.matcher.is_match(&haystack))
        .map(|tier| {
            tracing::trace!(domain, tier = tier.name, "matched source tier");
            tier.score
        })
        .unwrap_or(DEFAULT_CREDIBILITY)
}

// ---------------------------------------------------------------------------
// Raw citations
// ---------------------------------------------------------------------------

/// A citation as it arrives on the wire, before scoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCitation {
    /// Quoted text, title, or the URL itself when nothing else is given.
    pub text: String,
    /// Link to the source.
    pub url: Option<String>,
    /// Domain, either given explicitly or derived from the URL.
    pub domain: String,
}

impl RawCitation {
    /// Build from a bare URL string.
    pub fn from_url(url: &str) -> Self {
        Self {
            text: url.to_owned(),
            url: Some(url.to_owned()),
            domain: domain_of(url).unwrap_or_else(|| "unknown".into()),
        }
    }

    /// Parse one element of a wire `citations` array.
    ///
    /// Accepts a URL string or an object with any of `text`, `title`,
    /// `snippet`, `url` and `domain`/`source`.  Returns `None` for records
    /// carrying neither text nor a URL.
    pub fn from_value(v: &Value) -> Option<Self> {
        if let Some(url) = v.as_str() {
            return (!url.trim().is_empty()).then(|| Self::from_url(url.trim()));
        }

        let obj = v.as_object()?;
        let url = obj
            .get("url")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_owned);
        let text = ["text", "snippet", "title"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_owned)
            .or_else(|| url.clone())?;
        let domain = ["domain", "source"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str))
            .map(|d| d.trim().trim_start_matches("www.").to_lowercase())
            .filter(|d| !d.is_empty())
            .or_else(|| url.as_deref().and_then(domain_of))
            .unwrap_or_else(|| "unknown".into());

        Some(Self { text, url, domain })
    }

    /// Parse a whole wire `citations` array, dropping unusable records.
    pub fn parse_all(values: &[Value]) -> Vec<Self> {
        values.iter().filter_map(Self::from_value).collect()
    }

    /// Identity used to merge repeated records across frames.
    fn identity(&self) -> &str {
        self.url.as_deref().unwrap_or(&self.text)
    }
}

/// Host of a URL without a leading `www.`.
fn domain_of(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(host.trim_start_matches("www.").to_lowercase())
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Character offset of the first occurrence of `needle` in `haystack`.
fn char_position(haystack: &str, needle: &str) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    haystack
        .find(needle)
        .map(|byte| haystack[..byte].chars().count())
}

/// Score and anchor raw citations against the answer text.
///
/// `index` in the fallback position is the record's index in `raw`.
pub fn extract(raw: &[RawCitation], answer_text: &str) -> Vec<Citation> {
    raw.iter()
        .enumerate()
        .map(|(index, r)| Citation {
            text: r.text.clone(),
            source: r.domain.clone(),
            url: r.url.clone(),
            credibility: credibility_for(&r.domain),
            position: char_position(answer_text, &r.text)
                .unwrap_or(index * FALLBACK_POSITION_STRIDE),
        })
        .collect()
}

/// Sort citations by ascending position, keeping arrival order on ties.
pub fn sort_by_position(citations: &mut [Citation]) {
    citations.sort_by_key(|c| c.position);
}

// ---------------------------------------------------------------------------
// Running citation set
// ---------------------------------------------------------------------------

/// Citations merged across the frames of one stream.
///
/// Providers often resend the full citation list with every frame, so
/// records are merged by URL (or text when there is no URL) and kept in
/// first-seen order.
#[derive(Debug, Default, Clone)]
pub struct CitationSet {
    raw: Vec<RawCitation>,
}

impl CitationSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a batch of raw records.  Later copies replace earlier ones in
    /// place.
    pub fn merge(&mut self, incoming: Vec<RawCitation>) {
        for record in incoming {
            match self
                .raw
                .iter_mut()
                .find(|existing| existing.identity() == record.identity())
            {
                Some(existing) => *existing = record,
                None => self.raw.push(record),
            }
        }
    }

    /// Number of distinct citations seen.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Whether no citation has been seen.
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Scored citations anchored in `answer_text`, sorted by position.
    pub fn resolve(&self, answer_text: &str) -> Vec<Citation> {
        let mut citations = extract(&self.raw, answer_text);
        sort_by_position(&mut citations);
        citations
    }

    /// Drop everything (used when a stream restarts from scratch).
    pub fn clear(&mut self) {
        self.raw.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tier_scores() {
        assert_eq!(credibility_for("plato.stanford.edu"), 0.95);
        assert_eq!(credibility_for("scholar.google.com"), 0.95);
        assert_eq!(credibility_for("pubmed.ncbi.nlm.nih.gov"), 0.95);
        assert_eq!(credibility_for("www.nytimes.com"), 0.85);
        assert_eq!(credibility_for("bbc.co.uk"), 0.85);
        assert_eq!(credibility_for("en.wikipedia.org"), 0.75);
        assert_eq!(credibility_for("reddit.com"), 0.4);
        assert_eq!(credibility_for("x.com"), 0.4);
        assert_eq!(credibility_for("goodreads.com"), DEFAULT_CREDIBILITY);
    }

    #[test]
    fn tier_patterns_respect_label_boundaries() {
        assert_eq!(credibility_for("fox.com"), DEFAULT_CREDIBILITY);
        assert_eq!(credibility_for("education.com"), DEFAULT_CREDIBILITY);
        assert_eq!(credibility_for("EN.WIKIPEDIA.ORG"), 0.75);
    }

    #[test]
    fn raw_from_url_string() {
        let raw = RawCitation::from_value(&json!("https://www.britannica.com/topic/Dune")).unwrap();
        assert_eq!(raw.domain, "britannica.com");
        assert_eq!(raw.text, "https://www.britannica.com/topic/Dune");
        assert_eq!(raw.url.as_deref(), Some("https://www.britannica.com/topic/Dune"));
    }

    #[test]
    fn raw_from_object_prefers_text_then_title() {
        let raw = RawCitation::from_value(&json!({
            "title": "Dune (novel)",
            "url": "https://en.wikipedia.org/wiki/Dune_(novel)"
        }))
        .unwrap();
        assert_eq!(raw.text, "Dune (novel)");
        assert_eq!(raw.domain, "en.wikipedia.org");

        let raw = RawCitation::from_value(&json!({
            "text": "spice melange",
            "title": "ignored",
            "domain": "www.Example.org"
        }))
        .unwrap();
        assert_eq!(raw.text, "spice melange");
        assert_eq!(raw.domain, "example.org");
        assert!(raw.url.is_none());
    }

    #[test]
    fn unusable_records_are_dropped() {
        let values = vec![json!(""), json!(42), json!({"domain": "x.org"}), json!("https://a.org")];
        let parsed = RawCitation::parse_all(&values);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].domain, "a.org");
    }

    #[test]
    fn position_is_character_offset_of_first_occurrence() {
        let raw = vec![RawCitation {
            text: "spice".into(),
            url: None,
            domain: "example.org".into(),
        }];
        let citations = extract(&raw, "Café: the spice must flow. The spice.");
        assert_eq!(citations[0].position, 10);
    }

    #[test]
    fn missing_text_falls_back_to_index_stride() {
        let raw = vec![
            RawCitation::from_url("https://a.org/1"),
            RawCitation::from_url("https://b.org/2"),
            RawCitation::from_url("https://c.org/3"),
        ];
        let citations = extract(&raw, "no urls in here");
        let positions: Vec<usize> = citations.iter().map(|c| c.position).collect();
        assert_eq!(positions, vec![0, 100, 200]);
    }

    #[test]
    fn set_merges_duplicates_and_sorts() {
        let mut set = CitationSet::new();
        set.merge(vec![
            RawCitation::from_url("https://a.org/1"),
            RawCitation::from_url("https://b.org/2"),
        ]);
        set.merge(vec![
            RawCitation::from_url("https://b.org/2"),
            RawCitation {
                text: "the answer".into(),
                url: None,
                domain: "en.wikipedia.org".into(),
            },
        ]);
        assert_eq!(set.len(), 3);

        let resolved = set.resolve("Here is the answer.");
        let positions: Vec<usize> = resolved.iter().map(|c| c.position).collect();
        assert!(positions.windows(2).all(|w| w[0] <= w[1]));
        // "the answer" is found at offset 8; the two URLs fall back to 0 and 100.
        assert_eq!(positions, vec![0, 8, 100]);
        assert_eq!(resolved[1].credibility, 0.75);
    }

    #[test]
    fn clear_empties_the_set() {
        let mut set = CitationSet::new();
        set.merge(vec![RawCitation::from_url("https://a.org")]);
        set.clear();
        assert!(set.is_empty());
    }
}
