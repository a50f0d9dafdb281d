//! Streaming wire format.
//!
//! The provider answers with newline-delimited `data: <json>` lines and
//! ends with the literal `data: [DONE]`.  [`LineBuffer`] turns arbitrary
//! byte chunks into complete lines (UTF-8 is only decoded once a line is
//! whole, so multi-byte characters split across chunks survive) and
//! [`decode_line`] turns one line into a [`Frame`].

use serde_json::Value;

use crate::citations::RawCitation;
use crate::error::{Result, SearchError};

/// One decoded `data:` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Incremental content and/or citations.
    Delta {
        content: Option<String>,
        citations: Vec<RawCitation>,
    },
    /// The terminal sentinel.
    Done,
}

/// Decode one line of the stream.
///
/// Returns `Ok(None)` for blank lines, SSE comments and non-`data` fields,
/// and [`SearchError::DecodeFailure`] for payloads of the wrong shape.
pub fn decode_line(line: &str) -> Result<Option<Frame>> {
    let line = line.trim_end();
    if line.is_empty() || line.starts_with(':') {
        return Ok(None);
    }

    let Some(data) = line.strip_prefix("data:") else {
        tracing::trace!(line, "ignoring non-data SSE line");
        return Ok(None);
    };
    let data = data.trim_start();

    if data == "[DONE]" {
        return Ok(Some(Frame::Done));
    }

    let v: Value = serde_json::from_str(data).map_err(|e| decode_failure(format!("invalid JSON: {e}")))?;
    if !v.is_object() {
        return Err(decode_failure("payload is not an object".into()));
    }

    // Chat-completions style (`choices[0].delta`) or a bare `delta` object.
    let delta = match v.get("choices") {
        Some(Value::Array(choices)) => choices.first().and_then(|c| c.get("delta")),
        Some(_) => return Err(decode_failure("`choices` is not an array".into())),
        None => v.get("delta"),
    };

    let content = match delta.and_then(|d| d.get("content")) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => return Err(decode_failure("`content` is not a string".into())),
    };

    let raw_citations = v
        .get("citations")
        .or_else(|| delta.and_then(|d| d.get("citations")));
    let citations = match raw_citations {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => RawCitation::parse_all(items),
        Some(_) => return Err(decode_failure("`citations` is not an array".into())),
    };

    Ok(Some(Frame::Delta { content, citations }))
}

fn decode_failure(reason: String) -> SearchError {
    SearchError::DecodeFailure { reason }
}

// ---------------------------------------------------------------------------
// Line buffering
// ---------------------------------------------------------------------------

/// Reassembles lines from a chunked byte stream.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk as received from the network.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Take the next complete line, without its terminator.
    ///
    /// Lines that are not valid UTF-8 come back as `DecodeFailure`.
    pub fn next_line(&mut self) -> Option<Result<String>> {
        let newline = self.buf.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=newline).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(
            String::from_utf8(line)
                .map_err(|e| decode_failure(format!("invalid UTF-8 in stream: {e}"))),
        )
    }

    /// Whatever is left after the stream ends, if it is not blank.
    pub fn finish(&mut self) -> Option<Result<String>> {
        if self.buf.iter().all(u8::is_ascii_whitespace) {
            self.buf.clear();
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(
            String::from_utf8(rest)
                .map_err(|e| decode_failure(format!("invalid UTF-8 in stream: {e}"))),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
