//! Request construction for the chat-completions endpoint.

use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Value, json};
use url::Url;

use crate::error::{Result, SearchError};
use crate::types::Query;

/// Instruction sent with every query.
const BASE_PROMPT: &str = "You are a careful reading companion. Answer the reader's question \
    concisely and accurately, citing your sources.";

/// Fixed parts of every request: endpoint, headers and sampling settings.
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    endpoint: Url,
    headers: HeaderMap,
    temperature: f64,
    max_tokens: u32,
}

impl RequestTemplate {
    /// Build a template for `{base_url}/chat/completions`.
    pub fn new(base_url: &str, api_key: &str, temperature: f64, max_tokens: u32) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(SearchError::MissingApiKey);
        }

        Ok(Self {
            endpoint: completions_url(base_url)?,
            headers: headers(api_key)?,
            temperature,
            max_tokens,
        })
    }

    /// Where requests are sent.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Headers attached to every request.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// JSON body for `query` answered by `model`.
    pub fn body(&self, query: &Query, model: &str) -> Value {
        json!({
            "model": model,
            "messages": [
                { "role": "system", "content": system_prompt(query.context.as_deref()) },
                { "role": "user", "content": query.text },
            ],
            "stream": true,
            "return_citations": true,
            "return_images": false,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        })
    }
}

/// System prompt, mentioning the context label when there is one.
pub fn system_prompt(context: Option<&str>) -> String {
    match context.map(str::trim).filter(|c| !c.is_empty()) {
        Some(label) => format!("{BASE_PROMPT} The reader is currently reading {label}."),
        None => BASE_PROMPT.to_owned(),
    }
}

/// Resolve the completions endpoint under `base_url`.
pub fn completions_url(base_url: &str) -> Result<Url> {
    let invalid = |reason: String| SearchError::InvalidUrl {
        url: base_url.to_owned(),
        reason,
    };

    let base = Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
    if !matches!(base.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme `{}`", base.scheme())));
    }
    if base.cannot_be_a_base() {
        return Err(invalid("url cannot be a base".into()));
    }

    let joined = format!("{}/chat/completions", base.as_str().trim_end_matches('/'));
    Url::parse(&joined).map_err(|e| invalid(e.to_string()))
}

fn headers(api_key: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    let auth_value = format!("Bearer {}", api_key.trim());
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&auth_value).map_err(|e| SearchError::Config {
            reason: format!("invalid authorization header: {e}"),
        })?,
    );
    headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(headers)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
