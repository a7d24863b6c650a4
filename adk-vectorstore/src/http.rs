//! JSON-over-HTTP transport shared by the remote backends.
//!
//! Transport failures (connection refused, timeouts, undecodable bodies) are
//! normalized here into [`StoreError::VectorStore`]. HTTP error statuses are
//! returned to the caller as an [`HttpReply`] because only the backend knows
//! whether a 404 means "collection missing" or "document missing".

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing::{debug, error};

use crate::error::{Result, StoreError};

/// A decoded HTTP response.
#[derive(Debug, Clone)]
pub(crate) struct HttpReply {
    pub status: StatusCode,
    pub body: Value,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_not_found(&self) -> bool {
        self.status == StatusCode::NOT_FOUND
    }

    /// Best-effort human-readable error from the body.
    pub fn error_message(&self) -> String {
        let detail = match &self.body {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Object(map) => ["message", "error", "detail", "reason"]
                .iter()
                .find_map(|k| map.get(*k))
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    Value::Object(inner) => inner
                        .get("reason")
                        .or_else(|| inner.get("message"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| v.to_string()),
                    other => other.to_string(),
                }),
            _ => None,
        };
        match detail {
            Some(d) => format!("HTTP {}: {d}", self.status.as_u16()),
            None => format!("HTTP {}", self.status.as_u16()),
        }
    }
}

/// A `reqwest` client bound to one base URL and a set of default headers.
#[derive(Debug, Clone)]
pub(crate) struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    backend: &'static str,
    basic_auth: Option<(String, Option<String>)>,
}

impl HttpTransport {
    pub fn new(
        backend: &'static str,
        base_url: &str,
        headers: &[(&str, String)],
        timeout: Duration,
    ) -> Result<Self> {
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                StoreError::Config(format!("{backend}: invalid header name '{name}': {e}"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                StoreError::Config(format!("{backend}: invalid value for header '{name}': {e}"))
            })?;
            header_map.insert(name, value);
        }
        let client = reqwest::Client::builder()
            .default_headers(header_map)
            .timeout(timeout)
            .build()
            .map_err(|e| {
                StoreError::Config(format!("{backend}: failed to build HTTP client: {e}"))
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            backend,
            basic_auth: None,
        })
    }

    /// Send HTTP basic credentials with every request.
    pub fn with_basic_auth(mut self, username: String, password: Option<String>) -> Self {
        self.basic_auth = Some((username, password));
        self
    }

    /// Send a request. `path` is appended to the base URL unless it is
    /// already absolute.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<HttpReply> {
        let url = self.url_for(path);
        let mut request = self.client.request(method.clone(), &url);
        if let Some(body) = body {
            request = request.json(body);
        }
        self.execute(method, url, request).await
    }

    /// POST newline-delimited JSON, one line per value.
    pub async fn post_ndjson(&self, path: &str, lines: &[Value]) -> Result<HttpReply> {
        let url = self.url_for(path);
        let mut payload = String::new();
        for line in lines {
            payload.push_str(&line.to_string());
            payload.push('\n');
        }
        let request = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(payload);
        self.execute(Method::POST, url, request).await
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{path}", self.base_url)
        }
    }

    async fn execute(
        &self,
        method: Method,
        url: String,
        mut request: reqwest::RequestBuilder,
    ) -> Result<HttpReply> {
        debug!(backend = self.backend, %method, %url, "sending request");
        if let Some((username, password)) = &self.basic_auth {
            request = request.basic_auth(username, password.as_ref());
        }
        let response = request.send().await.map_err(|e| {
            error!(backend = self.backend, %method, %url, error = %e, "request failed");
            let message = if e.is_timeout() {
                format!("{method} {url} timed out")
            } else {
                format!("{method} {url} failed")
            };
            StoreError::store(self.backend, message).with_source(e)
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            StoreError::store(self.backend, format!("failed to read response from {url}"))
                .with_source(e)
        })?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok(HttpReply { status, body })
    }

    pub async fn get(&self, path: &str) -> Result<HttpReply> {
        self.send(Method::GET, path, None).await
    }

    pub async fn head(&self, path: &str) -> Result<HttpReply> {
        self.send(Method::HEAD, path, None).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<HttpReply> {
        self.send(Method::POST, path, Some(body)).await
    }

    pub async fn put(&self, path: &str, body: &Value) -> Result<HttpReply> {
        self.send(Method::PUT, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<HttpReply> {
        self.send(Method::DELETE, path, None).await
    }
}

/// Percent-encode a single URL path segment.
pub(crate) fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for b in segment.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn error_message_prefers_reason() {
        let reply = HttpReply {
            status: StatusCode::BAD_REQUEST,
            body: json!({ "error": { "type": "x", "reason": "bad mapping" } }),
        };
        assert_eq!(reply.error_message(), "HTTP 400: bad mapping");
    }

    #[test]
    fn segments_are_encoded() {
        assert_eq!(encode_segment("a b/c"), "a%20b%2Fc");
        assert_eq!(encode_segment("chunk-1_x.y"), "chunk-1_x.y");
    }
}
