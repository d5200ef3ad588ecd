//! Outbound HTTP transport for platform APIs

mod http;

pub use self::http::ReqwestTransport;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::Result;

/// Request body encodings
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// `application/json`
    Json(Value),
    /// `application/x-www-form-urlencoded`
    Form(Vec<(String, String)>),
}

/// A fully resolved outbound request
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// HTTP method
    pub method: Method,
    /// Absolute URL without the query string
    pub url: String,
    /// Request headers, auth included
    pub headers: HeaderMap,
    /// Query parameters
    pub query: Vec<(String, String)>,
    /// Optional body
    pub body: Option<RequestBody>,
    /// Per-request timeout
    pub timeout: Duration,
}

impl OutboundRequest {
    /// Create a bodiless request
    pub fn new(method: Method, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            query: Vec::new(),
            body: None,
            timeout,
        }
    }

    /// Attach a JSON body
    #[must_use]
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    /// Attach a form body
    #[must_use]
    pub fn form(mut self, fields: Vec<(String, String)>) -> Self {
        self.body = Some(RequestBody::Form(fields));
        self
    }

    /// First value of query parameter `key`
    #[must_use]
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Response as seen by the gateway
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    /// HTTP status code
    pub status: u16,
    /// Parsed JSON body, or the raw text as a JSON string
    pub body: Value,
    /// Parsed `Retry-After` header
    pub retry_after: Option<Duration>,
}

impl TransportResponse {
    /// Create a response without a `Retry-After` hint
    #[must_use]
    pub fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            body,
            retry_after: None,
        }
    }

    /// 2xx
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Short human-readable description for errors and logs
    #[must_use]
    pub fn summary(&self) -> String {
        let detail = match &self.body {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let mut detail: String = detail.chars().take(200).collect();
        if detail.is_empty() {
            detail = "empty body".to_string();
        }
        format!("HTTP {}: {detail}", self.status)
    }
}

/// Transport seam between the gateway and the network
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send one request. Non-2xx statuses are responses, not errors.
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse>;

    /// Stop accepting requests
    async fn close(&self) -> Result<()>;
}
