//! reqwest-backed transport
//!
//! One pooled [`Client`] per platform. A semaphore caps concurrent
//! in-flight requests at the platform's `max_connections`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, header};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use super::{HttpTransport, OutboundRequest, RequestBody, TransportResponse};
use crate::{Error, Result};

/// Pooled HTTP transport
pub struct ReqwestTransport {
    client: Client,
    permits: Arc<Semaphore>,
}

impl ReqwestTransport {
    /// Create a transport allowing `max_connections` concurrent requests
    pub fn new(max_connections: usize, timeout: Duration) -> Result<Self> {
        let max_connections = max_connections.max(1);
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(max_connections)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(concat!("platform-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            permits: Arc::new(Semaphore::new(max_connections)),
        })
    }

    /// Requests that could start right now without waiting for a permit
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::Shutdown)?;

        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(request.headers)
            .timeout(request.timeout);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        builder = match request.body {
            Some(RequestBody::Json(body)) => builder.json(&body),
            Some(RequestBody::Form(fields)) => builder.form(&fields),
            None => builder,
        };

        debug!(method = %request.method, url = %request.url, "Sending request");

        let response = builder.send().await.map_err(|e| classify(&e, request.timeout))?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, Utc::now()));

        let text = response
            .text()
            .await
            .map_err(|e| classify(&e, request.timeout))?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        debug!(status, "Received response");
        Ok(TransportResponse {
            status,
            body,
            retry_after,
        })
    }

    async fn close(&self) -> Result<()> {
        self.permits.close();
        info!("HTTP transport closed");
        Ok(())
    }
}

fn classify(error: &reqwest::Error, timeout: Duration) -> Error {
    if error.is_timeout() {
        Error::Timeout(format!("no response within {}ms", timeout.as_millis()))
    } else {
        Error::transport(error.status().map(|s| s.as_u16()), error.to_string())
    }
}

/// Parse `Retry-After` as delta-seconds or an HTTP date
fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    Some((at.with_timezone(&Utc) - now).to_std().unwrap_or_default())
}
