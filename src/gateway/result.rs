//! Values crossing the tool-invocation boundary

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::HeaderMap;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::GatewayState;
use crate::error::{Error, ErrorKind};
use crate::failsafe::{RateLimitInfo, WindowSnapshot};

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Abandon the call when cancelled
    pub cancel: Option<CancellationToken>,
    /// Overrides the platform timeout for each attempt
    pub timeout: Option<Duration>,
    /// Extra request headers
    pub headers: HeaderMap,
}

impl CallContext {
    /// Empty context
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a cancellation token
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Override the per-attempt timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Add extra headers
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// Structured outcome of `execute_tool`
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    /// Call succeeded
    pub success: bool,
    /// Response body on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error message on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error classification on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Budget state after the call, when a budget was consulted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_info: Option<RateLimitInfo>,
    /// Wall time in seconds
    pub execution_time: f64,
}

impl ToolResult {
    /// Successful result
    #[must_use]
    pub fn ok(data: Value, rate_limit_info: Option<RateLimitInfo>, elapsed: Duration) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_kind: None,
            rate_limit_info,
            execution_time: elapsed.as_secs_f64(),
        }
    }

    /// Failed result
    #[must_use]
    pub fn failed(error: &Error, rate_limit_info: Option<RateLimitInfo>, elapsed: Duration) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            rate_limit_info,
            execution_time: elapsed.as_secs_f64(),
        }
    }
}

/// Telemetry for one gateway
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    /// Platform name
    pub platform: String,
    /// Lifecycle state
    pub state: GatewayState,
    /// Calls in the ledger window
    pub total_calls: usize,
    /// Successful share in [0, 1]
    pub success_rate: f64,
    /// Mean response time in seconds
    pub avg_response_time: f64,
    /// Calls denied by a budget
    pub rate_limited_count: usize,
    /// Transport windows by category
    pub rate_limits: BTreeMap<String, WindowSnapshot>,
    /// Quota windows by tool
    pub quotas: BTreeMap<String, WindowSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn rate_limited_result_shape() {
        let reset_at = Utc::now();
        let info = RateLimitInfo {
            allowed: false,
            remaining: 0,
            reset_at: Some(reset_at),
            retry_after: Some(Duration::from_secs(42)),
        };
        let error = Error::RateLimited {
            scope: "posts".into(),
            remaining: 0,
            reset_at,
            retry_after: Duration::from_secs(42),
        };
        let value = serde_json::to_value(ToolResult::failed(&error, Some(info), Duration::ZERO)).unwrap();

        assert_eq!(value["success"], json!(false));
        assert_eq!(value["error"], json!("rate limited"));
        assert_eq!(value["error_kind"], json!("rate_limit_exceeded"));
        assert_eq!(value["rate_limit_info"]["allowed"], json!(false));
        assert_eq!(value["rate_limit_info"]["remaining"], json!(0));
        assert_eq!(value["rate_limit_info"]["retry_after"], json!(42.0));
        assert!(value.get("data").is_none());
    }

    #[test]
    fn ok_result_omits_error_fields() {
        let value = serde_json::to_value(ToolResult::ok(json!({"id": 1}), None, Duration::from_millis(1500))).unwrap();
        assert_eq!(value["success"], json!(true));
        assert_eq!(value["execution_time"], json!(1.5));
        assert!(value.get("error").is_none());
        assert!(value.get("rate_limit_info").is_none());
    }
}
