//! Error types for the platform gateway

use std::io;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for the platform gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Platform gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tool not registered on this gateway
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// Arguments failed schema checks
    #[error("Validation failed for '{tool}': {}", violations.join("; "))]
    Validation {
        /// Tool name
        tool: String,
        /// Every violation found
        violations: Vec<String>,
    },

    /// Credentials missing or rejected
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// A transport window or quota denied the call
    #[error("rate limited")]
    RateLimited {
        /// Window that denied the call (category or `quota:<tool>`)
        scope: String,
        /// Remaining budget in the denying window
        remaining: u32,
        /// When the denying window resets
        reset_at: DateTime<Utc>,
        /// Time until reset
        retry_after: Duration,
    },

    /// Outbound call timed out
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// Network failure or non-retryable / exhausted HTTP failure
    #[error("Transport error{}: {detail}", status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Transport {
        /// Last observed HTTP status, if any response arrived
        status: Option<u16>,
        /// Detail from the last attempt
        detail: String,
    },

    /// Webhook signature did not verify
    #[error("Webhook verification failed: {0}")]
    WebhookVerification(String),

    /// Caller abandoned the call
    #[error("Call cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Gateway has been closed
    #[error("Gateway closed")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a transport error
    pub fn transport(status: Option<u16>, detail: impl Into<String>) -> Self {
        Self::Transport {
            status,
            detail: detail.into(),
        }
    }

    /// Stable classification used at the tool-invocation boundary
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::ValidationError,
            Self::UnknownTool(_) => ErrorKind::UnknownTool,
            Self::Authentication(_) => ErrorKind::AuthenticationError,
            Self::RateLimited { .. } => ErrorKind::RateLimitExceeded,
            Self::Timeout(_) | Self::Transport { .. } | Self::Http(_) | Self::Io(_) => {
                ErrorKind::TransportError
            }
            Self::WebhookVerification(_) => ErrorKind::WebhookVerificationFailed,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Config(_) => ErrorKind::ConfigError,
            Self::Json(_) | Self::Shutdown | Self::Internal(_) => ErrorKind::InternalError,
        }
    }

    /// Whether a retry of the same request may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Io(_) => true,
            // No response at all means the connection itself failed
            Self::Transport { status: None, .. } => true,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

/// Error classification returned to calling agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Arguments failed schema checks
    ValidationError,
    /// Tool not registered
    UnknownTool,
    /// Credentials missing or rejected
    AuthenticationError,
    /// Budget exhausted
    RateLimitExceeded,
    /// Network or HTTP failure
    TransportError,
    /// Webhook signature mismatch
    WebhookVerificationFailed,
    /// Caller cancelled
    Cancelled,
    /// Bad configuration
    ConfigError,
    /// Anything else
    InternalError,
}
