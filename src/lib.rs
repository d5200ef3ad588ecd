//! Platform Gateway Library
//!
//! Protocol gateway in front of external social and CRM APIs.
//!
//! # Features
//!
//! - **Auth strategies**: OAuth2 (authorization code, PKCE, single-flight refresh),
//!   API key, Bearer, Basic and custom headers
//! - **Two-tier rate limiting**: short transport windows per category plus
//!   long per-tool quotas, checked and consumed atomically
//! - **Retries**: exponential backoff honoring `Retry-After`, cancellable
//! - **Tool registry**: declarative tool definitions with argument validation
//! - **Webhooks**: HMAC signature verification and an optional axum receiver
//! - **Telemetry**: bounded call ledger with windowed stats

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod gateway;
pub mod ledger;
pub mod tools;
pub mod transport;
pub mod webhook;

pub use error::{Error, ErrorKind, Result};
pub use gateway::{CallContext, GatewayState, GatewayStats, Gateways, ProtocolGateway, ToolResult};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// # Errors
///
/// Returns [`Error::Internal`] if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    // Logs go to stderr; stdout carries command output
    match format {
        Some("json") => subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        _ => subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    }
    .map_err(|e| Error::Internal(format!("tracing already initialized: {e}")))
}
