//! HTTP receiver for inbound webhooks
//!
//! `POST /webhooks/{event_type}` with the raw JSON body and a signature
//! header. The signature is checked against the raw bytes before the body
//! is parsed; only verified payloads reach the sink.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::WebhookVerifier;
use crate::{Error, Result};

/// A payload whose signature verified
#[derive(Debug, Clone, Serialize)]
pub struct VerifiedEvent {
    /// Receipt id
    pub id: String,
    /// Platform name
    pub platform: String,
    /// Event type from the path
    pub event_type: String,
    /// Parsed body
    pub payload: Value,
    /// Receipt time
    pub received_at: DateTime<Utc>,
}

#[derive(Clone)]
struct ReceiverState {
    platform: Arc<str>,
    verifier: Arc<WebhookVerifier>,
    signature_header: Arc<str>,
    sink: mpsc::Sender<VerifiedEvent>,
}

/// Build the receiver router for one platform
pub fn router(
    platform: &str,
    verifier: Arc<WebhookVerifier>,
    signature_header: &str,
    sink: mpsc::Sender<VerifiedEvent>,
) -> Router {
    let state = ReceiverState {
        platform: platform.into(),
        verifier,
        signature_header: signature_header.into(),
        sink,
    };
    Router::new()
        .route("/webhooks/{event_type}", post(receive))
        .with_state(state)
}

/// Serve `app` on `listener` until `shutdown` is cancelled
///
/// # Errors
///
/// Returns [`Error::Io`] if the server fails.
pub async fn serve(listener: TcpListener, app: Router, shutdown: CancellationToken) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, "Webhook receiver listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(Error::Io)
}

async fn receive(
    State(state): State<ReceiverState>,
    Path(event_type): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let request_id = uuid::Uuid::new_v4().to_string();
    debug!(
        request_id = %request_id,
        platform = %state.platform,
        event_type = %event_type,
        body_len = body.len(),
        "Received webhook"
    );

    let signature = headers
        .get(&*state.signature_header)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if let Err(e) = state.verifier.verify_or_reject(&body, signature, &event_type) {
        warn!(request_id = %request_id, error = %e, "Webhook signature validation failed");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Invalid signature", "request_id": request_id })),
        );
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("Invalid JSON: {e}"), "request_id": request_id })),
            );
        }
    };

    let event = VerifiedEvent {
        id: request_id.clone(),
        platform: state.platform.to_string(),
        event_type,
        payload,
        received_at: Utc::now(),
    };
    if state.sink.send(event).await.is_err() {
        warn!(request_id = %request_id, "Webhook sink closed");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "Receiver shutting down", "request_id": request_id })),
        );
    }

    (
        StatusCode::OK,
        Json(json!({ "status": "received", "request_id": request_id })),
    )
}
