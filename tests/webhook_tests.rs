//! Webhook verification tests
//!
//! Signature schemes through the gateway, and the axum receiver over a real
//! loopback socket.

mod common;

use pretty_assertions::assert_eq;
use serde_json::json;

use common::ScriptedTransport;
use platform_gateway::ProtocolGateway;
use platform_gateway::config::{PlatformConfig, WebhookConfig};
use platform_gateway::webhook::{SignatureScheme, WebhookSubscription};

const SECRET: &str = "It's a Secret to Everybody";

fn gateway(webhooks: Vec<WebhookConfig>) -> ProtocolGateway {
    let config = PlatformConfig {
        base_url: "https://api.example.com".to_string(),
        webhooks,
        ..PlatformConfig::default()
    };
    ProtocolGateway::builder("crm", config)
        .transport(ScriptedTransport::new())
        .build()
        .unwrap()
}

fn hook(event_type: &str, scheme: SignatureScheme) -> WebhookConfig {
    WebhookConfig {
        event_type: event_type.to_string(),
        callback_url: "https://hooks.example.com/in".to_string(),
        secret: SECRET.to_string(),
        scheme,
    }
}

#[test]
fn sha256_prefixed_detects_tampering() {
    let gw = gateway(vec![hook("push", SignatureScheme::HmacSha256Prefixed)]);
    let payload = b"Hello, World!";
    let signature = "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17";

    assert!(gw.verify_webhook(payload, signature, "push"));
    assert!(!gw.verify_webhook(b"Hello, World?", signature, "push"));
    // Right digest, wrong framing
    assert!(!gw.verify_webhook(payload, signature.trim_start_matches("sha256="), "push"));
    // Unknown event types never verify
    assert!(!gw.verify_webhook(payload, signature, "pull"));
}

#[test]
fn sha1_hex_detects_tampering() {
    let gw = gateway(vec![hook("contact.created", SignatureScheme::HmacSha1Hex)]);
    let payload = br#"{"contact":{"id":42}}"#;
    let signature = SignatureScheme::HmacSha1Hex.sign(SECRET, payload).unwrap();

    assert_eq!(signature.len(), 40);
    assert!(gw.verify_webhook(payload, &signature, "contact.created"));

    let mut flipped = signature.into_bytes();
    flipped[0] = if flipped[0] == b'0' { b'1' } else { b'0' };
    let flipped = String::from_utf8(flipped).unwrap();
    assert!(!gw.verify_webhook(payload, &flipped, "contact.created"));
    assert!(!gw.verify_webhook(br#"{"contact":{"id":43}}"#, &flipped, "contact.created"));
}

#[test]
fn runtime_registration_replaces_and_removes() {
    let gw = gateway(Vec::new());
    let payload = b"{}";
    let sub = |secret: &str| {
        WebhookSubscription::new("deal.updated", "https://h/x", secret, SignatureScheme::HmacSha256Base64)
    };

    gw.register_webhook(sub("first")).unwrap();
    let old = SignatureScheme::HmacSha256Base64.sign("first", payload).unwrap();
    assert!(gw.verify_webhook(payload, &old, "deal.updated"));

    gw.register_webhook(sub("second")).unwrap();
    assert!(!gw.verify_webhook(payload, &old, "deal.updated"));

    assert!(gw.unregister_webhook("deal.updated"));
    let new = SignatureScheme::HmacSha256Base64.sign("second", payload).unwrap();
    assert!(!gw.verify_webhook(payload, &new, "deal.updated"));
}

#[test]
fn empty_secret_is_refused() {
    let gw = gateway(Vec::new());
    let err = gw
        .register_webhook(WebhookSubscription::new("x", "", "", SignatureScheme::default()))
        .unwrap_err();
    assert!(err.to_string().contains("webhook_secret"));
}

#[cfg(feature = "webhook-receiver")]
mod receiver {
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use pretty_assertions::assert_eq;
    use platform_gateway::webhook::receiver::{router, serve};

    #[tokio::test]
    async fn only_verified_payloads_reach_the_sink() {
        let gw = gateway(vec![hook("push", SignatureScheme::HmacSha256Prefixed)]);
        let (tx, mut rx) = mpsc::channel(8);
        let app = router(gw.platform(), gw.webhook_verifier(), gw.signature_header(), tx);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(listener, app, shutdown.clone()));

        let client = reqwest::Client::new();
        let url = format!("http://{addr}/webhooks/push");
        let body = json!({"ref": "refs/heads/main"}).to_string();
        let good = SignatureScheme::HmacSha256Prefixed
            .sign(SECRET, body.as_bytes())
            .unwrap();

        let response = client
            .post(&url)
            .header("X-Signature", &good)
            .body(body.clone())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let ack: serde_json::Value = response.json().await.unwrap();
        assert_eq!(ack["status"], "received");

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.platform, "crm");
        assert_eq!(event.event_type, "push");
        assert_eq!(event.payload["ref"], "refs/heads/main");

        let tampered = client
            .post(&url)
            .header("X-Signature", &good)
            .body(body.replace("main", "evil"))
            .send()
            .await
            .unwrap();
        assert_eq!(tampered.status(), 401);

        let unsigned = client.post(&url).body(body.clone()).send().await.unwrap();
        assert_eq!(unsigned.status(), 401);

        let not_json = "not json";
        let signed = SignatureScheme::HmacSha256Prefixed
            .sign(SECRET, not_json.as_bytes())
            .unwrap();
        let bad_json = client
            .post(&url)
            .header("X-Signature", signed)
            .body(not_json)
            .send()
            .await
            .unwrap();
        assert_eq!(bad_json.status(), 400);

        assert!(rx.try_recv().is_err());

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
