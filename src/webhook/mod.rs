//! Inbound webhook signature verification
//!
//! Each subscription names a signature scheme. The MAC is recomputed over
//! the raw payload bytes and compared in constant time with the decoded
//! signature. Anything unexpected fails closed.

#[cfg(feature = "webhook-receiver")]
pub mod receiver;

use std::collections::HashMap;
use std::fmt;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use hmac::{Hmac, KeyInit, Mac};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use crate::auth::CredentialStore;
use crate::config::WebhookConfig;
use crate::{Error, Result};

/// How a platform signs webhook payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SignatureScheme {
    /// `sha256=<hex HMAC-SHA256>`
    #[default]
    HmacSha256Prefixed,
    /// Bare hex HMAC-SHA256
    HmacSha256Hex,
    /// Bare hex HMAC-SHA1
    HmacSha1Hex,
    /// Base64 HMAC-SHA256
    HmacSha256Base64,
}

impl SignatureScheme {
    /// Compute the MAC of `payload`
    fn mac(self, secret: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
        Ok(match self {
            Self::HmacSha1Hex => {
                let mut mac = Hmac::<Sha1>::new_from_slice(secret)
                    .map_err(|e| Error::Config(format!("invalid webhook secret: {e}")))?;
                mac.update(payload);
                mac.finalize().into_bytes().to_vec()
            }
            Self::HmacSha256Prefixed | Self::HmacSha256Hex | Self::HmacSha256Base64 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(secret)
                    .map_err(|e| Error::Config(format!("invalid webhook secret: {e}")))?;
                mac.update(payload);
                mac.finalize().into_bytes().to_vec()
            }
        })
    }

    /// Decode a header value into raw MAC bytes; `None` if malformed
    fn decode(self, signature: &str) -> Option<Vec<u8>> {
        let signature = signature.trim();
        match self {
            Self::HmacSha256Prefixed => hex::decode(signature.strip_prefix("sha256=")?).ok(),
            Self::HmacSha256Hex | Self::HmacSha1Hex => hex::decode(signature).ok(),
            Self::HmacSha256Base64 => STANDARD.decode(signature).ok(),
        }
    }

    /// Encode raw MAC bytes the way the platform sends them
    fn encode(self, mac: &[u8]) -> String {
        match self {
            Self::HmacSha256Prefixed => format!("sha256={}", hex::encode(mac)),
            Self::HmacSha256Hex | Self::HmacSha1Hex => hex::encode(mac),
            Self::HmacSha256Base64 => STANDARD.encode(mac),
        }
    }

    /// Sign `payload`, producing the header value a platform would send
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the secret cannot key the MAC.
    pub fn sign(self, secret: &str, payload: &[u8]) -> Result<String> {
        Ok(self.encode(&self.mac(secret.as_bytes(), payload)?))
    }
}

impl fmt::Display for SignatureScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::HmacSha256Prefixed => "hmac_sha256_prefixed",
            Self::HmacSha256Hex => "hmac_sha256_hex",
            Self::HmacSha1Hex => "hmac_sha1_hex",
            Self::HmacSha256Base64 => "hmac_sha256_base64",
        })
    }
}

/// One registered webhook
#[derive(Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    /// Event type
    pub event_type: String,
    /// Callback URL registered with the platform
    pub callback_url: String,
    /// Shared secret (literal, `env:VAR` or `{env.VAR}`)
    pub secret: String,
    /// Signature scheme
    pub scheme: SignatureScheme,
}

impl WebhookSubscription {
    /// Create a subscription
    pub fn new(
        event_type: impl Into<String>,
        callback_url: impl Into<String>,
        secret: impl Into<String>,
        scheme: SignatureScheme,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            callback_url: callback_url.into(),
            secret: secret.into(),
            scheme,
        }
    }
}

impl From<&WebhookConfig> for WebhookSubscription {
    fn from(config: &WebhookConfig) -> Self {
        Self::new(
            config.event_type.clone(),
            config.callback_url.clone(),
            config.secret.clone(),
            config.scheme,
        )
    }
}

impl fmt::Debug for WebhookSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookSubscription")
            .field("event_type", &self.event_type)
            .field("callback_url", &self.callback_url)
            .field("scheme", &self.scheme)
            .finish_non_exhaustive()
    }
}

/// Verifies payload signatures for one platform
pub struct WebhookVerifier {
    subscriptions: RwLock<HashMap<String, WebhookSubscription>>,
    secrets: CredentialStore,
}

impl WebhookVerifier {
    /// Create a verifier with no subscriptions
    #[must_use]
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            secrets: CredentialStore::new(platform),
        }
    }

    /// Register a subscription, replacing any previous one for the event type
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an empty event type, or
    /// [`Error::Authentication`] if the secret cannot be resolved.
    pub fn register(&self, subscription: WebhookSubscription) -> Result<()> {
        if subscription.event_type.trim().is_empty() {
            return Err(Error::Config("webhook event type is empty".to_string()));
        }
        self.secrets.require("webhook_secret", &subscription.secret)?;

        info!(
            platform = %self.secrets.platform(),
            event_type = %subscription.event_type,
            scheme = %subscription.scheme,
            "Registered webhook"
        );
        self.subscriptions
            .write()
            .insert(subscription.event_type.clone(), subscription);
        Ok(())
    }

    /// Remove a subscription; returns whether one existed
    pub fn unregister(&self, event_type: &str) -> bool {
        self.subscriptions.write().remove(event_type).is_some()
    }

    /// Registered subscription for `event_type`
    #[must_use]
    pub fn subscription(&self, event_type: &str) -> Option<WebhookSubscription> {
        self.subscriptions.read().get(event_type).cloned()
    }

    /// Registered event types, sorted
    #[must_use]
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.subscriptions.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Whether `signature` is valid for `payload` under `event_type`'s subscription
    #[must_use]
    pub fn verify(&self, payload: &[u8], signature: &str, event_type: &str) -> bool {
        self.verify_or_reject(payload, signature, event_type).is_ok()
    }

    /// Like [`verify`](Self::verify) but says why
    ///
    /// # Errors
    ///
    /// Returns [`Error::WebhookVerification`] on any failure.
    pub fn verify_or_reject(&self, payload: &[u8], signature: &str, event_type: &str) -> Result<()> {
        let reject = |reason: &str| {
            warn!(
                platform = %self.secrets.platform(),
                event_type,
                reason,
                "Webhook rejected"
            );
            Err(Error::WebhookVerification(format!("{event_type}: {reason}")))
        };

        let Some(subscription) = self.subscription(event_type) else {
            return reject("no subscription for event type");
        };
        let Ok(secret) = self.secrets.require("webhook_secret", &subscription.secret) else {
            return reject("secret unavailable");
        };
        let Some(supplied) = subscription.scheme.decode(signature) else {
            return reject("malformed signature");
        };
        let Ok(expected) = subscription.scheme.mac(secret.as_bytes(), payload) else {
            return reject("secret cannot key the MAC");
        };

        // Slices of different length compare unequal
        if bool::from(expected.ct_eq(&supplied)) {
            debug!(event_type, payload_len = payload.len(), "Webhook signature verified");
            Ok(())
        } else {
            reject("signature mismatch")
        }
    }
}

impl fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("platform", &self.secrets.platform())
            .field("event_types", &self.event_types())
            .finish()
    }
}
