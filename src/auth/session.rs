//! OAuth2 session state

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Tokens are treated as expired this long before their real expiry
pub const EXPIRY_SKEW_SECS: i64 = 60;

/// Token endpoint response (RFC 6749 section 5.1)
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    /// Access token
    pub access_token: String,
    /// Token type
    pub token_type: Option<String>,
    /// Lifetime in seconds
    pub expires_in: Option<u64>,
    /// Refresh token
    pub refresh_token: Option<String>,
    /// Granted scope
    pub scope: Option<String>,
}

/// Live authentication session
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthSession {
    /// Access token
    pub access_token: Option<String>,
    /// Token type (usually "Bearer")
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Refresh token
    pub refresh_token: Option<String>,
    /// Expiry; `None` means the token does not expire
    pub expires_at: Option<DateTime<Utc>>,
    /// Granted scope
    pub scope: Option<String>,
    /// Set after an upstream 401 so the next call refreshes
    #[serde(skip)]
    pub stale: bool,
    /// PKCE verifier for the pending authorization
    #[serde(skip)]
    pub pkce_verifier: Option<String>,
    /// `state` nonce for the pending authorization
    #[serde(skip)]
    pub pending_state: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl Default for AuthSession {
    fn default() -> Self {
        Self {
            access_token: None,
            token_type: default_token_type(),
            refresh_token: None,
            expires_at: None,
            scope: None,
            stale: false,
            pkce_verifier: None,
            pending_state: None,
        }
    }
}

impl AuthSession {
    /// Session seeded from pre-provisioned tokens
    #[must_use]
    pub fn seeded(access_token: Option<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token,
            refresh_token,
            ..Self::default()
        }
    }

    /// Replace tokens from a token response issued at `now`.
    ///
    /// The previous refresh token is kept when the response omits one.
    pub fn apply(&mut self, response: TokenResponse, now: DateTime<Utc>) {
        self.access_token = Some(response.access_token);
        self.token_type = match response.token_type {
            Some(t) if !t.eq_ignore_ascii_case("bearer") => t,
            _ => default_token_type(),
        };
        if response.refresh_token.is_some() {
            self.refresh_token = response.refresh_token;
        }
        self.expires_at = response.expires_in.and_then(|secs| {
            let secs = i64::try_from(secs).ok()?;
            now.checked_add_signed(TimeDelta::try_seconds(secs)?)
        });
        if response.scope.is_some() {
            self.scope = response.scope;
        }
        self.stale = false;
        self.pkce_verifier = None;
        self.pending_state = None;
    }

    /// Usable access token at `now`
    #[must_use]
    pub fn valid_token(&self, now: DateTime<Utc>) -> Option<&str> {
        if self.stale || self.is_expired(now) {
            return None;
        }
        self.access_token.as_deref()
    }

    /// Expired, or within the skew of expiring
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now + TimeDelta::seconds(EXPIRY_SKEW_SECS) >= at)
    }

    /// Time until expiration
    #[must_use]
    pub fn time_until_expiry(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at.and_then(|at| (at - now).to_std().ok())
    }

    /// Authorization header value
    #[must_use]
    pub fn header_value(&self, now: DateTime<Utc>) -> Option<String> {
        self.valid_token(now)
            .map(|token| format!("{} {token}", self.token_type))
    }

    /// Forget everything
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("has_access_token", &self.access_token.is_some())
            .field("token_type", &self.token_type)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .field("stale", &self.stale)
            .field("pending_authorization", &self.pending_state.is_some())
            .finish()
    }
}
