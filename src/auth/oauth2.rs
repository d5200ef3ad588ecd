//! OAuth 2.0 authorization code flow with PKCE and refresh
//!
//! Refresh is single-flighted: the first task that finds the token expired
//! takes `refresh_lock` and performs the grant, the others wait on the lock
//! and then reuse the token it obtained.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};
use reqwest::Method;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use super::session::{AuthSession, TokenResponse};
use super::{AuthStrategy, CredentialStore, sensitive_header};
use crate::clock::Clock;
use crate::config::{ClientAuthMethod, OAuth2Settings};
use crate::transport::{HttpTransport, OutboundRequest};
use crate::{Error, Result};

/// OAuth 2.0 strategy for one platform
pub struct OAuth2Strategy {
    settings: OAuth2Settings,
    credentials: Arc<CredentialStore>,
    transport: Arc<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    refresh_lock: Mutex<()>,
    grants: AtomicU64,
}

impl OAuth2Strategy {
    /// Create the strategy, seeding the session from pre-provisioned tokens
    #[must_use]
    pub fn new(
        settings: OAuth2Settings,
        credentials: Arc<CredentialStore>,
        transport: Arc<dyn HttpTransport>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        let seed = |value: &Option<String>| {
            value
                .as_deref()
                .and_then(|v| credentials.resolve(v).ok())
                .filter(|v| !v.trim().is_empty())
        };
        let session = AuthSession::seeded(seed(&settings.access_token), seed(&settings.refresh_token));
        credentials.update_session(|s| *s = session);

        Self {
            settings,
            credentials,
            transport,
            clock,
            timeout,
            refresh_lock: Mutex::new(()),
            grants: AtomicU64::new(0),
        }
    }

    /// Token grants performed (code exchanges and refreshes)
    #[must_use]
    pub fn grant_count(&self) -> u64 {
        self.grants.load(Ordering::Relaxed)
    }

    /// Credential store backing this strategy
    #[must_use]
    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    fn platform(&self) -> &str {
        self.credentials.platform()
    }

    fn client_id(&self) -> Result<String> {
        self.credentials.require("client_id", &self.settings.client_id)
    }

    /// Refresh unless another task already did while we waited.
    ///
    /// `force` refreshes even a valid token, but still reuses a token that
    /// changed while this task waited for the lock.
    async fn refresh_single_flight(&self, force: bool) -> Result<bool> {
        let observed = self.credentials.with_session(|s| s.access_token.clone());
        let _guard = self.refresh_lock.lock().await;

        let now = self.clock.now();
        let reusable = self.credentials.with_session(|s| {
            s.valid_token(now).is_some() && (!force || s.access_token != observed)
        });
        if reusable {
            debug!(platform = %self.platform(), "Reusing token refreshed by another task");
            return Ok(true);
        }

        let Some(refresh_token) = self.credentials.with_session(|s| s.refresh_token.clone()) else {
            return Err(Error::Authentication(format!(
                "{}: no refresh token; authorization required",
                self.platform()
            )));
        };

        let form = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token),
        ];
        match self.grant(form).await {
            Ok(response) => {
                let now = self.clock.now();
                self.credentials.update_session(|s| s.apply(response, now));
                info!(platform = %self.platform(), "Access token refreshed");
                Ok(true)
            }
            Err(e @ Error::Authentication(_)) => {
                // Refresh token rejected: only a fresh authorization can recover
                warn!(platform = %self.platform(), error = %e, "Refresh rejected, clearing session");
                self.credentials.update_session(AuthSession::clear);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// POST a grant to the token endpoint.
    ///
    /// A 4xx answer is [`Error::Authentication`]; other failures are transport errors.
    async fn grant(&self, mut form: Vec<(String, String)>) -> Result<TokenResponse> {
        let client_id = self.client_id()?;
        let mut request = OutboundRequest::new(Method::POST, self.settings.token_url.clone(), self.timeout);
        request
            .headers
            .insert(ACCEPT, HeaderValue::from_static("application/json"));

        match self.settings.client_auth {
            ClientAuthMethod::ClientSecretBasic => {
                let secret = self.client_secret()?;
                let encoded = STANDARD.encode(format!("{client_id}:{secret}"));
                let (name, value) = sensitive_header(AUTHORIZATION.as_str(), &format!("Basic {encoded}"))?;
                request.headers.insert(name, value);
            }
            ClientAuthMethod::ClientSecretPost => {
                let secret = self.client_secret()?;
                form.push(("client_id".to_string(), client_id));
                form.push(("client_secret".to_string(), secret));
            }
            ClientAuthMethod::None => {
                form.push(("client_id".to_string(), client_id));
            }
        }

        self.grants.fetch_add(1, Ordering::Relaxed);
        let response = self.transport.send(request.form(form)).await?;
        if (400..500).contains(&response.status) {
            return Err(Error::Authentication(format!(
                "{}: token endpoint rejected grant: {}",
                self.platform(),
                response.summary()
            )));
        }
        if !response.is_success() {
            return Err(Error::transport(Some(response.status), response.summary()));
        }

        serde_json::from_value(response.body).map_err(|e| {
            Error::Authentication(format!("{}: malformed token response: {e}", self.platform()))
        })
    }

    fn client_secret(&self) -> Result<String> {
        let secret = self.settings.client_secret.as_deref().unwrap_or_default();
        self.credentials.require("client_secret", secret)
    }
}

#[async_trait]
impl AuthStrategy for OAuth2Strategy {
    fn auth_type(&self) -> &'static str {
        "oauth2"
    }

    async fn ensure_authenticated(&self) -> Result<bool> {
        let now = self.clock.now();
        if self.credentials.is_valid(now) {
            return Ok(true);
        }

        let has_refresh = self.credentials.with_session(|s| s.refresh_token.is_some());
        if has_refresh {
            return self.refresh_single_flight(false).await;
        }

        // An authorization already in flight keeps its state and verifier
        let pending = self.credentials.with_session(|s| s.pending_state.is_some());
        if pending {
            info!(platform = %self.platform(), "Authorization pending; waiting for code exchange");
            return Ok(false);
        }

        let url = self.build_authorization_url()?;
        info!(platform = %self.platform(), url = %url, "Authorization required");
        Ok(false)
    }

    fn auth_headers(&self) -> Result<HeaderMap> {
        let Some(value) = self.credentials.authorization(self.clock.now()) else {
            return Err(Error::Authentication(format!(
                "{}: no valid access token",
                self.platform()
            )));
        };
        let (name, value) = sensitive_header(AUTHORIZATION.as_str(), &value)?;
        let mut headers = HeaderMap::new();
        headers.insert(name, value);
        Ok(headers)
    }

    fn build_authorization_url(&self) -> Result<String> {
        let mut url = Url::parse(&self.settings.authorize_url)
            .map_err(|e| Error::Config(format!("invalid authorize_url: {e}")))?;
        let state = generate_state();
        let pkce = self.settings.pkce.then(generate_pkce);

        {
            let mut params = url.query_pairs_mut();
            params.append_pair("response_type", "code");
            params.append_pair("client_id", &self.client_id()?);
            params.append_pair("redirect_uri", &self.settings.redirect_uri);
            params.append_pair("state", &state);
            if !self.settings.scopes.is_empty() {
                params.append_pair("scope", &self.settings.scopes.join(&self.settings.scope_separator));
            }
            if let Some((_, challenge)) = &pkce {
                params.append_pair("code_challenge", challenge);
                params.append_pair("code_challenge_method", "S256");
            }
            for (key, value) in &self.settings.extra_authorize_params {
                params.append_pair(key, value);
            }
        }

        self.credentials.update_session(|s| {
            s.pending_state = Some(state);
            s.pkce_verifier = pkce.map(|(verifier, _)| verifier);
        });
        Ok(url.to_string())
    }

    async fn exchange_code(&self, code: &str, state: Option<&str>) -> Result<bool> {
        let _guard = self.refresh_lock.lock().await;

        let (pending, verifier) = self
            .credentials
            .with_session(|s| (s.pending_state.clone(), s.pkce_verifier.clone()));
        if let Some(given) = state {
            let matches = pending
                .as_deref()
                .is_some_and(|expected| bool::from(expected.as_bytes().ct_eq(given.as_bytes())));
            if !matches {
                return Err(Error::Authentication(format!(
                    "{}: state mismatch in authorization callback",
                    self.platform()
                )));
            }
        }

        let mut form = vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("code".to_string(), code.to_string()),
            ("redirect_uri".to_string(), self.settings.redirect_uri.clone()),
        ];
        if let Some(verifier) = verifier {
            form.push(("code_verifier".to_string(), verifier));
        }

        let response = self.grant(form).await?;
        let now = self.clock.now();
        self.credentials.update_session(|s| s.apply(response, now));
        info!(platform = %self.platform(), "Authorization code exchanged");
        Ok(true)
    }

    async fn refresh(&self) -> Result<bool> {
        self.refresh_single_flight(true).await
    }

    fn logout(&self) {
        self.credentials.clear();
        info!(platform = %self.platform(), "Logged out");
    }

    fn invalidate(&self) {
        self.credentials.update_session(|s| s.stale = true);
        debug!(platform = %self.platform(), "Access token marked stale");
    }
}

/// PKCE code verifier and S256 challenge
fn generate_pkce() -> (String, String) {
    let verifier_bytes: [u8; 32] = rand::random();
    let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);

    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    let challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());

    (verifier, challenge)
}

/// Random `state` nonce
fn generate_state() -> String {
    let state_bytes: [u8; 16] = rand::random();
    URL_SAFE_NO_PAD.encode(state_bytes)
}
