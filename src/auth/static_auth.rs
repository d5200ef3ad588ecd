//! Static credential strategies: API key, Bearer, Basic, Custom

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use reqwest::header::{AUTHORIZATION, HeaderMap};

use super::{AuthStrategy, CredentialStore, sensitive_header};
use crate::config::ApiKeySettings;
use crate::{Error, Result};

/// Platform without authentication
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuth;

#[async_trait]
impl AuthStrategy for NoAuth {
    fn auth_type(&self) -> &'static str {
        "none"
    }

    async fn ensure_authenticated(&self) -> Result<bool> {
        Ok(true)
    }

    fn auth_headers(&self) -> Result<HeaderMap> {
        Ok(HeaderMap::new())
    }
}

/// API key in a header (with optional prefix) or a query parameter
pub struct ApiKeyStrategy {
    settings: ApiKeySettings,
    credentials: Arc<CredentialStore>,
}

impl ApiKeyStrategy {
    /// Create the strategy
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the header name is invalid.
    pub fn new(settings: ApiKeySettings, credentials: Arc<CredentialStore>) -> Result<Self> {
        if settings.query_param.is_none() {
            reqwest::header::HeaderName::from_bytes(settings.header.as_bytes())
                .map_err(|e| Error::Config(format!("invalid API key header '{}': {e}", settings.header)))?;
        }
        Ok(Self {
            settings,
            credentials,
        })
    }

    fn key(&self) -> Result<String> {
        self.credentials.require("api_key", &self.settings.key)
    }
}

#[async_trait]
impl AuthStrategy for ApiKeyStrategy {
    fn auth_type(&self) -> &'static str {
        "api_key"
    }

    async fn ensure_authenticated(&self) -> Result<bool> {
        self.key().map(|_| true)
    }

    fn auth_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if self.settings.query_param.is_some() {
            return Ok(headers);
        }
        let key = self.key()?;
        let value = match &self.settings.prefix {
            Some(prefix) => format!("{prefix} {key}"),
            None => key,
        };
        let (name, value) = sensitive_header(&self.settings.header, &value)?;
        headers.insert(name, value);
        Ok(headers)
    }

    fn auth_query(&self) -> Result<Vec<(String, String)>> {
        match &self.settings.query_param {
            Some(param) => Ok(vec![(param.clone(), self.key()?)]),
            None => Ok(Vec::new()),
        }
    }
}

/// `Authorization: Bearer <token>`
pub struct BearerStrategy {
    token: String,
    credentials: Arc<CredentialStore>,
}

impl BearerStrategy {
    /// Create the strategy
    #[must_use]
    pub fn new(token: String, credentials: Arc<CredentialStore>) -> Self {
        Self { token, credentials }
    }
}

#[async_trait]
impl AuthStrategy for BearerStrategy {
    fn auth_type(&self) -> &'static str {
        "bearer"
    }

    async fn ensure_authenticated(&self) -> Result<bool> {
        self.credentials.require("token", &self.token).map(|_| true)
    }

    fn auth_headers(&self) -> Result<HeaderMap> {
        let token = self.credentials.require("token", &self.token)?;
        let (name, value) = sensitive_header(AUTHORIZATION.as_str(), &format!("Bearer {token}"))?;
        let mut headers = HeaderMap::new();
        headers.insert(name, value);
        Ok(headers)
    }
}

/// HTTP Basic
pub struct BasicStrategy {
    username: String,
    password: String,
    credentials: Arc<CredentialStore>,
}

impl BasicStrategy {
    /// Create the strategy
    #[must_use]
    pub fn new(username: String, password: String, credentials: Arc<CredentialStore>) -> Self {
        Self {
            username,
            password,
            credentials,
        }
    }
}

#[async_trait]
impl AuthStrategy for BasicStrategy {
    fn auth_type(&self) -> &'static str {
        "basic"
    }

    async fn ensure_authenticated(&self) -> Result<bool> {
        self.credentials.require("username", &self.username)?;
        self.credentials.require("password", &self.password)?;
        Ok(true)
    }

    fn auth_headers(&self) -> Result<HeaderMap> {
        let username = self.credentials.require("username", &self.username)?;
        let password = self.credentials.require("password", &self.password)?;
        let encoded = STANDARD.encode(format!("{username}:{password}"));
        let (name, value) = sensitive_header(AUTHORIZATION.as_str(), &format!("Basic {encoded}"))?;
        let mut headers = HeaderMap::new();
        headers.insert(name, value);
        Ok(headers)
    }
}

/// Arbitrary header bag passed through verbatim
pub struct CustomStrategy {
    headers: BTreeMap<String, String>,
    credentials: Arc<CredentialStore>,
}

impl CustomStrategy {
    /// Create the strategy
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the bag is empty or a header name is invalid.
    pub fn new(headers: BTreeMap<String, String>, credentials: Arc<CredentialStore>) -> Result<Self> {
        if headers.is_empty() {
            return Err(Error::Config("custom auth needs at least one header".to_string()));
        }
        for name in headers.keys() {
            reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Config(format!("invalid header name '{name}': {e}")))?;
        }
        Ok(Self {
            headers,
            credentials,
        })
    }
}

#[async_trait]
impl AuthStrategy for CustomStrategy {
    fn auth_type(&self) -> &'static str {
        "custom"
    }

    async fn ensure_authenticated(&self) -> Result<bool> {
        for (name, value) in &self.headers {
            self.credentials.require(name, value)?;
        }
        Ok(true)
    }

    fn auth_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let resolved = self.credentials.require(name, value)?;
            let (name, value) = sensitive_header(name, &resolved)?;
            headers.insert(name, value);
        }
        Ok(headers)
    }
}
