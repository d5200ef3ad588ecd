//! Authentication strategies
//!
//! One [`AuthStrategy`] per platform, chosen once from [`AuthSettings`] by
//! [`from_settings`]. All credential material flows through the platform's
//! [`CredentialStore`].

mod credentials;
mod oauth2;
mod session;
mod static_auth;

pub use credentials::CredentialStore;
pub use oauth2::OAuth2Strategy;
pub use session::{AuthSession, EXPIRY_SKEW_SECS, TokenResponse};
pub use static_auth::{ApiKeyStrategy, BasicStrategy, BearerStrategy, CustomStrategy, NoAuth};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::clock::Clock;
use crate::config::AuthSettings;
use crate::transport::HttpTransport;
use crate::{Error, Result};

/// Produces request credentials and drives token acquisition
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Auth type name (`oauth2`, `api_key`, ...)
    fn auth_type(&self) -> &'static str;

    /// Make sure a usable credential exists.
    ///
    /// `Ok(false)` means interactive authorization is still required.
    async fn ensure_authenticated(&self) -> Result<bool>;

    /// Headers to attach to an outbound call
    fn auth_headers(&self) -> Result<HeaderMap>;

    /// Query parameters to attach to an outbound call
    fn auth_query(&self) -> Result<Vec<(String, String)>> {
        Ok(Vec::new())
    }

    /// URL the user must visit to grant access
    fn build_authorization_url(&self) -> Result<String> {
        Err(Error::Authentication(format!(
            "{} auth has no authorization URL",
            self.auth_type()
        )))
    }

    /// Exchange an authorization code; `state` must match the pending nonce if given
    async fn exchange_code(&self, _code: &str, _state: Option<&str>) -> Result<bool> {
        Err(Error::Authentication(format!(
            "{} auth does not exchange codes",
            self.auth_type()
        )))
    }

    /// Force a credential refresh
    async fn refresh(&self) -> Result<bool> {
        self.ensure_authenticated().await
    }

    /// Forget any obtained credential
    fn logout(&self) {}

    /// Mark the current credential as rejected upstream
    fn invalidate(&self) {}
}

/// Build the strategy for a platform
///
/// # Errors
///
/// Returns [`Error::Config`] for settings that can never produce a credential.
pub fn from_settings(
    platform: &str,
    settings: &AuthSettings,
    transport: Arc<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
) -> Result<Arc<dyn AuthStrategy>> {
    let credentials = Arc::new(CredentialStore::new(platform));
    let strategy: Arc<dyn AuthStrategy> = match settings {
        AuthSettings::None => Arc::new(NoAuth),
        AuthSettings::OAuth2(oauth) => Arc::new(OAuth2Strategy::new(
            oauth.clone(),
            credentials,
            transport,
            clock,
            timeout,
        )),
        AuthSettings::ApiKey(api_key) => {
            Arc::new(ApiKeyStrategy::new(api_key.clone(), credentials)?)
        }
        AuthSettings::Bearer { token } => Arc::new(BearerStrategy::new(token.clone(), credentials)),
        AuthSettings::Basic { username, password } => Arc::new(BasicStrategy::new(
            username.clone(),
            password.clone(),
            credentials,
        )),
        AuthSettings::Custom { headers } => {
            Arc::new(CustomStrategy::new(headers.clone(), credentials)?)
        }
    };
    Ok(strategy)
}

/// Build a sensitive header pair
pub(crate) fn sensitive_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue)> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| Error::Config(format!("invalid header name '{name}': {e}")))?;
    let mut value = HeaderValue::from_str(value)
        .map_err(|_| Error::Authentication(format!("credential for '{name}' is not a valid header value")))?;
    value.set_sensitive(true);
    Ok((name, value))
}
