//! Credential material and secret reference resolution
//!
//! Credential fields in config may be literals, `env:VAR` or contain
//! `{env.VAR}` placeholders. Resolved values are cached for the session and
//! never printed. Tokens obtained at runtime live in the store's
//! [`AuthSession`].

use std::env;
use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use regex::Regex;
use tracing::debug;

use super::session::AuthSession;
use crate::{Error, Result};

/// Per-platform credential store
pub struct CredentialStore {
    platform: String,
    /// Resolved secrets keyed by their reference
    resolved: DashMap<String, String>,
    /// Runtime token material
    session: RwLock<AuthSession>,
}

impl CredentialStore {
    /// Create an empty store for `platform`
    #[must_use]
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            resolved: DashMap::new(),
            session: RwLock::new(AuthSession::default()),
        }
    }

    /// Platform this store belongs to
    #[must_use]
    pub fn platform(&self) -> &str {
        &self.platform
    }

    /// Resolve a credential reference.
    ///
    /// `env:VAR` takes the whole value from the environment. `{env.VAR}`
    /// placeholders are substituted in place. Anything else is a literal.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Authentication`] if a referenced variable is unset.
    pub fn resolve(&self, value: &str) -> Result<String> {
        if let Some(cached) = self.resolved.get(value) {
            return Ok(cached.clone());
        }

        let resolved = if let Some(var) = value.strip_prefix("env:") {
            self.lookup(var.trim())?
        } else {
            self.substitute(value)?
        };

        if resolved != value {
            debug!(platform = %self.platform, "Resolved credential reference");
            self.resolved.insert(value.to_string(), resolved.clone());
        }
        Ok(resolved)
    }

    /// Resolve and require a non-empty value for `field`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Authentication`] if the value is missing or empty.
    pub fn require(&self, field: &str, value: &str) -> Result<String> {
        let resolved = self.resolve(value)?;
        if resolved.trim().is_empty() {
            return Err(Error::Authentication(format!(
                "{}: credential '{field}' is empty",
                self.platform
            )));
        }
        Ok(resolved)
    }

    /// Whether a credential reference resolves to a non-empty value
    #[must_use]
    pub fn is_present(&self, value: &str) -> bool {
        self.resolve(value).is_ok_and(|v| !v.trim().is_empty())
    }

    /// Copy of the current session
    #[must_use]
    pub fn session(&self) -> AuthSession {
        self.session.read().clone()
    }

    /// Read the session without cloning
    pub fn with_session<R>(&self, f: impl FnOnce(&AuthSession) -> R) -> R {
        f(&self.session.read())
    }

    /// Mutate the session in place
    pub fn update_session<R>(&self, f: impl FnOnce(&mut AuthSession) -> R) -> R {
        f(&mut self.session.write())
    }

    /// Usable `Authorization` header value at `now`
    #[must_use]
    pub fn authorization(&self, now: DateTime<Utc>) -> Option<String> {
        self.session.read().header_value(now)
    }

    /// Whether the session holds a usable access token at `now`
    #[must_use]
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.session.read().valid_token(now).is_some()
    }

    /// Drop the session and cached resolutions
    pub fn clear(&self) {
        self.resolved.clear();
        self.session.write().clear();
    }

    fn lookup(&self, var: &str) -> Result<String> {
        env::var(var).map_err(|_| {
            Error::Authentication(format!(
                "{}: environment variable '{var}' is not set",
                self.platform
            ))
        })
    }

    fn substitute(&self, value: &str) -> Result<String> {
        static ENV_RE: OnceLock<Regex> = OnceLock::new();
        #[allow(clippy::unwrap_used)]
        let re = ENV_RE.get_or_init(|| Regex::new(r"\{env\.([^}]+)\}").unwrap());

        let mut result = value.to_string();
        for caps in re.captures_iter(value) {
            let secret = self.lookup(&caps[1])?;
            result = result.replace(&caps[0], &secret);
        }
        Ok(result)
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("platform", &self.platform)
            .field("resolved", &self.resolved.len())
            .field("session", &*self.session.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_passes_through() {
        let store = CredentialStore::new("reddit");
        assert_eq!(store.resolve("plain-secret").unwrap(), "plain-secret");
    }

    #[test]
    fn env_prefix_reads_whole_value() {
        // PATH is set on every platform the tests run on
        let store = CredentialStore::new("reddit");
        let path = std::env::var("PATH").unwrap();
        assert_eq!(store.resolve("env:PATH").unwrap(), path);
    }

    #[test]
    fn placeholders_are_substituted() {
        let store = CredentialStore::new("zoho");
        let resolved = store.resolve("Zoho {env.PATH} {env.PATH}").unwrap();
        assert!(!resolved.contains("{env."));
        assert!(resolved.starts_with("Zoho "));
    }

    #[test]
    fn missing_variable_is_an_authentication_error() {
        let store = CredentialStore::new("x");
        let err = store.resolve("env:PLATFORM_GATEWAY_SURELY_UNSET_42").unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
        assert!(!store.is_present("{env.PLATFORM_GATEWAY_SURELY_UNSET_42}"));
    }

    #[test]
    fn require_rejects_empty() {
        let store = CredentialStore::new("snap");
        let err = store.require("token", "  ").unwrap_err();
        assert!(err.to_string().contains("'token' is empty"));
    }

    #[test]
    fn session_validity_follows_tokens() {
        let store = CredentialStore::new("reddit");
        let now = Utc::now();
        assert!(!store.is_valid(now));

        store.update_session(|s| s.access_token = Some("abc".into()));
        assert!(store.is_valid(now));
        assert_eq!(store.authorization(now).as_deref(), Some("Bearer abc"));

        store.clear();
        assert!(!store.is_valid(now));
    }

    #[test]
    fn debug_never_shows_values() {
        let store = CredentialStore::new("reddit");
        store.update_session(|s| s.access_token = Some("super-secret-value".into()));
        store.resolve("literal-client-secret").unwrap();
        let debug = format!("{store:?}");
        assert!(debug.contains("has_access_token: true"));
        assert!(!debug.contains("super-secret-value"));
    }
}
