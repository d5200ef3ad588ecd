//! Configuration management

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    env,
    path::Path,
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::failsafe::QuotaPeriod;
use crate::tools::ToolDefinition;
use crate::webhook::SignatureScheme;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before resolving credentials.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Per-platform gateway configuration
    pub platforms: BTreeMap<String, PlatformConfig>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // PLATFORM_GATEWAY_PLATFORMS__REDDIT__TIMEOUT=10s style overrides
        figment = figment.merge(Env::prefixed("PLATFORM_GATEWAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} in URLs
    fn expand_env_vars(&mut self) {
        #[allow(clippy::unwrap_used)]
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();

        for platform in self.platforms.values_mut() {
            platform.base_url = expand_string(&re, &platform.base_url);
            if let AuthSettings::OAuth2(oauth) = &mut platform.auth {
                oauth.authorize_url = expand_string(&re, &oauth.authorize_url);
                oauth.token_url = expand_string(&re, &oauth.token_url);
                oauth.redirect_uri = expand_string(&re, &oauth.redirect_uri);
            }
            for hook in &mut platform.webhooks {
                hook.callback_url = expand_string(&re, &hook.callback_url);
            }
        }
    }

    /// Check every platform for structural mistakes
    ///
    /// # Errors
    ///
    /// Returns the first problem found as [`Error::Config`].
    pub fn validate(&self) -> Result<()> {
        for (name, platform) in &self.platforms {
            platform.validate().map_err(|e| scoped(name, e))?;
        }
        Ok(())
    }

    /// Enabled platforms only
    pub fn enabled_platforms(&self) -> impl Iterator<Item = (&String, &PlatformConfig)> {
        self.platforms.iter().filter(|(_, p)| p.enabled)
    }
}

/// Prefix a config error with the platform it came from
pub(crate) fn scoped(platform: &str, error: Error) -> Error {
    match error {
        Error::Config(msg) => Error::Config(format!("platform '{platform}': {msg}")),
        other => other,
    }
}

/// Expand environment variables in a string
fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// Configuration of one platform gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Whether this platform is enabled
    pub enabled: bool,
    /// API base URL
    pub base_url: String,
    /// Authentication scheme and parameters
    pub auth: AuthSettings,
    /// Transport windows per endpoint category
    pub rate_limits: HashMap<String, WindowConfig>,
    /// Quota budgets per tool
    pub quotas: HashMap<String, QuotaConfig>,
    /// Default request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Retry policy
    pub retry: RetryConfig,
    /// Maximum concurrent outbound connections
    pub max_connections: usize,
    /// Ring buffer capacity of the call ledger
    pub ledger_capacity: usize,
    /// Header carrying inbound webhook signatures
    pub signature_header: String,
    /// Operations exposed by this platform
    pub tools: Vec<ToolDefinition>,
    /// Webhook subscriptions
    pub webhooks: Vec<WebhookConfig>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: String::new(),
            auth: AuthSettings::None,
            rate_limits: HashMap::new(),
            quotas: HashMap::new(),
            timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            max_connections: 10,
            ledger_capacity: 1000,
            signature_header: "X-Signature".to_string(),
            tools: Vec::new(),
            webhooks: Vec::new(),
        }
    }
}

/// Longest accepted transport window
pub const MAX_WINDOW: Duration = Duration::from_secs(366 * 86_400);

impl PlatformConfig {
    /// Structural validation
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.base_url)
            .map_err(|e| Error::Config(format!("invalid base_url '{}': {e}", self.base_url)))?;

        for (category, window) in &self.rate_limits {
            if window.limit == 0 || window.window.is_zero() {
                return Err(Error::Config(format!(
                    "rate limit '{category}' needs a positive limit and window"
                )));
            }
            if window.window > MAX_WINDOW {
                return Err(Error::Config(format!(
                    "rate limit '{category}' window exceeds {} days; use a quota for longer periods",
                    MAX_WINDOW.as_secs() / 86_400
                )));
            }
        }
        for (tool, quota) in &self.quotas {
            if quota.limit == 0 {
                return Err(Error::Config(format!("quota for '{tool}' needs a positive limit")));
            }
        }

        let mut seen = HashSet::new();
        for tool in &self.tools {
            if !seen.insert(tool.name.as_str()) {
                return Err(Error::Config(format!("duplicate tool '{}'", tool.name)));
            }
        }

        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".to_string()));
        }

        if let AuthSettings::OAuth2(oauth) = &self.auth {
            for (field, value) in [
                ("authorize_url", &oauth.authorize_url),
                ("token_url", &oauth.token_url),
            ] {
                Url::parse(value)
                    .map_err(|e| Error::Config(format!("invalid oauth2 {field} '{value}': {e}")))?;
            }
        }

        Ok(())
    }
}

/// Authentication settings, tagged by `type`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthSettings {
    /// No authentication
    #[default]
    None,
    /// OAuth 2.0 authorization code flow with refresh
    #[serde(rename = "oauth2")]
    OAuth2(OAuth2Settings),
    /// Static API key
    ApiKey(ApiKeySettings),
    /// Static bearer token
    Bearer {
        /// Token (literal, `env:VAR` or `{env.VAR}`)
        token: String,
    },
    /// HTTP Basic
    Basic {
        /// Username
        username: String,
        /// Password
        password: String,
    },
    /// Arbitrary headers passed through verbatim
    Custom {
        /// Header name -> value
        headers: BTreeMap<String, String>,
    },
}

impl AuthSettings {
    /// Auth type name
    #[must_use]
    pub fn auth_type(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::OAuth2(_) => "oauth2",
            Self::ApiKey(_) => "api_key",
            Self::Bearer { .. } => "bearer",
            Self::Basic { .. } => "basic",
            Self::Custom { .. } => "custom",
        }
    }
}

/// OAuth 2.0 client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuth2Settings {
    /// Client ID
    pub client_id: String,
    /// Client secret (absent for public PKCE clients)
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Authorization endpoint
    pub authorize_url: String,
    /// Token endpoint
    pub token_url: String,
    /// Redirect URI registered with the platform
    pub redirect_uri: String,
    /// Requested scopes
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Scope separator (space per RFC 6749; some platforms use commas)
    #[serde(default = "default_scope_separator")]
    pub scope_separator: String,
    /// Send a PKCE S256 challenge
    #[serde(default)]
    pub pkce: bool,
    /// How client credentials are presented to the token endpoint
    #[serde(default)]
    pub client_auth: ClientAuthMethod,
    /// Extra query parameters for the authorization URL (e.g. `duration=permanent`)
    #[serde(default)]
    pub extra_authorize_params: BTreeMap<String, String>,
    /// Pre-provisioned access token
    #[serde(default)]
    pub access_token: Option<String>,
    /// Pre-provisioned refresh token
    #[serde(default)]
    pub refresh_token: Option<String>,
}

fn default_scope_separator() -> String {
    " ".to_string()
}

/// Token endpoint client authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMethod {
    /// HTTP Basic with client id and secret
    #[default]
    ClientSecretBasic,
    /// Client id and secret in the form body
    ClientSecretPost,
    /// Client id only (public client)
    None,
}

/// API key settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeySettings {
    /// Key (literal, `env:VAR` or `{env.VAR}`)
    pub key: String,
    /// Header name
    #[serde(default = "default_api_key_header")]
    pub header: String,
    /// Optional header value prefix (e.g. `Zoho-oauthtoken`)
    #[serde(default)]
    pub prefix: Option<String>,
    /// Send as this query parameter instead of a header
    #[serde(default)]
    pub query_param: Option<String>,
}

fn default_api_key_header() -> String {
    "X-API-Key".to_string()
}

/// Transport window limit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Calls allowed per window
    pub limit: u32,
    /// Window length
    #[serde(with = "humantime_serde", default = "default_window")]
    pub window: Duration,
}

fn default_window() -> Duration {
    Duration::from_secs(15 * 60)
}

impl WindowConfig {
    /// Create a window limit
    #[must_use]
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }
}

/// Calendar quota for one tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Calls allowed per period
    pub limit: u32,
    /// Calendar period
    pub period: QuotaPeriod,
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Base delay; attempt n waits `backoff_factor * 2^(n-1)`
    #[serde(with = "humantime_serde")]
    pub backoff_factor: Duration,
    /// Upper bound for a single delay
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Statuses that trigger a retry
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_factor: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            retryable_status_codes: vec![429, 500, 502, 503, 504],
        }
    }
}

/// Webhook subscription configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Event type
    pub event_type: String,
    /// Callback URL registered with the platform
    #[serde(default)]
    pub callback_url: String,
    /// Shared secret (literal, `env:VAR` or `{env.VAR}`)
    pub secret: String,
    /// Signature scheme
    #[serde(default)]
    pub scheme: SignatureScheme,
}

/// Human-readable `Duration` serde (`100ms`, `30s`, `15m`, `1h`, `1d`)
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize a human-readable duration string
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse `100ms`, `30s`, `15m`, `1h`, `1d` or bare seconds
    ///
    /// # Errors
    ///
    /// Returns a message if the string is not a duration.
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let num = |v: &str| {
            v.trim()
                .parse::<u64>()
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        };

        let scaled = |v: &str, unit: u64| {
            num(v)?
                .checked_mul(unit)
                .map(Duration::from_secs)
                .ok_or_else(|| format!("duration '{s}' is too large"))
        };

        // "ms" must be tried before "m" and "s"
        if let Some(ms) = s.strip_suffix("ms") {
            num(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            num(secs).map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            scaled(mins, 60)
        } else if let Some(hours) = s.strip_suffix('h') {
            scaled(hours, 3600)
        } else if let Some(days) = s.strip_suffix('d') {
            scaled(days, 86_400)
        } else {
            num(s).map(Duration::from_secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const REDDIT_YAML: &str = r#"
platforms:
  reddit:
    base_url: https://oauth.reddit.com
    auth:
      type: oauth2
      client_id: "{env.REDDIT_CLIENT_ID}"
      client_secret: "env:REDDIT_CLIENT_SECRET"
      authorize_url: https://www.reddit.com/api/v1/authorize
      token_url: https://www.reddit.com/api/v1/access_token
      redirect_uri: http://localhost:8080/callback
      scopes: [identity, submit]
      extra_authorize_params:
        duration: permanent
    rate_limits:
      default: { limit: 60, window: 1m }
      posts: { limit: 2, window: 1m }
    quotas:
      create_post: { limit: 500, period: monthly }
    timeout: 10s
    retry:
      max_retries: 2
      backoff_factor: 500ms
    tools:
      - name: create_post
        method: POST
        endpoint: /api/submit
        category: posts
        parameters:
          - { name: title, type: string, required: true, maxLength: 300 }
          - { name: body, type: string, required: true }
    webhooks:
      - event_type: message.created
        secret: "env:REDDIT_HOOK_SECRET"
        scheme: hmac_sha256_prefixed
"#;

    #[test]
    fn parses_full_platform_yaml() {
        let config: Config = serde_yaml::from_str(REDDIT_YAML).unwrap();
        config.validate().unwrap();

        let reddit = &config.platforms["reddit"];
        assert_eq!(reddit.timeout, Duration::from_secs(10));
        assert_eq!(reddit.retry.max_retries, 2);
        assert_eq!(reddit.retry.backoff_factor, Duration::from_millis(500));
        assert_eq!(reddit.retry.retryable_status_codes, vec![429, 500, 502, 503, 504]);
        assert_eq!(reddit.rate_limits["posts"].limit, 2);
        assert_eq!(reddit.rate_limits["posts"].window, Duration::from_secs(60));
        assert_eq!(reddit.quotas["create_post"].period, QuotaPeriod::Monthly);
        assert_eq!(reddit.tools[0].parameters[0].max_length, Some(300));
        assert_eq!(reddit.webhooks[0].scheme, SignatureScheme::HmacSha256Prefixed);
        assert_eq!(reddit.max_connections, 10);

        let AuthSettings::OAuth2(oauth) = &reddit.auth else {
            panic!("expected oauth2 auth");
        };
        assert_eq!(oauth.client_auth, ClientAuthMethod::ClientSecretBasic);
        assert_eq!(oauth.scope_separator, " ");
        assert!(!oauth.pkce);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.yaml");
        std::fs::write(&path, REDDIT_YAML).unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert!(config.platforms.contains_key("reddit"));
    }

    #[test]
    fn load_missing_file_fails() {
        let err = Config::load(Some(Path::new("/nonexistent/gateway.yaml"))).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn auth_variants_deserialize() {
        let yaml = r#"
platforms:
  zoho:
    base_url: https://www.zohoapis.com
    auth: { type: api_key, key: abc, header: Authorization, prefix: Zoho-oauthtoken }
  snap:
    base_url: https://adsapi.snapchat.com
    auth: { type: bearer, token: "env:SNAP_TOKEN" }
  legacy:
    base_url: https://legacy.example.com
    auth: { type: basic, username: u, password: p }
  onlyfans:
    base_url: https://onlyfans.example.com
    auth:
      type: custom
      headers: { x-bc: "abc", user-id: "42" }
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.platforms["zoho"].auth.auth_type(), "api_key");
        assert_eq!(config.platforms["snap"].auth.auth_type(), "bearer");
        assert_eq!(config.platforms["legacy"].auth.auth_type(), "basic");
        let AuthSettings::Custom { headers } = &config.platforms["onlyfans"].auth else {
            panic!("expected custom auth");
        };
        assert_eq!(headers["user-id"], "42");
    }

    #[test]
    fn rejects_duplicate_tools_and_zero_limits() {
        let mut platform = PlatformConfig {
            base_url: "https://api.example.com".to_string(),
            ..Default::default()
        };
        platform.tools = vec![
            ToolDefinition::new("a", "GET", "/a"),
            ToolDefinition::new("a", "GET", "/b"),
        ];
        assert!(platform.validate().unwrap_err().to_string().contains("duplicate tool"));

        platform.tools.pop();
        platform
            .rate_limits
            .insert("reads".to_string(), WindowConfig::new(0, Duration::from_secs(60)));
        assert!(platform.validate().unwrap_err().to_string().contains("positive limit"));
    }

    #[test]
    fn rejects_bad_base_url() {
        let platform = PlatformConfig {
            base_url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(platform.validate().is_err());
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(humantime_serde::parse("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(humantime_serde::parse("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(humantime_serde::parse("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(humantime_serde::parse("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(humantime_serde::parse("2d").unwrap(), Duration::from_secs(172_800));
        assert_eq!(humantime_serde::parse("45").unwrap(), Duration::from_secs(45));
        assert!(humantime_serde::parse("soon").is_err());
        assert!(humantime_serde::parse(&format!("{}d", u64::MAX / 1000)).is_err());
    }

    #[test]
    fn rejects_window_past_the_maximum() {
        let mut platform = PlatformConfig {
            base_url: "https://api.example.com".to_string(),
            ..Default::default()
        };
        platform
            .rate_limits
            .insert("posts".to_string(), WindowConfig::new(1, MAX_WINDOW));
        assert!(platform.validate().is_ok());

        platform.rate_limits.insert(
            "posts".to_string(),
            WindowConfig::new(1, Duration::from_secs(u64::MAX / 2)),
        );
        assert!(platform.validate().unwrap_err().to_string().contains("window exceeds"));
    }

    #[test]
    fn expands_env_vars_in_urls() {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();
        assert_eq!(
            expand_string(&re, "${PG_TEST_UNSET_HOST:-https://api.x.com}/2"),
            "https://api.x.com/2"
        );
    }

    #[test]
    fn test_load_env_files_sets_env_vars() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("test.env");
        let mut f = std::fs::File::create(&env_path).unwrap();
        writeln!(f, "PG_TEST_KEY_A=hello_from_env_file").unwrap();
        drop(f);

        let config = Config {
            env_files: vec![env_path.to_string_lossy().to_string()],
            ..Default::default()
        };
        config.load_env_files();

        assert_eq!(env::var("PG_TEST_KEY_A").unwrap(), "hello_from_env_file");
    }

    #[test]
    fn test_load_env_files_skips_missing() {
        let config = Config {
            env_files: vec!["/nonexistent/path/.env".to_string()],
            ..Default::default()
        };
        config.load_env_files();
    }
}
