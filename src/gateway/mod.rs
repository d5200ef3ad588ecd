//! Protocol gateway façade
//!
//! One [`ProtocolGateway`] per platform composes the tool registry, the
//! rate-limit governor, the auth strategy, the retry executor and the call
//! ledger behind `execute_tool`.

mod result;
mod state;

pub use result::{CallContext, GatewayStats, ToolResult};
pub use state::GatewayState;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Method;
use reqwest::header::{ACCEPT, HeaderValue};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::state::StateCell;
use crate::auth::{self, AuthStrategy};
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, PlatformConfig, scoped};
use crate::failsafe::{
    RateLimitGovernor, RateLimitInfo, RetryExecutor, RetryPolicy, Sleeper, TokioSleeper,
};
use crate::ledger::{ApiCallRecord, CallLedger};
use crate::tools::{ToolDefinition, ToolRegistry};
use crate::transport::{HttpTransport, OutboundRequest, ReqwestTransport, TransportResponse};
use crate::webhook::{WebhookSubscription, WebhookVerifier};
use crate::{Error, Result};

/// Builder for [`ProtocolGateway`] with injectable collaborators
pub struct GatewayBuilder {
    platform: String,
    config: PlatformConfig,
    transport: Option<Arc<dyn HttpTransport>>,
    clock: Option<Arc<dyn Clock>>,
    sleeper: Option<Arc<dyn Sleeper>>,
}

impl GatewayBuilder {
    /// Use this transport instead of a pooled reqwest client
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use this clock for windows and token expiry
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use this sleeper for retry backoff
    #[must_use]
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    /// Build the gateway
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid platform configuration, duplicate
    /// tools or webhook subscriptions whose secret cannot be resolved.
    pub fn build(self) -> Result<ProtocolGateway> {
        let Self {
            platform,
            config,
            transport,
            clock,
            sleeper,
        } = self;

        config.validate().map_err(|e| scoped(&platform, e))?;

        let transport = match transport {
            Some(t) => t,
            None => Arc::new(ReqwestTransport::new(config.max_connections, config.timeout)?),
        };
        let clock = clock.unwrap_or_else(|| Arc::new(SystemClock));
        let sleeper = sleeper.unwrap_or_else(|| Arc::new(TokioSleeper));

        let tools = ToolRegistry::from_definitions(config.tools.iter().cloned())?;
        let auth = auth::from_settings(
            &platform,
            &config.auth,
            Arc::clone(&transport),
            Arc::clone(&clock),
            config.timeout,
        )?;
        let governor = Arc::new(RateLimitGovernor::new(
            &platform,
            config.rate_limits.clone(),
            config.quotas.clone(),
            Arc::clone(&clock),
        ));

        let webhooks = Arc::new(WebhookVerifier::new(platform.as_str()));
        for hook in &config.webhooks {
            webhooks
                .register(WebhookSubscription::from(hook))
                .map_err(|e| scoped(&platform, e))?;
        }

        info!(
            platform = %platform,
            tools = tools.len(),
            auth = auth.auth_type(),
            "Gateway created"
        );

        Ok(ProtocolGateway {
            state: StateCell::new(&platform),
            policy: RetryPolicy::new(&config.retry),
            retry: RetryExecutor::new(sleeper),
            ledger: CallLedger::new(config.ledger_capacity),
            shutdown: CancellationToken::new(),
            platform,
            config,
            tools,
            auth,
            governor,
            webhooks,
            transport,
            clock,
        })
    }
}

/// Gateway for one platform
pub struct ProtocolGateway {
    platform: String,
    config: PlatformConfig,
    tools: ToolRegistry,
    auth: Arc<dyn AuthStrategy>,
    governor: Arc<RateLimitGovernor>,
    retry: RetryExecutor,
    policy: RetryPolicy,
    ledger: CallLedger,
    webhooks: Arc<WebhookVerifier>,
    transport: Arc<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
    state: StateCell,
    shutdown: CancellationToken,
}

impl ProtocolGateway {
    /// Start building a gateway for `platform`
    pub fn builder(platform: impl Into<String>, config: PlatformConfig) -> GatewayBuilder {
        GatewayBuilder {
            platform: platform.into(),
            config,
            transport: None,
            clock: None,
            sleeper: None,
        }
    }

    /// Platform name
    #[must_use]
    pub fn platform(&self) -> &str {
        &self.platform
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> GatewayState {
        self.state.get()
    }

    /// Registered tools
    #[must_use]
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Auth strategy
    #[must_use]
    pub fn auth(&self) -> &Arc<dyn AuthStrategy> {
        &self.auth
    }

    /// Rate-limit governor
    #[must_use]
    pub fn governor(&self) -> &Arc<RateLimitGovernor> {
        &self.governor
    }

    /// Header carrying webhook signatures
    #[must_use]
    pub fn signature_header(&self) -> &str {
        &self.config.signature_header
    }

    /// Webhook verifier shared with receivers
    #[must_use]
    pub fn webhook_verifier(&self) -> Arc<WebhookVerifier> {
        Arc::clone(&self.webhooks)
    }

    /// Execute a tool with default call options
    pub async fn execute_tool(&self, name: &str, arguments: Value) -> ToolResult {
        self.execute_tool_with(name, arguments, &CallContext::default())
            .await
    }

    /// Execute a tool.
    ///
    /// Validation, budget admission and authentication all happen before any
    /// request leaves the process. Failures come back as a [`ToolResult`]
    /// with `success: false`, never as a Rust error.
    pub async fn execute_tool_with(&self, name: &str, arguments: Value, ctx: &CallContext) -> ToolResult {
        let started = Instant::now();

        if self.state.get() == GatewayState::Closed {
            return ToolResult::failed(&Error::Shutdown, None, started.elapsed());
        }

        let tool = match self.tools.check(name, &arguments) {
            Ok(tool) => tool,
            Err(e) => {
                debug!(platform = %self.platform, tool = name, error = %e, "Rejected before dispatch");
                return ToolResult::failed(&e, None, started.elapsed());
            }
        };

        let reservation = match self.governor.acquire(&tool.category, &tool.name) {
            Ok(reservation) => reservation,
            Err(denial) => {
                self.state.set(GatewayState::RateLimited);
                let mut record = self.new_record(tool);
                record.rate_limited = true;
                self.ledger.record(record);

                info!(
                    platform = %self.platform,
                    tool = %tool.name,
                    scope = %denial.scope,
                    retry_after_ms = denial.info.retry_after.unwrap_or_default().as_millis(),
                    "Rate limited"
                );
                let error = Error::RateLimited {
                    scope: denial.scope,
                    remaining: denial.info.remaining,
                    reset_at: denial.info.reset_at.unwrap_or_else(|| self.clock.now()),
                    retry_after: denial.info.retry_after.unwrap_or_default(),
                };
                return ToolResult::failed(&error, Some(denial.info), started.elapsed());
            }
        };
        let budget = reservation.info();

        // Anything failing from here to dispatch drops the reservation, refunding it
        match self.ensure_authenticated().await {
            Ok(true) => {}
            Ok(false) => {
                let error = Error::Authentication(format!(
                    "{}: authorization required; complete the authorization URL flow",
                    self.platform
                ));
                return ToolResult::failed(&error, Some(budget), started.elapsed());
            }
            Err(e) => return ToolResult::failed(&e, Some(budget), started.elapsed()),
        }
        let request = match self.build_request(tool, &arguments, ctx) {
            Ok(request) => request,
            Err(e) => return ToolResult::failed(&e, Some(budget), started.elapsed()),
        };
        let cancel = ctx
            .cancel
            .clone()
            .unwrap_or_else(|| self.shutdown.child_token());
        if cancel.is_cancelled() {
            return ToolResult::failed(&Error::Cancelled, Some(budget), started.elapsed());
        }

        let budget = reservation.commit();
        self.dispatch(tool, request, &cancel, budget, started).await
    }

    async fn dispatch(
        &self,
        tool: &ToolDefinition,
        request: OutboundRequest,
        cancel: &CancellationToken,
        budget: RateLimitInfo,
        started: Instant,
    ) -> ToolResult {
        let mut record = self.new_record(tool);
        let transport = &self.transport;
        let outcome = self
            .retry
            .execute(&self.policy, &tool.name, cancel, |attempt| {
                let request = request.clone();
                async move {
                    debug!(tool = %tool.name, attempt, "Dispatching");
                    transport.send(request).await
                }
            })
            .await;

        record.retry_count = outcome.retries();
        record.response_time = started.elapsed();
        let result = match outcome.result {
            Ok(response) if response.is_success() => {
                record.status_code = Some(response.status);
                record.success = true;
                ToolResult::ok(response.body, Some(budget), started.elapsed())
            }
            Ok(response) => {
                record.status_code = Some(response.status);
                let error = self.upstream_error(&response);
                ToolResult::failed(&error, Some(budget), started.elapsed())
            }
            Err(error) => {
                if let Error::Transport { status, .. } = &error {
                    record.status_code = *status;
                }
                ToolResult::failed(&error, Some(budget), started.elapsed())
            }
        };

        if record.success {
            debug!(platform = %self.platform, tool = %tool.name, retries = record.retry_count, "Call succeeded");
        } else {
            warn!(
                platform = %self.platform,
                tool = %tool.name,
                status = ?record.status_code,
                retries = record.retry_count,
                error = result.error.as_deref().unwrap_or_default(),
                "Call failed"
            );
        }
        self.ledger.record(record);
        result
    }

    /// Map a non-2xx, non-retried response to an error
    fn upstream_error(&self, response: &TransportResponse) -> Error {
        if response.status == 401 {
            self.auth.invalidate();
            return Error::Authentication(format!("upstream rejected credential: {}", response.summary()));
        }
        Error::transport(Some(response.status), response.summary())
    }

    fn new_record(&self, tool: &ToolDefinition) -> ApiCallRecord {
        ApiCallRecord::new(&tool.name, &tool.endpoint, &tool.method, self.clock.now())
    }

    /// Drive the strategy, tracking state; `Ok(false)` means consent is pending
    async fn ensure_authenticated(&self) -> Result<bool> {
        if !matches!(self.state.get(), GatewayState::Ready | GatewayState::RateLimited) {
            self.state.set(GatewayState::Authenticating);
        }

        match self.auth.ensure_authenticated().await {
            Ok(true) => {
                self.state.set(GatewayState::Ready);
                Ok(true)
            }
            Ok(false) => {
                self.state.set(GatewayState::Error);
                Ok(false)
            }
            Err(e) => {
                warn!(platform = %self.platform, error = %e, "Authentication failed");
                self.state.set(GatewayState::Error);
                Err(e)
            }
        }
    }

    /// Resolve the tool's endpoint and split arguments into path, query and body
    fn build_request(&self, tool: &ToolDefinition, arguments: &Value, ctx: &CallContext) -> Result<OutboundRequest> {
        let method = Method::from_bytes(tool.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| Error::Config(format!("tool '{}': invalid method '{}'", tool.name, tool.method)))?;
        let mut remaining: Map<String, Value> = arguments.as_object().cloned().unwrap_or_default();

        let mut path = tool.endpoint.clone();
        for name in tool.path_params() {
            let value = remaining
                .remove(name)
                .filter(|v| !v.is_null())
                .ok_or_else(|| Error::Validation {
                    tool: tool.name.clone(),
                    violations: vec![format!("{name}: required by the endpoint path")],
                })?;
            path = path.replace(&format!("{{{name}}}"), &encode_segment(&scalar_string(&value)));
        }

        let url = join_url(&self.config.base_url, &path);
        let timeout = ctx.timeout.unwrap_or(self.config.timeout);
        let mut request = OutboundRequest::new(method.clone(), url, timeout);

        if matches!(method, Method::GET | Method::DELETE | Method::HEAD) {
            request.query = remaining
                .into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, scalar_string(&v)))
                .collect();
        } else if !remaining.is_empty() {
            request = request.json(Value::Object(remaining));
        }

        request.headers = self.auth.auth_headers()?;
        request.query.extend(self.auth.auth_query()?);
        request
            .headers
            .insert(ACCEPT, HeaderValue::from_static("application/json"));
        for (name, value) in &ctx.headers {
            request.headers.insert(name.clone(), value.clone());
        }
        Ok(request)
    }

    /// Ensure a credential, driving refresh when needed
    ///
    /// Returns `false` when interactive authorization is still required.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Authentication`] if credentials are missing or rejected.
    pub async fn authenticate(&self) -> Result<bool> {
        self.closed_guard()?;
        self.ensure_authenticated().await
    }

    /// Authorization URL for the OAuth2 code flow
    ///
    /// # Errors
    ///
    /// Returns [`Error::Authentication`] for non-OAuth2 platforms.
    pub fn build_authorization_url(&self) -> Result<String> {
        self.closed_guard()?;
        self.auth.build_authorization_url()
    }

    /// Exchange an authorization code for tokens
    ///
    /// # Errors
    ///
    /// Returns [`Error::Authentication`] on state mismatch or a rejected grant.
    pub async fn exchange_code(&self, code: &str, state: Option<&str>) -> Result<bool> {
        self.closed_guard()?;
        self.state.set(GatewayState::Authenticating);
        match self.auth.exchange_code(code, state).await {
            Ok(done) => {
                self.state.set(if done { GatewayState::Ready } else { GatewayState::Error });
                Ok(done)
            }
            Err(e) => {
                self.state.set(GatewayState::Error);
                Err(e)
            }
        }
    }

    /// Force a credential refresh
    ///
    /// # Errors
    ///
    /// Returns [`Error::Authentication`] if no refresh is possible.
    pub async fn refresh(&self) -> Result<bool> {
        self.closed_guard()?;
        self.state.set(GatewayState::Authenticating);
        let result = self.auth.refresh().await;
        self.state.set(match result {
            Ok(true) => GatewayState::Ready,
            _ => GatewayState::Error,
        });
        result
    }

    /// Forget obtained credentials
    pub fn logout(&self) {
        self.auth.logout();
        self.state.set(GatewayState::Uninitialized);
    }

    /// Register a webhook subscription, replacing one for the same event type
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription is invalid or its secret is unavailable.
    pub fn register_webhook(&self, subscription: WebhookSubscription) -> Result<()> {
        self.closed_guard()?;
        self.webhooks.register(subscription)
    }

    /// Remove a webhook subscription
    pub fn unregister_webhook(&self, event_type: &str) -> bool {
        self.webhooks.unregister(event_type)
    }

    /// Check a webhook payload signature
    #[must_use]
    pub fn verify_webhook(&self, payload: &[u8], signature: &str, event_type: &str) -> bool {
        self.webhooks.verify(payload, signature, event_type)
    }

    /// Telemetry over the whole ledger
    #[must_use]
    pub fn get_stats(&self) -> GatewayStats {
        self.stats_window(None)
    }

    /// Telemetry over calls newer than `window`
    #[must_use]
    pub fn stats_window(&self, window: Option<Duration>) -> GatewayStats {
        let ledger = self.ledger.stats(window, self.clock.now());
        GatewayStats {
            platform: self.platform.clone(),
            state: self.state.get(),
            total_calls: ledger.total,
            success_rate: ledger.success_rate,
            avg_response_time: ledger.avg_response_time,
            rate_limited_count: ledger.rate_limited_count,
            rate_limits: self.governor.snapshot(),
            quotas: self.governor.quota_snapshot(),
        }
    }

    /// Most recent call records, newest first
    #[must_use]
    pub fn recent_calls(&self, n: usize) -> Vec<ApiCallRecord> {
        self.ledger.recent(n)
    }

    /// Stop accepting calls, cancel in-flight retries and close the pool
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails to close.
    pub async fn close(&self) -> Result<()> {
        if !self.state.set(GatewayState::Closed) {
            return Ok(());
        }
        self.shutdown.cancel();
        self.transport.close().await?;
        info!(platform = %self.platform, "Gateway closed");
        Ok(())
    }

    fn closed_guard(&self) -> Result<()> {
        if self.state.get() == GatewayState::Closed {
            return Err(Error::Shutdown);
        }
        Ok(())
    }
}

/// One gateway per enabled platform
#[derive(Default)]
pub struct Gateways {
    gateways: BTreeMap<String, Arc<ProtocolGateway>>,
}

impl Gateways {
    /// Build gateways for every enabled platform
    ///
    /// # Errors
    ///
    /// Returns the first platform that fails to build.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut gateways = BTreeMap::new();
        for (name, platform) in config.enabled_platforms() {
            let gateway = ProtocolGateway::builder(name.clone(), platform.clone()).build()?;
            gateways.insert(name.clone(), Arc::new(gateway));
        }
        info!(count = gateways.len(), "Gateways ready");
        Ok(Self { gateways })
    }

    /// Gateway for `platform`
    #[must_use]
    pub fn get(&self, platform: &str) -> Option<Arc<ProtocolGateway>> {
        self.gateways.get(platform).cloned()
    }

    /// Gateway for `platform`, or a config error
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the platform is not configured or disabled.
    pub fn require(&self, platform: &str) -> Result<Arc<ProtocolGateway>> {
        self.get(platform)
            .ok_or_else(|| Error::Config(format!("unknown or disabled platform '{platform}'")))
    }

    /// All gateways by platform name
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<ProtocolGateway>)> {
        self.gateways.iter()
    }

    /// Close every gateway concurrently
    pub async fn close_all(&self) {
        let closing = self.gateways.iter().map(|(name, gateway)| async move {
            if let Err(e) = gateway.close().await {
                warn!(platform = %name, error = %e, "Failed to close gateway");
            }
        });
        futures::future::join_all(closing).await;
    }
}

/// Join a base URL and an endpoint path; absolute endpoints win
fn join_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

/// Render a JSON value for a path segment or query string
fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Array(items) if items.iter().all(|v| !v.is_object() && !v.is_array()) => items
            .iter()
            .map(scalar_string)
            .collect::<Vec<_>>()
            .join(","),
        _ => value.to_string(),
    }
}

/// Percent-encode a path segment
fn encode_segment(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}
