//! Two-tier rate limit governor
//!
//! Transport windows mirror a platform's raw HTTP limit per endpoint category
//! (`reads`, `writes`, `default`, ...). Quota windows are calendar-aligned
//! budgets attached to a single tool (e.g. 500 posts per month).
//!
//! All window state sits behind one mutex, so [`RateLimitGovernor::acquire`]
//! checks and reserves both tiers in a single step.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use super::window::{QuotaPeriod, RateLimitWindow, WindowCheck, WindowKind};
use crate::clock::Clock;
use crate::config::{QuotaConfig, WindowConfig};
use gateway_core::DEFAULT_CATEGORY;

/// Outcome of a budget check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    /// Whether the call may proceed
    pub allowed: bool,
    /// Remaining budget (`u32::MAX` when unlimited)
    pub remaining: u32,
    /// Window reset time (`None` when unlimited)
    pub reset_at: Option<DateTime<Utc>>,
    /// Time until the denying window resets
    #[serde(skip_serializing_if = "Option::is_none", with = "secs_opt")]
    pub retry_after: Option<Duration>,
}

impl RateLimitInfo {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            remaining: u32::MAX,
            reset_at: None,
            retry_after: None,
        }
    }
}

impl From<WindowCheck> for RateLimitInfo {
    fn from(check: WindowCheck) -> Self {
        Self {
            allowed: check.allowed,
            remaining: check.remaining,
            reset_at: Some(check.reset_at),
            retry_after: check.retry_after,
        }
    }
}

/// Why [`RateLimitGovernor::acquire`] refused a call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    /// Denying window (category name or `quota:<tool>`)
    pub scope: String,
    /// Budget state of the denying window
    pub info: RateLimitInfo,
}

/// Point-in-time view of a window for telemetry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowSnapshot {
    /// Configured limit
    pub limit: u32,
    /// Remaining budget
    pub remaining: u32,
    /// Consumed budget
    pub used: u32,
    /// Reset time
    pub reset_at: DateTime<Utc>,
}

impl From<&RateLimitWindow> for WindowSnapshot {
    fn from(w: &RateLimitWindow) -> Self {
        Self {
            limit: w.limit(),
            remaining: w.remaining(),
            used: w.limit() - w.remaining(),
            reset_at: w.reset_at(),
        }
    }
}

#[derive(Default)]
struct Windows {
    transport: HashMap<String, RateLimitWindow>,
    quotas: HashMap<String, RateLimitWindow>,
}

/// Rate limit governor for one platform
pub struct RateLimitGovernor {
    platform: String,
    transport_limits: HashMap<String, WindowConfig>,
    quota_limits: HashMap<String, QuotaConfig>,
    clock: Arc<dyn Clock>,
    windows: Mutex<Windows>,
}

impl RateLimitGovernor {
    /// Create a governor from per-category transport limits and per-tool quotas
    #[must_use]
    pub fn new(
        platform: &str,
        transport_limits: HashMap<String, WindowConfig>,
        quota_limits: HashMap<String, QuotaConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            platform: platform.to_string(),
            transport_limits,
            quota_limits,
            clock,
            windows: Mutex::new(Windows::default()),
        }
    }

    /// Configured category a tool category is billed against.
    /// Unknown categories fall back to `default`; `None` means unlimited.
    fn resolve_category<'a>(&'a self, category: &'a str) -> Option<(&'a str, &'a WindowConfig)> {
        self.transport_limits
            .get_key_value(category)
            .or_else(|| self.transport_limits.get_key_value(DEFAULT_CATEGORY))
            .map(|(k, v)| (k.as_str(), v))
    }

    fn transport_window<'w>(
        &self,
        windows: &'w mut Windows,
        key: &str,
        config: &WindowConfig,
        now: DateTime<Utc>,
    ) -> &'w mut RateLimitWindow {
        windows.transport.entry(key.to_string()).or_insert_with(|| {
            RateLimitWindow::new(key, WindowKind::FixedShort(config.window), config.limit, now)
        })
    }

    fn quota_window<'w>(
        &self,
        windows: &'w mut Windows,
        tool: &str,
        config: &QuotaConfig,
        now: DateTime<Utc>,
    ) -> &'w mut RateLimitWindow {
        windows.quotas.entry(tool.to_string()).or_insert_with(|| {
            RateLimitWindow::new(tool, WindowKind::QuotaLong(config.period), config.limit, now)
        })
    }

    /// Inspect the transport window for `category` without consuming
    pub fn check(&self, category: &str) -> RateLimitInfo {
        let Some((key, config)) = self.resolve_category(category) else {
            return RateLimitInfo::unlimited();
        };
        let now = self.clock.now();
        let mut windows = self.windows.lock();
        self.transport_window(&mut windows, key, config, now)
            .check(now)
            .into()
    }

    /// Consume one unit of the transport window for `category`
    pub fn consume(&self, category: &str) {
        if let Some((key, config)) = self.resolve_category(category) {
            let now = self.clock.now();
            let mut windows = self.windows.lock();
            self.transport_window(&mut windows, key, config, now).consume(now);
        }
    }

    /// Inspect the quota attached to `tool` without consuming
    pub fn check_quota(&self, tool: &str) -> RateLimitInfo {
        let Some(config) = self.quota_limits.get(tool) else {
            return RateLimitInfo::unlimited();
        };
        let now = self.clock.now();
        let mut windows = self.windows.lock();
        self.quota_window(&mut windows, tool, config, now)
            .check(now)
            .into()
    }

    /// Consume one unit of the quota attached to `tool`
    pub fn consume_quota(&self, tool: &str) {
        if let Some(config) = self.quota_limits.get(tool) {
            let now = self.clock.now();
            let mut windows = self.windows.lock();
            self.quota_window(&mut windows, tool, config, now).consume(now);
        }
    }

    /// Check and reserve both tiers atomically.
    ///
    /// The quota is consulted only after the transport window admits the
    /// call, so a transport denial never touches quota budget. The returned
    /// [`Reservation`] is refunded on drop unless committed.
    pub fn acquire(self: &Arc<Self>, category: &str, tool: &str) -> Result<Reservation, Denial> {
        let now = self.clock.now();
        let mut windows = self.windows.lock();

        let transport = match self.resolve_category(category) {
            Some((key, config)) => {
                let window = self.transport_window(&mut windows, key, config, now);
                let check = window.check(now);
                if !check.allowed {
                    debug!(platform = %self.platform, category = key, "Transport window exhausted");
                    return Err(Denial {
                        scope: key.to_string(),
                        info: check.into(),
                    });
                }
                Some((key.to_string(), check))
            }
            None => None,
        };

        let quota = match self.quota_limits.get(tool) {
            Some(config) => {
                let window = self.quota_window(&mut windows, tool, config, now);
                let check = window.check(now);
                if !check.allowed {
                    debug!(platform = %self.platform, tool, "Quota exhausted");
                    return Err(Denial {
                        scope: format!("quota:{tool}"),
                        info: check.into(),
                    });
                }
                Some(check)
            }
            None => None,
        };

        // Both tiers admit the call: take one unit from each
        let mut info = RateLimitInfo::unlimited();
        let transport_hold = transport.map(|(key, check)| {
            let window = windows.transport.get_mut(&key).map(|w| w.try_take(now));
            info = RateLimitInfo {
                remaining: check.remaining - 1,
                ..RateLimitInfo::from(check)
            };
            (key, window.flatten().unwrap_or_default())
        });
        let quota_hold = quota.map(|check| {
            let generation = windows
                .quotas
                .get_mut(tool)
                .and_then(|w| w.try_take(now))
                .unwrap_or_default();
            if info.reset_at.is_none() {
                info = RateLimitInfo {
                    remaining: check.remaining - 1,
                    ..RateLimitInfo::from(check)
                };
            }
            (tool.to_string(), generation)
        });

        Ok(Reservation {
            governor: Arc::clone(self),
            transport: transport_hold,
            quota: quota_hold,
            info,
            committed: false,
        })
    }

    fn release(&self, transport: Option<&(String, u64)>, quota: Option<&(String, u64)>) {
        let mut windows = self.windows.lock();
        if let Some((key, generation)) = transport {
            if let Some(w) = windows.transport.get_mut(key) {
                w.give_back(*generation);
            }
        }
        if let Some((tool, generation)) = quota {
            if let Some(w) = windows.quotas.get_mut(tool) {
                w.give_back(*generation);
            }
        }
    }

    /// Snapshot of transport windows touched so far, keyed by category
    pub fn snapshot(&self) -> BTreeMap<String, WindowSnapshot> {
        let now = self.clock.now();
        let mut windows = self.windows.lock();
        windows
            .transport
            .iter_mut()
            .map(|(k, w)| {
                w.refresh(now);
                (k.clone(), WindowSnapshot::from(&*w))
            })
            .collect()
    }

    /// Snapshot of quota windows touched so far, keyed by tool
    pub fn quota_snapshot(&self) -> BTreeMap<String, WindowSnapshot> {
        let now = self.clock.now();
        let mut windows = self.windows.lock();
        windows
            .quotas
            .iter_mut()
            .map(|(k, w)| {
                w.refresh(now);
                (k.clone(), WindowSnapshot::from(&*w))
            })
            .collect()
    }

    /// Period of the quota attached to `tool`, if any
    #[must_use]
    pub fn quota_period(&self, tool: &str) -> Option<QuotaPeriod> {
        self.quota_limits.get(tool).map(|q| q.period)
    }
}

/// Budget held for one call between the admission check and dispatch
#[must_use = "dropping a reservation refunds it"]
pub struct Reservation {
    governor: Arc<RateLimitGovernor>,
    transport: Option<(String, u64)>,
    quota: Option<(String, u64)>,
    info: RateLimitInfo,
    committed: bool,
}

impl Reservation {
    /// Budget state after this reservation
    #[must_use]
    pub fn info(&self) -> RateLimitInfo {
        self.info
    }

    /// Keep the reserved budget: the call is being dispatched
    pub fn commit(mut self) -> RateLimitInfo {
        self.committed = true;
        self.info
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.committed {
            self.governor
                .release(self.transport.as_ref(), self.quota.as_ref());
        }
    }
}

mod secs_opt {
    use std::time::Duration;

    use serde::Serializer;

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_f64(d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 4, 10, 9, 0, 0).unwrap(),
        ))
    }

    fn governor(clock: Arc<ManualClock>) -> Arc<RateLimitGovernor> {
        let mut transport = HashMap::new();
        transport.insert("reads".to_string(), WindowConfig::new(2, Duration::from_secs(60)));
        transport.insert("writes".to_string(), WindowConfig::new(5, Duration::from_secs(60)));
        let mut quotas = HashMap::new();
        quotas.insert(
            "create_post".to_string(),
            QuotaConfig {
                limit: 1,
                period: QuotaPeriod::Monthly,
            },
        );
        Arc::new(RateLimitGovernor::new("test", transport, quotas, clock))
    }

    #[test]
    fn unconfigured_category_is_unlimited() {
        let gov = governor(clock());
        let info = gov.check("search");
        assert!(info.allowed);
        assert_eq!(info.reset_at, None);
        gov.acquire("search", "search").unwrap().commit();
    }

    #[test]
    fn default_category_catches_unknown_categories() {
        let mut transport = HashMap::new();
        transport.insert(
            DEFAULT_CATEGORY.to_string(),
            WindowConfig::new(1, Duration::from_secs(60)),
        );
        let gov = Arc::new(RateLimitGovernor::new("t", transport, HashMap::new(), clock()));
        gov.acquire("anything", "a").unwrap().commit();
        let denial = gov.acquire("other", "b").err().unwrap();
        assert_eq!(denial.scope, DEFAULT_CATEGORY);
    }

    #[test]
    fn acquire_denies_when_window_empty() {
        let clock = clock();
        let gov = governor(Arc::clone(&clock));
        assert_eq!(gov.acquire("reads", "list").unwrap().commit().remaining, 1);
        assert_eq!(gov.acquire("reads", "list").unwrap().commit().remaining, 0);

        let denial = gov.acquire("reads", "list").err().unwrap();
        assert_eq!(denial.scope, "reads");
        assert!(!denial.info.allowed);
        assert_eq!(denial.info.remaining, 0);
        assert_eq!(denial.info.retry_after, Some(Duration::from_secs(60)));

        clock.advance(Duration::from_secs(61));
        let info = gov.acquire("reads", "list").unwrap().commit();
        assert_eq!(info.remaining, 1);
    }

    #[test]
    fn dropped_reservation_is_refunded() {
        let gov = governor(clock());
        {
            let _held = gov.acquire("reads", "list").unwrap();
            assert_eq!(gov.check("reads").remaining, 1);
        }
        assert_eq!(gov.check("reads").remaining, 2);
    }

    #[test]
    fn transport_denial_leaves_quota_untouched() {
        let gov = governor(clock());
        gov.consume("writes");
        gov.consume("writes");
        gov.consume("writes");
        gov.consume("writes");
        gov.consume("writes");

        assert!(gov.acquire("writes", "create_post").is_err());
        assert_eq!(gov.check_quota("create_post").remaining, 1);
    }

    #[test]
    fn quota_denial_refunds_nothing_it_did_not_take() {
        let gov = governor(clock());
        gov.acquire("writes", "create_post").unwrap().commit();

        let denial = gov.acquire("writes", "create_post").err().unwrap();
        assert_eq!(denial.scope, "quota:create_post");
        assert_eq!(denial.info.reset_at, Some(Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap()));
        // The transport unit for the denied call was never taken
        assert_eq!(gov.check("writes").remaining, 4);
    }

    #[test]
    fn exhausted_reads_do_not_block_writes() {
        let gov = governor(clock());
        gov.acquire("reads", "list").unwrap().commit();
        gov.acquire("reads", "list").unwrap().commit();
        assert!(gov.acquire("reads", "list").is_err());
        assert!(gov.acquire("writes", "create_post").is_ok());
    }

    #[test]
    fn snapshot_reports_usage() {
        let gov = governor(clock());
        gov.acquire("reads", "list").unwrap().commit();
        let snap = gov.snapshot();
        let reads = &snap["reads"];
        assert_eq!(reads.limit, 2);
        assert_eq!(reads.used, 1);
        assert_eq!(reads.remaining, 1);
    }

    #[test]
    fn concurrent_acquires_never_overspend() {
        let mut transport = HashMap::new();
        transport.insert("posts".to_string(), WindowConfig::new(50, Duration::from_secs(60)));
        let gov = Arc::new(RateLimitGovernor::new("t", transport, HashMap::new(), clock()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gov = Arc::clone(&gov);
                std::thread::spawn(move || {
                    (0..20)
                        .filter(|_| gov.acquire("posts", "p").map(Reservation::commit).is_ok())
                        .count()
                })
            })
            .collect();
        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 50);
        assert_eq!(gov.check("posts").remaining, 0);
    }
}
