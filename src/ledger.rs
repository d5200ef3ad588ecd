//! Rolling log of outbound call outcomes
//!
//! A fixed-capacity ring buffer; the oldest record is evicted first.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::{shift, to_delta};

/// Default ring capacity
pub const DEFAULT_CAPACITY: usize = 1000;

/// One call attempt chain, as seen by the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCallRecord {
    /// Call id
    pub id: Uuid,
    /// Tool name
    pub tool: String,
    /// Endpoint path template
    pub endpoint: String,
    /// HTTP method
    pub method: String,
    /// When the call started
    pub timestamp: DateTime<Utc>,
    /// Wall time including retries
    #[serde(with = "crate::config::humantime_serde")]
    pub response_time: Duration,
    /// Final HTTP status, if any response arrived
    pub status_code: Option<u16>,
    /// Call succeeded
    pub success: bool,
    /// Denied by a rate limit before dispatch
    pub rate_limited: bool,
    /// Retries after the first attempt
    pub retry_count: u32,
}

impl ApiCallRecord {
    /// New record with a fresh id
    pub fn new(
        tool: impl Into<String>,
        endpoint: impl Into<String>,
        method: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tool: tool.into(),
            endpoint: endpoint.into(),
            method: method.into(),
            timestamp,
            response_time: Duration::ZERO,
            status_code: None,
            success: false,
            rate_limited: false,
            retry_count: 0,
        }
    }
}

/// Aggregate over the ledger
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerStats {
    /// Records considered
    pub total: usize,
    /// Successful share in [0, 1]; 0 when empty
    pub success_rate: f64,
    /// Mean response time in seconds; 0 when empty
    pub avg_response_time: f64,
    /// Rate-limited records
    pub rate_limited_count: usize,
}

/// Bounded call ledger
#[derive(Debug)]
pub struct CallLedger {
    capacity: usize,
    records: Mutex<VecDeque<ApiCallRecord>>,
}

impl Default for CallLedger {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl CallLedger {
    /// Create a ledger holding at most `capacity` records
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
        }
    }

    /// Append a record, evicting the oldest when full
    pub fn record(&self, record: ApiCallRecord) {
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Aggregate every record, or only those newer than `now - window`
    #[must_use]
    pub fn stats(&self, window: Option<Duration>, now: DateTime<Utc>) -> LedgerStats {
        let cutoff = window.map(|w| shift(now, -to_delta(w)));
        let records = self.records.lock();

        let mut total = 0usize;
        let mut successes = 0usize;
        let mut rate_limited_count = 0usize;
        let mut dispatched = 0usize;
        let mut elapsed = 0f64;
        for record in records.iter().filter(|r| cutoff.is_none_or(|c| r.timestamp >= c)) {
            total += 1;
            successes += usize::from(record.success);
            rate_limited_count += usize::from(record.rate_limited);
            // Denied calls never reached the platform
            if !record.rate_limited {
                dispatched += 1;
                elapsed += record.response_time.as_secs_f64();
            }
        }

        if total == 0 {
            return LedgerStats::default();
        }
        #[allow(clippy::cast_precision_loss)]
        let n = total as f64;
        #[allow(clippy::cast_precision_loss)]
        let success_rate = successes as f64 / n;
        #[allow(clippy::cast_precision_loss)]
        let avg_response_time = if dispatched == 0 {
            0.0
        } else {
            elapsed / dispatched as f64
        };
        LedgerStats {
            total,
            success_rate,
            avg_response_time,
            rate_limited_count,
        }
    }

    /// The `n` most recent records, newest first
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<ApiCallRecord> {
        self.records.lock().iter().rev().take(n).cloned().collect()
    }

    /// Records held
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// No records held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Maximum records held
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
    }

    fn record(tool: &str, at: DateTime<Utc>, success: bool, ms: u64) -> ApiCallRecord {
        ApiCallRecord {
            success,
            response_time: Duration::from_millis(ms),
            status_code: Some(if success { 200 } else { 500 }),
            ..ApiCallRecord::new(tool, "/x", "GET", at)
        }
    }

    #[test]
    fn evicts_oldest_when_full() {
        let ledger = CallLedger::new(3);
        for i in 0..5 {
            ledger.record(record(&format!("t{i}"), t0(), true, 10));
        }
        assert_eq!(ledger.len(), 3);
        let tools: Vec<_> = ledger.recent(10).into_iter().map(|r| r.tool).collect();
        assert_eq!(tools, ["t4", "t3", "t2"]);
    }

    #[test]
    fn empty_stats_are_zero() {
        let stats = CallLedger::default().stats(None, t0());
        assert_eq!(stats, LedgerStats::default());
    }

    #[test]
    fn aggregates_success_and_latency() {
        let ledger = CallLedger::new(10);
        ledger.record(record("a", t0(), true, 100));
        ledger.record(record("a", t0(), true, 300));
        ledger.record(record("a", t0(), false, 200));
        ledger.record(ApiCallRecord {
            rate_limited: true,
            ..ApiCallRecord::new("a", "/x", "GET", t0())
        });

        let stats = ledger.stats(None, t0());
        assert_eq!(stats.total, 4);
        assert!((stats.success_rate - 0.5).abs() < f64::EPSILON);
        assert!((stats.avg_response_time - 0.2).abs() < 1e-9);
        assert_eq!(stats.rate_limited_count, 1);
    }

    #[test]
    fn denials_do_not_dilute_latency() {
        let ledger = CallLedger::new(100);
        ledger.record(record("a", t0(), true, 400));
        for _ in 0..20 {
            ledger.record(ApiCallRecord {
                rate_limited: true,
                ..ApiCallRecord::new("a", "/x", "GET", t0())
            });
        }

        let stats = ledger.stats(None, t0());
        assert_eq!(stats.total, 21);
        assert_eq!(stats.rate_limited_count, 20);
        assert!((stats.avg_response_time - 0.4).abs() < 1e-9);
    }

    #[test]
    fn window_filters_old_records() {
        let ledger = CallLedger::new(10);
        ledger.record(record("old", t0(), false, 10));
        ledger.record(record("new", t0() + TimeDelta::minutes(50), true, 10));

        let now = t0() + TimeDelta::hours(1);
        let stats = ledger.stats(Some(Duration::from_secs(30 * 60)), now);
        assert_eq!(stats.total, 1);
        assert!((stats.success_rate - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn ids_are_unique() {
        let a = ApiCallRecord::new("a", "/", "GET", t0());
        let b = ApiCallRecord::new("a", "/", "GET", t0());
        assert_ne!(a.id, b.id);
    }
}
