//! Fixed and calendar-aligned rate-limit windows

use std::time::Duration;

use chrono::{DateTime, Datelike, TimeDelta, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{shift, to_delta, until};

/// Calendar period of a quota window (UTC)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaPeriod {
    /// Top of the hour to top of the hour
    Hourly,
    /// Midnight to midnight
    Daily,
    /// First of the month to first of the next month
    Monthly,
}

impl QuotaPeriod {
    /// Start of the period containing `t`
    #[must_use]
    pub fn start_of(self, t: DateTime<Utc>) -> DateTime<Utc> {
        let (y, m, d, h) = match self {
            Self::Hourly => (t.year(), t.month(), t.day(), t.hour()),
            Self::Daily => (t.year(), t.month(), t.day(), 0),
            Self::Monthly => (t.year(), t.month(), 1, 0),
        };
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).single().unwrap_or(t)
    }

    /// Start of the period following the one that starts at `start`
    #[must_use]
    pub fn next_after(self, start: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Hourly => shift(start, TimeDelta::hours(1)),
            Self::Daily => shift(start, TimeDelta::days(1)),
            Self::Monthly => {
                let (y, m) = if start.month() == 12 {
                    (start.year() + 1, 1)
                } else {
                    (start.year(), start.month() + 1)
                };
                Utc.with_ymd_and_hms(y, m, 1, 0, 0, 0)
                    .single()
                    .unwrap_or_else(|| shift(start, TimeDelta::days(31)))
            }
        }
    }
}

/// How a window measures time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    /// Short fixed window starting at first use (e.g. 15 minutes)
    FixedShort(Duration),
    /// Calendar-aligned quota window
    QuotaLong(QuotaPeriod),
}

/// Result of inspecting a window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCheck {
    /// Whether one more call fits
    pub allowed: bool,
    /// Remaining budget
    pub remaining: u32,
    /// When the window resets
    pub reset_at: DateTime<Utc>,
    /// Time until reset, set only when denied
    pub retry_after: Option<Duration>,
}

/// One budget bucket
#[derive(Debug, Clone)]
pub struct RateLimitWindow {
    category: String,
    kind: WindowKind,
    limit: u32,
    remaining: u32,
    window_start: DateTime<Utc>,
    reset_at: DateTime<Utc>,
    /// Bumped on every reset so stale refunds can be ignored
    generation: u64,
}

impl RateLimitWindow {
    /// Open a window at `now`
    #[must_use]
    pub fn new(category: impl Into<String>, kind: WindowKind, limit: u32, now: DateTime<Utc>) -> Self {
        let (window_start, reset_at) = bounds(kind, now);
        Self {
            category: category.into(),
            kind,
            limit,
            remaining: limit,
            window_start,
            reset_at,
            generation: 0,
        }
    }

    /// Category key
    #[must_use]
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Configured limit
    #[must_use]
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Remaining budget as of the last refresh
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Start of the current window
    #[must_use]
    pub fn window_start(&self) -> DateTime<Utc> {
        self.window_start
    }

    /// Reset timestamp of the current window
    #[must_use]
    pub fn reset_at(&self) -> DateTime<Utc> {
        self.reset_at
    }

    /// Window kind
    #[must_use]
    pub fn kind(&self) -> WindowKind {
        self.kind
    }

    /// Current generation
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Reset the window if `now` is past its reset time. Returns `true` on reset.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> bool {
        if now < self.reset_at {
            return false;
        }

        match self.kind {
            WindowKind::FixedShort(len) => {
                // Skip whole windows that elapsed while idle
                let len = to_delta(len).max(TimeDelta::milliseconds(1));
                let elapsed = now - self.reset_at;
                let skipped = elapsed.num_milliseconds() / len.num_milliseconds().max(1);
                let skipped = i32::try_from(skipped).unwrap_or(i32::MAX);
                let skipped = len.checked_mul(skipped).unwrap_or(TimeDelta::MAX);
                self.window_start = shift(self.reset_at, skipped);
                self.reset_at = shift(self.window_start, len);
            }
            WindowKind::QuotaLong(period) => {
                self.window_start = period.start_of(now);
                self.reset_at = period.next_after(self.window_start);
            }
        }

        self.remaining = self.limit;
        self.generation += 1;
        true
    }

    /// Inspect without consuming
    pub fn check(&mut self, now: DateTime<Utc>) -> WindowCheck {
        self.refresh(now);
        let allowed = self.remaining > 0;
        WindowCheck {
            allowed,
            remaining: self.remaining,
            reset_at: self.reset_at,
            retry_after: (!allowed).then(|| until(now, self.reset_at)),
        }
    }

    /// Consume one unit; saturates at zero
    pub fn consume(&mut self, now: DateTime<Utc>) {
        self.refresh(now);
        self.remaining = self.remaining.saturating_sub(1);
    }

    /// Consume one unit if available, returning the generation it was taken from
    pub fn try_take(&mut self, now: DateTime<Utc>) -> Option<u64> {
        self.refresh(now);
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.generation)
    }

    /// Return a unit taken in `generation`; ignored if the window has reset since
    pub fn give_back(&mut self, generation: u64) {
        if generation == self.generation && self.remaining < self.limit {
            self.remaining += 1;
        }
    }
}

fn bounds(kind: WindowKind, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    match kind {
        WindowKind::FixedShort(len) => (now, shift(now, to_delta(len))),
        WindowKind::QuotaLong(period) => {
            let start = period.start_of(now);
            (start, period.next_after(start))
        }
    }
}
