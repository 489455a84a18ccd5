use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::time::Instant;

use crate::ratelimit::{RateWindowTracker, RequestHistory};

/// Read-only view of the quota window and recent request volume
#[derive(Debug, Clone)]
pub struct UsageReporter {
    tracker: Arc<RateWindowTracker>,
    history: Arc<RequestHistory>,
}

/// Point-in-time usage figures
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    /// Requests allowed per window
    pub limit: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// When the current window ends
    #[serde(with = "humantime_serde")]
    pub reset_at: SystemTime,
    /// Time left until the current window ends
    #[serde(with = "humantime_serde")]
    pub reset_in: Duration,
    /// Highest usage observed in the current window
    pub max_observed_usage: u64,
    /// Credentialed requests dispatched during the last minute
    pub requests_last_minute: usize,
    /// Requests dispatched but not yet completed
    pub in_flight: u64,
}

impl UsageReporter {
    /// Report on `tracker` and `history`
    #[must_use]
    pub const fn new(tracker: Arc<RateWindowTracker>, history: Arc<RequestHistory>) -> Self {
        Self { tracker, history }
    }

    /// Current usage figures
    #[must_use]
    pub fn snapshot(&self) -> UsageSnapshot {
        let window = self.tracker.window();
        let reset_in = window.reset_at.saturating_duration_since(Instant::now());
        UsageSnapshot {
            limit: window.limit,
            remaining: window.remaining,
            reset_at: SystemTime::now() + reset_in,
            reset_in,
            max_observed_usage: window.max_observed_usage,
            requests_last_minute: self.history.requests_last_minute(),
            in_flight: window.in_flight,
        }
    }
}

impl UsageSnapshot {
    /// Get human-readable summary of the usage
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{}/{} requests left, window resets in {}s (peak usage {}, {} requests in the last minute, {} in flight)",
            self.remaining,
            self.limit,
            self.reset_in.as_secs(),
            self.max_observed_usage,
            self.requests_last_minute,
            self.in_flight
        )
    }
}
