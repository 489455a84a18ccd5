use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, sleep};

use crate::QuotaHeaders;
use crate::ratelimit::RateLimitConfig;

/// Number of requests that must be left in the window (after subtracting
/// in-flight requests) before another request may start.
/// Concurrent callers can jointly overshoot by at most one request.
pub const SAFETY_MARGIN: u64 = 2;

/// The upstream's rate limit accounting period, as far as we know it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaWindow {
    /// Requests left in the current window
    pub remaining: u64,
    /// Requests allowed per window, always positive
    pub limit: u64,
    /// When the current window ends
    pub reset_at: Instant,
    /// Requests dispatched but not yet completed
    pub in_flight: u64,
    /// Highest `limit - remaining` observed in the current window
    pub max_observed_usage: u64,
}

/// Tracks the moving quota window of the upstream resource.
///
/// All bookkeeping happens under one mutex that is never held across an
/// `.await`. Header data reported by the upstream always overrides local
/// bookkeeping.
#[derive(Debug)]
pub struct RateWindowTracker {
    window: Mutex<QuotaWindow>,
    window_length: Duration,
    poll_interval: Duration,
}

impl RateWindowTracker {
    /// Create a tracker with a fresh, full window
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        let limit = config.limit.max(1);
        Self {
            window: Mutex::new(QuotaWindow {
                remaining: limit,
                limit,
                reset_at: Instant::now() + config.window,
                in_flight: 0,
                max_observed_usage: 0,
            }),
            window_length: config.window,
            poll_interval: config.poll_interval,
        }
    }

    fn state(&self) -> MutexGuard<'_, QuotaWindow> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a request may be dispatched right now
    #[must_use]
    pub fn can_proceed(&self) -> bool {
        self.wait_duration().is_zero()
    }

    /// How long until a request may be dispatched.
    ///
    /// If the reset instant has passed, the window is optimistically reset
    /// to a full quota first.
    #[must_use]
    pub fn wait_duration(&self) -> Duration {
        let now = Instant::now();
        let mut window = self.state();
        self.roll_over(&mut window, now);
        Self::wait_for(&window, now)
    }

    /// Count a request as dispatched
    pub fn mark_in_flight(&self) {
        self.state().in_flight += 1;
    }

    /// Count a dispatched request as completed, successful or not
    pub fn mark_done(&self) {
        let mut window = self.state();
        window.in_flight = window.in_flight.saturating_sub(1);
    }

    /// Check for quota and count the request as dispatched, atomically.
    ///
    /// Returns a guard that marks the request as done when dropped, or the
    /// time to wait before trying again.
    pub fn try_acquire(&self) -> Result<InFlightGuard<'_>, Duration> {
        let now = Instant::now();
        let mut window = self.state();
        self.roll_over(&mut window, now);
        let wait = Self::wait_for(&window, now);
        if wait.is_zero() {
            window.in_flight += 1;
            Ok(InFlightGuard { tracker: self })
        } else {
            Err(wait)
        }
    }

    /// Wait until quota is available, then count the request as dispatched
    pub async fn acquire(&self) -> InFlightGuard<'_> {
        loop {
            match self.try_acquire() {
                Ok(guard) => return guard,
                Err(wait) => {
                    log::debug!(
                        "Quota exhausted, waiting {}ms before re-checking the window",
                        wait.min(self.poll_interval).as_millis()
                    );
                    sleep(wait.min(self.poll_interval)).await;
                }
            }
        }
    }

    /// Correct the window from the rate limit headers of an upstream reply
    pub fn update_from_headers(
        &self,
        remaining: Option<u64>,
        limit: Option<u64>,
        reset_in_seconds: Option<u64>,
    ) {
        let now = Instant::now();
        let mut window = self.state();
        if let Some(limit) = limit
            && limit > 0
        {
            window.limit = limit;
        }
        if let Some(remaining) = remaining {
            window.remaining = remaining;
        }
        if let Some(seconds) = reset_in_seconds {
            window.reset_at = now + Duration::from_secs(seconds);
        }
        let usage = window.limit.saturating_sub(window.remaining);
        window.max_observed_usage = window.max_observed_usage.max(usage);
    }

    /// Shorthand for [`RateWindowTracker::update_from_headers`]
    pub fn update_from_quota(&self, quota: &QuotaHeaders) {
        self.update_from_headers(quota.remaining, quota.limit, quota.reset_seconds);
    }

    /// Account for one completed request the upstream did not report on
    pub fn consume(&self) {
        let mut window = self.state();
        window.remaining = window.remaining.saturating_sub(1);
        let usage = window.limit.saturating_sub(window.remaining);
        window.max_observed_usage = window.max_observed_usage.max(usage);
    }

    /// Treat the window as used up, e.g. after an explicit throttle signal
    pub fn force_exhausted(&self) {
        let mut window = self.state();
        window.remaining = 0;
        window.max_observed_usage = window.max_observed_usage.max(window.limit);
    }

    /// Start a fresh, full window now
    pub fn reset(&self) {
        let now = Instant::now();
        let mut window = self.state();
        window.remaining = window.limit;
        window.reset_at = now + self.window_length;
        window.max_observed_usage = 0;
    }

    /// When the current window ends
    #[must_use]
    pub fn reset_at(&self) -> Instant {
        self.state().reset_at
    }

    /// A copy of the current window, without rolling it over
    #[must_use]
    pub fn window(&self) -> QuotaWindow {
        *self.state()
    }

    fn roll_over(&self, window: &mut QuotaWindow, now: Instant) {
        if now < window.reset_at {
            return;
        }
        window.remaining = window.limit;
        window.reset_at += self.window_length;
        if window.reset_at <= now {
            window.reset_at = now + self.window_length;
        }
        window.max_observed_usage = 0;
        log::info!(
            "Quota window reset, assuming {} requests are available again",
            window.limit
        );
    }

    fn wait_for(window: &QuotaWindow, now: Instant) -> Duration {
        // A limit below the margin could never be satisfied
        let margin = SAFETY_MARGIN.min(window.limit);
        if window.remaining.saturating_sub(window.in_flight) >= margin {
            Duration::ZERO
        } else {
            window.reset_at.saturating_duration_since(now)
        }
    }
}

/// RAII guard for a dispatched request.
/// Dropping it marks the request as done on its [`RateWindowTracker`].
#[derive(Debug)]
pub struct InFlightGuard<'a> {
    tracker: &'a RateWindowTracker,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.tracker.mark_done();
    }
}
