use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// How far back [`RequestHistory`] looks
const HISTORY_SPAN: Duration = Duration::from_secs(60);

/// Upper bound on retained timestamps, so a burst cannot grow the history
/// without limit
const HISTORY_CAPACITY: usize = 10_000;

/// A rolling window data structure that automatically maintains a maximum size
/// by removing oldest elements when the capacity is exceeded.
#[derive(Debug, Clone)]
pub(crate) struct Window<T> {
    data: VecDeque<T>,
    capacity: usize,
}

impl<T> Window<T> {
    /// Create a new window with the given capacity
    #[must_use]
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Push an element to the window, removing the oldest if at capacity
    pub(crate) fn push(&mut self, item: T) {
        if self.data.len() >= self.capacity {
            self.data.pop_front();
        }
        self.data.push_back(item);
    }

    /// Remove elements from the front while `predicate` holds
    pub(crate) fn drain_front_while(&mut self, mut predicate: impl FnMut(&T) -> bool) {
        while self.data.front().is_some_and(&mut predicate) {
            self.data.pop_front();
        }
    }

    /// Get the number of elements currently in the window
    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }
}

/// Timestamps of recent credentialed requests, for usage reporting.
///
/// The request rate is logged at most once per minute.
#[derive(Debug)]
pub struct RequestHistory {
    timestamps: Mutex<Window<Instant>>,
    last_report: Mutex<Instant>,
}

impl Default for RequestHistory {
    fn default() -> Self {
        Self {
            timestamps: Mutex::new(Window::new(HISTORY_CAPACITY)),
            last_report: Mutex::new(Instant::now()),
        }
    }
}

impl RequestHistory {
    /// Record a request dispatched now
    pub fn record(&self) {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock().unwrap_or_else(PoisonError::into_inner);
        prune(&mut timestamps, now);
        timestamps.push(now);
        let count = timestamps.len();
        drop(timestamps);

        let mut last_report = self.last_report.lock().unwrap_or_else(PoisonError::into_inner);
        if now.saturating_duration_since(*last_report) >= HISTORY_SPAN {
            *last_report = now;
            log::info!("{count} upstream requests in the past minute");
        }
    }

    /// Number of requests recorded during the last minute
    #[must_use]
    pub fn requests_last_minute(&self) -> usize {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock().unwrap_or_else(PoisonError::into_inner);
        prune(&mut timestamps, now);
        timestamps.len()
    }
}

fn prune(timestamps: &mut Window<Instant>, now: Instant) {
    timestamps.drain_front_while(|at| now.saturating_duration_since(*at) >= HISTORY_SPAN);
}
