//! Quota accounting and retry control for the upstream resource.
//!
//! The upstream meters requests per API key in a moving window and reports
//! its view of the window in response headers. Every credentialed request
//! funnels through one [`RequestGate`], which makes the quota window the
//! single backpressure point of the crate.
//!
//! # Architecture
//!
//! - [`RateWindowTracker`]: local model of the upstream's quota window
//! - [`RequestGate`]: waits for quota, retries transient failures and
//!   escalates fatal ones
//! - [`Credential`]: the shared API key, poisoned once the upstream rejects it
//! - [`RequestHistory`]: timestamps of recent requests, for usage reporting
//! - [`RateLimitConfig`]: window and backoff settings

mod config;
mod credential;
mod gate;
mod headers;
mod history;
mod window;

pub use config::RateLimitConfig;
pub use credential::Credential;
pub use gate::{Access, RequestGate};
pub(crate) use headers::parse_quota_headers;
pub use history::RequestHistory;
pub use window::{InFlightGuard, QuotaWindow, RateWindowTracker, SAFETY_MARGIN};
