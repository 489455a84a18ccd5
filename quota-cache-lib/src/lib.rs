//! `quota_cache_lib` puts a layered, rate-limited cache in front of a
//! quota-metered lookup API.
//!
//! Concurrent lookups of the same key share a single upstream request,
//! every credentialed request waits for room in the reported quota window,
//! and richer replies back-fill the cheaper cache tiers.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use quota_cache_lib::{
//!     Config, Identity, IdentityResolver, LookupOptions, Result, TieredLookupService,
//! };
//!
//! #[derive(Debug)]
//! struct NoResolver;
//!
//! #[async_trait]
//! impl IdentityResolver for NoResolver {
//!     async fn resolve(&self, _name_or_key: &str) -> Result<Option<Identity>> {
//!         Ok(None)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load("quota-cache.toml")?;
//!     let service = TieredLookupService::with_http(config, Arc::new(NoResolver))?;
//!
//!     let key = "069a79f444e94726a5befca90e38aaf5".into();
//!     let options = LookupOptions::builder().with_relations(true).build();
//!     if let Some(profile) = service.lookup(&key, options).await? {
//!         println!("{}", profile.detail.name());
//!     }
//!     println!("{}", service.usage().snapshot().summary());
//!     Ok(())
//! }
//! ```

mod cache;
mod config;
mod retryable;
mod service;
mod types;
mod usage;

pub mod ratelimit;
pub mod upstream;
#[cfg(test)]
#[macro_use]
pub mod test_utils;

pub use cache::{CacheConfig, CacheStats, CoalescingCache, Fetched, TierConfig};
pub use config::{Config, Endpoints};
pub use ratelimit::{Access, Credential, RateLimitConfig, RateWindowTracker, RequestGate};
pub use service::{LookupOptions, TierStats, TieredLookupService};
pub use types::*;
pub use upstream::{HttpUpstream, IdentityResolver, Upstream};
pub use usage::{UsageReporter, UsageSnapshot};
