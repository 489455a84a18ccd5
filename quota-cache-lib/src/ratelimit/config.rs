use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default length of the upstream's quota window
const DEFAULT_WINDOW: Duration = Duration::from_secs(300);

/// Default number of requests per window, until the upstream tells us otherwise
const DEFAULT_LIMIT: u64 = 300;

/// Default upper bound for a single sleep while waiting for quota
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default wait after a transport failure
const DEFAULT_TRANSPORT_BACKOFF: Duration = Duration::from_secs(1);

/// Default wait after the upstream reported it is temporarily disabled
const DEFAULT_DISABLED_BACKOFF: Duration = Duration::from_secs(30);

/// Default number of retries after an explicit throttle signal
const DEFAULT_MAX_THROTTLE_RETRIES: usize = 3;

/// Default minimum wait after an explicit throttle signal
const DEFAULT_MIN_THROTTLE_WAIT: Duration = Duration::from_secs(10);

/// Rate limiting and retry configuration of the [`crate::RequestGate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Length of the upstream's quota window
    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,

    /// Requests per window assumed before the first reply arrives
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Upper bound for a single sleep while waiting for quota.
    /// Waiters re-check the window after this long, so completed
    /// in-flight requests free up quota early.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Wait after a transport failure before trying again
    #[serde(default = "default_transport_backoff", with = "humantime_serde")]
    pub transport_backoff: Duration,

    /// Wait after the upstream reported it is temporarily disabled
    #[serde(default = "default_disabled_backoff", with = "humantime_serde")]
    pub disabled_backoff: Duration,

    /// Number of retries after an explicit throttle signal before giving up
    #[serde(default = "default_max_throttle_retries")]
    pub max_throttle_retries: usize,

    /// Minimum wait after an explicit throttle signal
    #[serde(default = "default_min_throttle_wait", with = "humantime_serde")]
    pub min_throttle_wait: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            limit: default_limit(),
            poll_interval: default_poll_interval(),
            transport_backoff: default_transport_backoff(),
            disabled_backoff: default_disabled_backoff(),
            max_throttle_retries: default_max_throttle_retries(),
            min_throttle_wait: default_min_throttle_wait(),
        }
    }
}

const fn default_window() -> Duration {
    DEFAULT_WINDOW
}

const fn default_limit() -> u64 {
    DEFAULT_LIMIT
}

const fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

const fn default_transport_backoff() -> Duration {
    DEFAULT_TRANSPORT_BACKOFF
}

const fn default_disabled_backoff() -> Duration {
    DEFAULT_DISABLED_BACKOFF
}

const fn default_max_throttle_retries() -> usize {
    DEFAULT_MAX_THROTTLE_RETRIES
}

const fn default_min_throttle_wait() -> Duration {
    DEFAULT_MIN_THROTTLE_WAIT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rate_limit_config() {
        let config = RateLimitConfig::default();
        assert_eq!(config.window, Duration::from_secs(300));
        assert_eq!(config.limit, 300);
        assert_eq!(config.transport_backoff, Duration::from_secs(1));
        assert_eq!(config.disabled_backoff, Duration::from_secs(30));
        assert_eq!(config.max_throttle_retries, 3);
        assert_eq!(config.min_throttle_wait, Duration::from_secs(10));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: RateLimitConfig = toml::from_str(
            r#"
            window = "1m"
            limit = 120
            "#,
        )
        .unwrap();

        assert_eq!(config.window, Duration::from_secs(60));
        assert_eq!(config.limit, 120);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_config_serialization() {
        let config = RateLimitConfig {
            window: Duration::from_secs(60),
            disabled_backoff: Duration::from_millis(1500),
            ..RateLimitConfig::default()
        };

        let toml = toml::to_string(&config).unwrap();
        let deserialized: RateLimitConfig = toml::from_str(&toml).unwrap();

        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let result = toml::from_str::<RateLimitConfig>("concurrency = 3");
        assert!(result.is_err());
    }
}
