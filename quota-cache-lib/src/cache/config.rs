use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default capacity of the full-detail tier
const DEFAULT_FULL_CAPACITY: usize = 10_000;

/// Freshness and size settings of one cache tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TierConfig {
    /// How long a resolved value stays fresh
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// How long an explicit "not found" stays fresh.
    /// Defaults to `ttl`.
    #[serde(default, with = "humantime_serde")]
    pub negative_ttl: Option<Duration>,

    /// Maximum number of entries before the least recently read one is
    /// evicted. Unbounded if unset.
    #[serde(default)]
    pub capacity: Option<usize>,
}

impl TierConfig {
    /// An unbounded tier with the same TTL for values and tombstones
    #[must_use]
    pub const fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            negative_ttl: None,
            capacity: None,
        }
    }

    /// Bound the tier to `capacity` entries
    #[must_use]
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Use a separate TTL for tombstones
    #[must_use]
    pub const fn with_negative_ttl(mut self, negative_ttl: Duration) -> Self {
        self.negative_ttl = Some(negative_ttl);
        self
    }

    /// TTL of tombstones
    #[must_use]
    pub fn negative_ttl(&self) -> Duration {
        self.negative_ttl.unwrap_or(self.ttl)
    }
}

/// Settings of all cache tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Name or key to identity
    #[serde(default = "default_identity")]
    pub identity: TierConfig,

    /// Basic projection of an entity
    #[serde(default = "default_basic")]
    pub basic: TierConfig,

    /// Full entity state, the highest-traffic tier
    #[serde(default = "default_full")]
    pub full: TierConfig,

    /// Relation summaries of an entity
    #[serde(default = "default_relation_index")]
    pub relation_index: TierConfig,

    /// Single relations
    #[serde(default = "default_relation")]
    pub relation: TierConfig,

    /// Global resources that change rarely
    #[serde(default = "default_resource")]
    pub resource: TierConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            identity: default_identity(),
            basic: default_basic(),
            full: default_full(),
            relation_index: default_relation_index(),
            relation: default_relation(),
            resource: default_resource(),
        }
    }
}

const fn default_identity() -> TierConfig {
    TierConfig::new(Duration::from_secs(24 * 60 * 60))
}

const fn default_basic() -> TierConfig {
    TierConfig::new(Duration::from_secs(60 * 60))
}

const fn default_full() -> TierConfig {
    TierConfig::new(Duration::from_secs(60)).with_capacity(DEFAULT_FULL_CAPACITY)
}

const fn default_relation_index() -> TierConfig {
    TierConfig::new(Duration::from_secs(5 * 60))
}

const fn default_relation() -> TierConfig {
    TierConfig::new(Duration::from_secs(5 * 60))
}

const fn default_resource() -> TierConfig {
    TierConfig::new(Duration::from_secs(30 * 60))
}
