//! Configuration of a [`crate::TieredLookupService`], loadable from TOML.
//!
//! ```toml
//! api_key = "..."
//! base_url = "https://api.example.com/v2/"
//! timeout = "10s"
//!
//! [rate_limit]
//! window = "5m"
//! limit = 300
//!
//! [cache.full]
//! ttl = "1m"
//! capacity = 10000
//! ```

use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

use crate::upstream::DEFAULT_TIMEOUT;
use crate::{CacheConfig, RateLimitConfig, Result};

/// Root configuration
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// API key sent with every credentialed request
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub api_key: Option<SecretString>,

    /// Base URL of the upstream API, for [`crate::HttpUpstream`]
    #[serde(default)]
    pub base_url: Option<Url>,

    /// Timeout of a single upstream request
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Quota window and retry settings
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Freshness and size of the cache tiers
    #[serde(default)]
    pub cache: CacheConfig,

    /// Upstream endpoint paths and parameter names
    #[serde(default)]
    pub endpoints: Endpoints,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            timeout: default_timeout(),
            rate_limit: RateLimitConfig::default(),
            cache: CacheConfig::default(),
            endpoints: Endpoints::default(),
        }
    }
}

impl Config {
    /// Parse a configuration from TOML
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or contains unknown fields
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        Ok(toml::from_str(toml)?)
    }

    /// Read and parse a TOML configuration file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }
}

const fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn deserialize_secret<'de, D>(deserializer: D) -> std::result::Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
}

/// Upstream endpoint paths and their query parameter names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Endpoints {
    /// Full state of a subject, replies `{"entity": Entity | null}`
    pub entity: String,
    /// Relations of a subject, replies `{"relations": [Relation] | null}`
    pub relations: String,
    /// A single relation, replies `{"relation": Relation | null}`
    pub relation: String,
    /// Query parameter carrying the identity key
    pub key_param: String,
    /// Query parameter carrying the relation key
    pub relation_param: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            entity: "/entity".to_string(),
            relations: "/relations".to_string(),
            relation: "/relation".to_string(),
            key_param: "key".to_string(),
            relation_param: "relation".to_string(),
        }
    }
}
