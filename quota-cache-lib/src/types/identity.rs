use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// A type-safe representation of the canonical key of an upstream subject.
///
/// Keys are normalized to lowercase with `-` separators removed, so the
/// dashed and undashed spelling of the same key address the same entry in
/// every cache tier.
///
/// # Examples
///
/// ```
/// use quota_cache_lib::IdentityKey;
///
/// let key = IdentityKey::from("069A79F4-44E9-4726-A5BE-FCA90E38AAF5");
/// assert_eq!(key.as_str(), "069a79f444e94726a5befca90e38aaf5");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct IdentityKey(String);

impl IdentityKey {
    /// Get the key as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the key as an owned String
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }

    /// Whether `text` is already spelled like a key (32 hex digits, with or
    /// without dashes) rather than a human-readable name
    #[must_use]
    pub fn looks_like_key(text: &str) -> bool {
        let stripped: Vec<char> = text.chars().filter(|c| *c != '-').collect();
        stripped.len() == 32 && stripped.iter().all(char::is_ascii_hexdigit)
    }

    fn normalize(raw: &str) -> String {
        raw.trim()
            .chars()
            .filter(|c| *c != '-')
            .flat_map(char::to_lowercase)
            .collect()
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for IdentityKey {
    fn from(key: String) -> Self {
        IdentityKey(Self::normalize(&key))
    }
}

impl From<&str> for IdentityKey {
    fn from(key: &str) -> Self {
        IdentityKey(Self::normalize(key))
    }
}

impl<'de> Deserialize<'de> for IdentityKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(IdentityKey::from(raw))
    }
}

/// The key of a sub-entity (relation) of an upstream subject
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RelationKey(String);

impl RelationKey {
    /// Get the key as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RelationKey {
    fn from(key: &str) -> Self {
        RelationKey(IdentityKey::normalize(key))
    }
}

impl From<String> for RelationKey {
    fn from(key: String) -> Self {
        RelationKey::from(key.as_str())
    }
}

impl<'de> Deserialize<'de> for RelationKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(RelationKey::from(raw))
    }
}

/// A resolved name/key pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Canonical key of the subject
    pub key: IdentityKey,
    /// Current human-readable name of the subject
    pub name: String,
}

impl Identity {
    /// Create a new identity
    #[must_use]
    pub fn new(key: impl Into<IdentityKey>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
        }
    }
}
