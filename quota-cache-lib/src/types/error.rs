use serde::{Serialize, Serializer};
use std::hash::Hash;
use std::sync::Arc;
use thiserror::Error;

/// Possible errors when looking up data through `quota_cache_lib`
///
/// The type is [`Clone`] because a single failed fetch is handed to every
/// caller that was coalesced onto it.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The upstream could not be reached or the connection broke down.
    /// Retried by the request gate with a fixed backoff.
    #[error("Transport failure while contacting the upstream: {0}")]
    Transport(String),

    /// Reqwest network error
    #[error("Network error while trying to connect to the upstream via reqwest")]
    NetworkRequest(#[source] Arc<reqwest::Error>),

    /// A request that cannot succeed by being repeated, e.g. an invalid URL
    #[error("Invalid upstream request: {0}")]
    InvalidRequest(String),

    /// The upstream reported that it is temporarily disabled
    #[error("The upstream API is temporarily disabled")]
    UpstreamDisabled,

    /// The upstream kept throttling us, even after waiting for the quota
    /// window to reset
    #[error("The upstream throttled the request {attempts} times in a row")]
    Throttled {
        /// Number of throttled attempts, including the first one
        attempts: usize,
    },

    /// The upstream rejected the credential. The credential is poisoned and
    /// every further credentialed request fails fast until it is replaced.
    #[error("The upstream rejected the API key as invalid. Replace the key to resume requests")]
    InvalidCredential,

    /// A credentialed request was attempted without an API key
    #[error("No API key configured. Set `api_key` in the configuration or call `replace_credential`")]
    MissingCredential,

    /// The upstream payload did not have the expected shape
    #[error("Cannot decode upstream response: {0}")]
    MalformedResponse(String),

    /// The fetch function of a coalesced lookup panicked
    #[error("The fetch for this key panicked: {0}")]
    FetchPanicked(String),

    /// The task running a coalesced fetch was dropped before it finished,
    /// e.g. because the runtime shut down
    #[error("The fetch for this key was abandoned before it completed")]
    FetchAbandoned,

    /// The configuration could not be read or parsed
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl ErrorKind {
    /// Whether this error should be surfaced as a service-level failure
    /// rather than a per-key result
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidCredential | Self::MissingCredential | Self::Throttled { .. }
        )
    }

    /// Return the underlying `reqwest` error, if any
    #[must_use]
    pub fn reqwest_error(&self) -> Option<&reqwest::Error> {
        match self {
            Self::NetworkRequest(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl PartialEq for ErrorKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Transport(e1), Self::Transport(e2))
            | (Self::InvalidRequest(e1), Self::InvalidRequest(e2))
            | (Self::MalformedResponse(e1), Self::MalformedResponse(e2))
            | (Self::FetchPanicked(e1), Self::FetchPanicked(e2))
            | (Self::Config(e1), Self::Config(e2)) => e1 == e2,
            (Self::NetworkRequest(e1), Self::NetworkRequest(e2)) => {
                e1.to_string() == e2.to_string()
            }
            (Self::Throttled { attempts: a1 }, Self::Throttled { attempts: a2 }) => a1 == a2,
            (Self::UpstreamDisabled, Self::UpstreamDisabled)
            | (Self::InvalidCredential, Self::InvalidCredential)
            | (Self::MissingCredential, Self::MissingCredential)
            | (Self::FetchAbandoned, Self::FetchAbandoned) => true,
            _ => false,
        }
    }
}

impl Eq for ErrorKind {}

impl Hash for ErrorKind {
    fn hash<H>(&self, state: &mut H)
    where
        H: std::hash::Hasher,
    {
        match self {
            Self::Transport(e)
            | Self::InvalidRequest(e)
            | Self::MalformedResponse(e)
            | Self::FetchPanicked(e)
            | Self::Config(e) => e.hash(state),
            Self::NetworkRequest(e) => e.to_string().hash(state),
            Self::Throttled { attempts } => attempts.hash(state),
            Self::UpstreamDisabled
            | Self::InvalidCredential
            | Self::MissingCredential
            | Self::FetchAbandoned => {
                std::mem::discriminant(self).hash(state);
            }
        }
    }
}

impl Serialize for ErrorKind {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl From<reqwest::Error> for ErrorKind {
    fn from(e: reqwest::Error) -> Self {
        Self::NetworkRequest(Arc::new(e))
    }
}

impl From<tokio::task::JoinError> for ErrorKind {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_panic() {
            Self::FetchPanicked(e.to_string())
        } else {
            Self::FetchAbandoned
        }
    }
}

impl From<toml::de::Error> for ErrorKind {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(e: std::io::Error) -> Self {
        Self::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ErrorKind::InvalidCredential.is_fatal());
        assert!(ErrorKind::Throttled { attempts: 4 }.is_fatal());
        assert!(!ErrorKind::Transport("reset".into()).is_fatal());
        assert!(!ErrorKind::MalformedResponse("eof".into()).is_fatal());
    }

    #[test]
    fn test_serialize_as_display_string() {
        let json = serde_json::to_string(&ErrorKind::Throttled { attempts: 4 }).unwrap();
        assert_eq!(json, "\"The upstream throttled the request 4 times in a row\"");
    }
}
