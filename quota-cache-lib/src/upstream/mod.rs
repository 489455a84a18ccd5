//! Collaborators that talk to the outside world.
//!
//! The cache never performs network I/O itself. It calls an [`Upstream`] for
//! entity data, through the [`crate::RequestGate`], and an
//! [`IdentityResolver`] to turn names into identity keys.

mod client;

pub use client::{DEFAULT_TIMEOUT, DEFAULT_USER_AGENT, HttpUpstream};

use core::fmt::Debug;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::{Identity, Result, UpstreamRequest, UpstreamResponse};

/// The rate-limited upstream resource
#[async_trait]
pub trait Upstream: Debug + Send + Sync {
    /// Perform exactly one request.
    ///
    /// Replies with `success = false` are not errors: the request gate
    /// interprets their `cause` and `throttle` fields.
    ///
    /// # Errors
    ///
    /// Transport failures are [`crate::ErrorKind::Transport`] or
    /// [`crate::ErrorKind::NetworkRequest`]. Unreadable payloads are
    /// [`crate::ErrorKind::MalformedResponse`].
    async fn request(
        &self,
        request: &UpstreamRequest,
        credential: Option<&SecretString>,
    ) -> Result<UpstreamResponse>;
}

/// Resolves a human-readable name or a key to an [`Identity`]
#[async_trait]
pub trait IdentityResolver: Debug + Send + Sync {
    /// Return `None` if nothing is known by `name_or_key`
    ///
    /// # Errors
    ///
    /// Transport failures, which are retried by the caller
    async fn resolve(&self, name_or_key: &str) -> Result<Option<Identity>>;
}
