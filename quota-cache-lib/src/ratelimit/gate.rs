use std::future::Future;
use std::sync::Arc;

use secrecy::SecretString;
use tokio::time::{Instant, sleep};

use crate::ratelimit::{Credential, RateLimitConfig, RateWindowTracker, RequestHistory};
use crate::retryable::RetryExt;
use crate::types::Verdict;
use crate::{ErrorKind, Result, UpstreamResponse};

/// Whether a request consumes the shared upstream quota
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Sent with the API key, counted against the quota window
    Credentialed,
    /// Sent without a key, not rate limited by the gate
    Anonymous,
}

/// Wraps every upstream call with quota waiting, in-flight accounting and
/// retries.
///
/// A single gate is shared by all cache tiers: quota belongs to the API key,
/// not to a lookup key, so there is no per-key backoff.
#[derive(Debug, Clone)]
pub struct RequestGate {
    tracker: Arc<RateWindowTracker>,
    history: Arc<RequestHistory>,
    credential: Arc<Credential>,
    config: RateLimitConfig,
}

impl RequestGate {
    /// Create a gate with a fresh quota window
    #[must_use]
    pub fn new(config: RateLimitConfig, api_key: Option<SecretString>) -> Self {
        Self {
            tracker: Arc::new(RateWindowTracker::new(&config)),
            history: Arc::new(RequestHistory::default()),
            credential: Arc::new(Credential::new(api_key)),
            config,
        }
    }

    /// The quota window shared by all credentialed requests
    #[must_use]
    pub fn tracker(&self) -> &Arc<RateWindowTracker> {
        &self.tracker
    }

    /// Timestamps of recent credentialed requests
    #[must_use]
    pub fn history(&self) -> &Arc<RequestHistory> {
        &self.history
    }

    /// The API key sent with credentialed requests
    #[must_use]
    pub fn credential(&self) -> &Arc<Credential> {
        &self.credential
    }

    /// Run `call` until the upstream gives a usable answer.
    ///
    /// `call` performs exactly one upstream request and receives the API key
    /// for [`Access::Credentialed`] requests. Transport failures and a
    /// temporarily disabled upstream are retried indefinitely.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::InvalidCredential`] once the upstream rejected the key.
    ///   The key stays poisoned until [`Credential::replace`].
    /// - [`ErrorKind::MissingCredential`] if no key is configured.
    /// - [`ErrorKind::Throttled`] once more than `max_throttle_retries`
    ///   throttle signals arrived for this call.
    /// - Any error of `call` that is not a transport failure.
    pub async fn execute<F, Fut>(&self, access: Access, mut call: F) -> Result<UpstreamResponse>
    where
        F: FnMut(Option<Arc<SecretString>>) -> Fut,
        Fut: Future<Output = Result<UpstreamResponse>>,
    {
        let credentialed = access == Access::Credentialed;
        let mut throttled = 0;

        loop {
            let (secret, guard) = if credentialed {
                // Fail fast before waiting for quota, and again after the
                // wait in case the key was rejected in the meantime
                self.credential.current()?;
                let guard = self.tracker.acquire().await;
                let secret = self.credential.current()?;
                (Some(secret), Some(guard))
            } else {
                (None, None)
            };

            if credentialed {
                self.history.record();
            }

            let response = match call(secret.clone()).await {
                Ok(response) => response,
                Err(e) if e.should_retry() => {
                    drop(guard);
                    log::warn!(
                        "{e}. Retrying in {}ms",
                        self.config.transport_backoff.as_millis()
                    );
                    sleep(self.config.transport_backoff).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match response.verdict() {
                Verdict::Accept => {
                    if credentialed {
                        if response.quota.is_empty() {
                            self.tracker.consume();
                        } else {
                            self.tracker.update_from_quota(&response.quota);
                        }
                    }
                    return Ok(response);
                }
                Verdict::Disabled => {
                    drop(guard);
                    log::warn!(
                        "{}. Retrying in {}s",
                        ErrorKind::UpstreamDisabled,
                        self.config.disabled_backoff.as_secs()
                    );
                    sleep(self.config.disabled_backoff).await;
                }
                Verdict::InvalidCredential => {
                    drop(guard);
                    if let Some(secret) = &secret {
                        self.credential.poison_if_current(secret);
                    }
                    return Err(ErrorKind::InvalidCredential);
                }
                Verdict::Throttled => {
                    if credentialed {
                        self.tracker.update_from_quota(&response.quota);
                        self.tracker.force_exhausted();
                    }
                    drop(guard);

                    throttled += 1;
                    if throttled > self.config.max_throttle_retries {
                        let error = ErrorKind::Throttled {
                            attempts: throttled,
                        };
                        log::warn!("{error}, giving up");
                        return Err(error);
                    }

                    let wait = if credentialed {
                        self.tracker
                            .reset_at()
                            .saturating_duration_since(Instant::now())
                            .max(self.config.min_throttle_wait)
                    } else {
                        self.config.min_throttle_wait
                    };
                    log::warn!(
                        "Upstream throttled the request (attempt {throttled}), waiting {}s",
                        wait.as_secs()
                    );
                    sleep(wait).await;
                }
            }
        }
    }

    /// Run `call` until it returns something other than a transport failure.
    ///
    /// For collaborators that do not consume the upstream quota, such as the
    /// identity resolver.
    ///
    /// # Errors
    ///
    /// Any error of `call` that is not a transport failure
    pub async fn retry_transport<T, F, Fut>(&self, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            match call().await {
                Err(e) if e.should_retry() => {
                    log::warn!(
                        "{e}. Retrying in {}ms",
                        self.config.transport_backoff.as_millis()
                    );
                    sleep(self.config.transport_backoff).await;
                }
                other => return other,
            }
        }
    }
}
