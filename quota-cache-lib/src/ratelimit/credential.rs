use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use secrecy::SecretString;

use crate::{ErrorKind, Result};

/// The API key shared by all credentialed requests.
///
/// Once the upstream rejects the key, every credentialed request fails fast
/// with [`ErrorKind::InvalidCredential`] until [`Credential::replace`] installs
/// a new one.
#[derive(Debug, Default)]
pub struct Credential {
    secret: RwLock<Option<Arc<SecretString>>>,
    poisoned: AtomicBool,
}

impl Credential {
    /// Create a credential holding `secret`
    #[must_use]
    pub fn new(secret: Option<SecretString>) -> Self {
        Self {
            secret: RwLock::new(secret.map(Arc::new)),
            poisoned: AtomicBool::new(false),
        }
    }

    /// The key to send with the next credentialed request
    ///
    /// # Errors
    ///
    /// Fails if the key was rejected before or none is configured
    pub fn current(&self) -> Result<Arc<SecretString>> {
        if self.is_poisoned() {
            return Err(ErrorKind::InvalidCredential);
        }
        self.secret
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ErrorKind::MissingCredential)
    }

    /// Whether the upstream rejected the current key
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Mark `used` as rejected, unless it was replaced in the meantime
    pub fn poison_if_current(&self, used: &Arc<SecretString>) {
        let secret = self.secret.read().unwrap_or_else(PoisonError::into_inner);
        if secret.as_ref().is_some_and(|current| Arc::ptr_eq(current, used)) {
            self.poisoned.store(true, Ordering::Release);
            log::error!("Upstream rejected the API key, failing all credentialed requests");
        }
    }

    /// Install a new key and lift a previous rejection
    pub fn replace(&self, secret: SecretString) {
        let mut current = self.secret.write().unwrap_or_else(PoisonError::into_inner);
        *current = Some(Arc::new(secret));
        self.poisoned.store(false, Ordering::Release);
        log::info!("API key replaced");
    }
}
