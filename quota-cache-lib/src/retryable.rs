use std::io;

use crate::ErrorKind;

/// An extension trait to help determine if a failed upstream request
/// is worth repeating.
///
/// Inspired by `Retryable` from
/// [reqwest-middleware](https://github.com/TrueLayer/reqwest-middleware/blob/f854725791ccf4a02c401a26cab3d9db753f468c/reqwest-retry/src/retryable.rs)
pub(crate) trait RetryExt {
    fn should_retry(&self) -> bool;
}

impl RetryExt for reqwest::Error {
    fn should_retry(&self) -> bool {
        if self.is_timeout() || self.is_connect() {
            true
        } else if self.is_body() || self.is_decode() || self.is_builder() || self.is_redirect() {
            false
        } else if self.is_request() {
            // hyper::Error(IncompleteMessage) is not correctly handled by reqwest,
            // so check whether the error originated in hyper and map it consistently.
            if let Some(hyper_error) = get_source_error_type::<hyper::Error>(self) {
                // IncompleteMessage: the connection was cut halfway through the reply.
                // Canceled: the connection was gracefully closed by the upstream.
                if hyper_error.is_incomplete_message() || hyper_error.is_canceled() {
                    true
                } else if let Some(io_error) = get_source_error_type::<io::Error>(hyper_error) {
                    classify_io_error(io_error)
                } else {
                    false
                }
            } else {
                false
            }
        } else {
            false
        }
    }
}

impl RetryExt for ErrorKind {
    fn should_retry(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::NetworkRequest(e) => e.should_retry(),
            _ => false,
        }
    }
}

/// Classifies an io::Error into retryable or not.
fn classify_io_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::TimedOut
    )
}

/// Downcasts the given err source into T.
fn get_source_error_type<T: std::error::Error + 'static>(
    err: &dyn std::error::Error,
) -> Option<&T> {
    let mut source = err.source();

    while let Some(err) = source {
        if let Some(typed) = err.downcast_ref::<T>() {
            return Some(typed);
        }

        source = err.source();
    }
    None
}
