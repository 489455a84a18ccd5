use serde_json::Value;

/// One request against the upstream resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamRequest {
    /// Endpoint path, relative to the upstream base URL
    pub path: String,
    /// Query parameters
    pub params: Vec<(String, String)>,
}

impl UpstreamRequest {
    /// Create a request for `path` without parameters
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            params: Vec::new(),
        }
    }

    /// Add a query parameter
    #[must_use]
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    /// Look up the value of a query parameter
    #[must_use]
    pub fn get_param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Rate limit information reported by the upstream alongside a reply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaHeaders {
    /// Requests left in the current window
    pub remaining: Option<u64>,
    /// Requests allowed per window
    pub limit: Option<u64>,
    /// Seconds until the current window resets
    pub reset_seconds: Option<u64>,
}

impl QuotaHeaders {
    /// Whether the upstream sent any rate limit information at all
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.remaining.is_none() && self.limit.is_none() && self.reset_seconds.is_none()
    }
}

/// A decoded reply of the upstream resource
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpstreamResponse {
    /// Whether the upstream reported success
    pub success: bool,
    /// Payload, without the `success`/`cause`/`throttle` envelope fields
    pub data: Value,
    /// Failure reason reported by the upstream
    pub cause: Option<String>,
    /// Whether the upstream explicitly throttled this request
    pub throttle: bool,
    /// Rate limit headers of the reply
    pub quota: QuotaHeaders,
}

/// How the request gate interprets an [`UpstreamResponse`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Hand the reply to the caller
    Accept,
    /// Explicitly throttled
    Throttled,
    /// The upstream is temporarily disabled
    Disabled,
    /// The credential was rejected
    InvalidCredential,
}

impl UpstreamResponse {
    /// A successful reply carrying `data`
    #[must_use]
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data,
            ..Self::default()
        }
    }

    /// A failed reply with the given cause
    #[must_use]
    pub fn failure(cause: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            cause: Some(cause.into()),
            ..Self::default()
        }
    }

    /// A throttled reply
    #[must_use]
    pub fn throttled() -> Self {
        Self {
            success: false,
            throttle: true,
            cause: Some("Key throttle".to_string()),
            ..Self::default()
        }
    }

    /// Attach rate limit headers
    #[must_use]
    pub const fn with_quota(mut self, quota: QuotaHeaders) -> Self {
        self.quota = quota;
        self
    }

    pub(crate) fn verdict(&self) -> Verdict {
        if self.throttle {
            return Verdict::Throttled;
        }
        if self.success {
            return Verdict::Accept;
        }
        let cause = self.cause.as_deref().unwrap_or_default().to_lowercase();
        if cause.contains("invalid api key") || cause.contains("invalid key") {
            Verdict::InvalidCredential
        } else if cause.contains("temporarily disabled") {
            Verdict::Disabled
        } else {
            Verdict::Accept
        }
    }
}
