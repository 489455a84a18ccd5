use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderValue, StatusCode, header};
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value};

use super::Upstream;
use crate::ratelimit::parse_quota_headers;
use crate::{ErrorKind, Result, UpstreamRequest, UpstreamResponse};

/// Default timeout of a single upstream request
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default user agent, `quota-cache-<PKG_VERSION>`
pub const DEFAULT_USER_AGENT: &str = concat!("quota-cache/", env!("CARGO_PKG_VERSION"));

/// Header that carries the API key
const API_KEY_HEADER: &str = "api-key";

/// [`Upstream`] over HTTP with a JSON envelope
/// `{ "success": bool, "cause": string?, "throttle": bool?, ...data }`
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpUpstream {
    /// Create a client for the API at `base_url`
    ///
    /// # Errors
    ///
    /// Returns an `Err` if:
    /// - `base_url` cannot have paths appended, e.g. `mailto:` URLs.
    /// - The request client cannot be created.
    ///   See [here](https://docs.rs/reqwest/latest/reqwest/struct.ClientBuilder.html#errors).
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self> {
        if base_url.cannot_be_a_base() {
            return Err(ErrorKind::Config(format!(
                "Upstream URL {base_url} cannot be used as a base URL"
            )));
        }

        let client = reqwest::ClientBuilder::new()
            .gzip(true)
            .user_agent(DEFAULT_USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| ErrorKind::Config(format!("Cannot build HTTP client: {e}")))?;

        Ok(Self { client, base_url })
    }

    /// The URL `request` is sent to
    #[must_use]
    pub fn url_for(&self, request: &UpstreamRequest) -> Url {
        let mut url = self.base_url.clone();
        let path = format!(
            "{}/{}",
            url.path().trim_end_matches('/'),
            request.path.trim_start_matches('/')
        );
        url.set_path(&path);
        if !request.params.is_empty() {
            url.query_pairs_mut().extend_pairs(&request.params);
        }
        url
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn request(
        &self,
        request: &UpstreamRequest,
        credential: Option<&SecretString>,
    ) -> Result<UpstreamResponse> {
        let url = self.url_for(request);
        log::debug!("Requesting {}", request.path);

        let mut builder = self.client.get(url).header(header::ACCEPT, "application/json");
        if let Some(secret) = credential {
            let mut value = HeaderValue::from_str(secret.expose_secret()).map_err(|_| {
                ErrorKind::InvalidRequest("API key is not a valid header value".to_string())
            })?;
            value.set_sensitive(true);
            builder = builder.header(API_KEY_HEADER, value);
        }

        let response = builder.send().await?;
        let status = response.status();
        let quota = parse_quota_headers(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|e| ErrorKind::Transport(format!("Cannot read upstream reply: {e}")))?;

        decode_envelope(status, &body).map(|decoded| decoded.with_quota(quota))
    }
}

/// Decode the JSON envelope, whatever the status code.
///
/// Bodies that are not a JSON object are transport failures on 5xx replies,
/// throttle signals on 429 replies and malformed otherwise.
fn decode_envelope(status: StatusCode, body: &[u8]) -> Result<UpstreamResponse> {
    let object = match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(object)) => object,
        Ok(_) | Err(_) if status == StatusCode::TOO_MANY_REQUESTS => {
            return Ok(UpstreamResponse::throttled());
        }
        Ok(_) | Err(_) if status.is_server_error() => {
            return Err(ErrorKind::Transport(format!(
                "Upstream replied {status} without a JSON body"
            )));
        }
        Ok(other) => {
            return Err(ErrorKind::MalformedResponse(format!(
                "Expected a JSON object, got {other}"
            )));
        }
        Err(e) => return Err(ErrorKind::MalformedResponse(e.to_string())),
    };
    Ok(split_envelope(status, object))
}

fn split_envelope(status: StatusCode, mut object: Map<String, Value>) -> UpstreamResponse {
    let success = object
        .remove("success")
        .and_then(|value| value.as_bool())
        .unwrap_or_else(|| status.is_success());
    let cause = match object.remove("cause") {
        Some(Value::String(cause)) => Some(cause),
        _ => None,
    };
    let throttle = object
        .remove("throttle")
        .and_then(|value| value.as_bool())
        .unwrap_or_default()
        || status == StatusCode::TOO_MANY_REQUESTS;

    UpstreamResponse {
        success,
        data: Value::Object(object),
        cause,
        throttle,
        ..UpstreamResponse::default()
    }
}
