use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::{Value, json};

use crate::upstream::{IdentityResolver, Upstream};
use crate::{Identity, Result, UpstreamRequest, UpstreamResponse};

#[macro_export]
/// Creates a mock web server, which responds with a predefined status when
/// handling a matching request
macro_rules! mock_server {
    ($status:expr $(, $func:tt ($($arg:expr),*))*) => {{
        let mock_server = wiremock::MockServer::start().await;
        let response_template = wiremock::ResponseTemplate::new($status);
        let template = response_template$(.$func($($arg),*))*;
        wiremock::Mock::given(wiremock::matchers::method("GET")).respond_with(template).mount(&mock_server).await;
        mock_server
    }};
}

type Handler = Box<dyn Fn(&UpstreamRequest) -> Result<UpstreamResponse> + Send + Sync>;

/// Scripted [`Upstream`] that records every request it receives
pub(crate) struct StubUpstream {
    handler: Handler,
    delay: Duration,
    requests: Mutex<Vec<UpstreamRequest>>,
}

impl std::fmt::Debug for StubUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StubUpstream")
            .field("delay", &self.delay)
            .field("calls", &self.calls())
            .finish_non_exhaustive()
    }
}

impl StubUpstream {
    pub(crate) fn new(
        handler: impl Fn(&UpstreamRequest) -> Result<UpstreamResponse> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer every request after `delay`, so concurrent lookups overlap
    pub(crate) const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub(crate) fn calls_to(&self, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request.path == path)
            .count()
    }
}

#[async_trait]
impl Upstream for StubUpstream {
    async fn request(
        &self,
        request: &UpstreamRequest,
        _credential: Option<&SecretString>,
    ) -> Result<UpstreamResponse> {
        self.requests.lock().unwrap().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.handler)(request)
    }
}

/// [`IdentityResolver`] over a fixed list of identities
#[derive(Debug, Default)]
pub(crate) struct StubResolver {
    identities: Vec<Identity>,
    calls: Mutex<usize>,
}

impl StubResolver {
    pub(crate) fn new(identities: impl IntoIterator<Item = Identity>) -> Self {
        Self {
            identities: identities.into_iter().collect(),
            calls: Mutex::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl IdentityResolver for StubResolver {
    async fn resolve(&self, name_or_key: &str) -> Result<Option<Identity>> {
        *self.calls.lock().unwrap() += 1;
        let wanted = name_or_key.to_lowercase();
        let wanted_key = crate::IdentityKey::from(name_or_key);
        Ok(self
            .identities
            .iter()
            .find(|identity| identity.name.to_lowercase() == wanted || identity.key == wanted_key)
            .cloned())
    }
}

/// An upstream that knows the entities in `world`, keyed by identity key.
///
/// Serves the default [`crate::Endpoints`]: `/entity?key=`, `/relations?key=`
/// and `/relation?key=&relation=`. Relations are listed under
/// `world[key]["relations_full"]`.
pub(crate) fn world_upstream(world: HashMap<&'static str, Value>) -> StubUpstream {
    StubUpstream::new(move |request| {
        let key = request.get_param("key").unwrap_or_default();
        let entity = world.get(key);
        let data = match request.path.as_str() {
            "/entity" => json!({ "entity": entity.map(strip_relations) }),
            "/relations" => json!({ "relations": entity.map(|e| e["relations_full"].clone()) }),
            "/relation" => {
                let wanted = request.get_param("relation").unwrap_or_default();
                let relation = entity.and_then(|e| {
                    e["relations_full"]
                        .as_array()
                        .and_then(|all| all.iter().find(|r| r["key"] == wanted).cloned())
                });
                json!({ "relation": relation })
            }
            other => panic!("unexpected path {other}"),
        };
        Ok(UpstreamResponse::ok(data))
    })
}

fn strip_relations(entity: &Value) -> Value {
    let mut entity = entity.clone();
    if let Some(object) = entity.as_object_mut() {
        object.remove("relations_full");
    }
    entity
}
