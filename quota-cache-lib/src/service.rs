//! The layered lookup service.
//!
//! Five cache tiers of different freshness sit in front of one shared
//! [`RequestGate`], plus a tier for global resources that do not belong to
//! any subject. Richer fetches back-fill the cheaper tiers, so a full
//! fetch of a subject also answers basic and identity lookups for it.

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;
use typed_builder::TypedBuilder;

use crate::cache::{CacheStats, CoalescingCache, Fetched};
use crate::ratelimit::{Access, RequestGate};
use crate::upstream::{HttpUpstream, IdentityResolver, Upstream};
use crate::usage::UsageReporter;
use crate::{
    BasicEntity, Config, Detail, DetailLevel, Endpoints, Entity, ErrorKind, Identity, IdentityKey,
    Profile, Relation, RelationKey, RelationSummary, Result, UpstreamRequest, UpstreamResponse,
    sort_by_recency,
};

/// What [`TieredLookupService::lookup`] should return besides the subject
#[derive(TypedBuilder, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[builder(field_defaults(default))]
pub struct LookupOptions {
    /// Return the full state instead of the basic projection
    pub with_detail: bool,
    /// Attach relation summaries
    pub with_relations: bool,
    /// Always fetch the relation index, even if the subject carries a
    /// lightweight relation list
    pub authoritative_relations: bool,
}

/// Counters of every cache tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierStats {
    /// Name or key to identity
    pub identity: CacheStats,
    /// Basic projections
    pub basic: CacheStats,
    /// Full entity state
    pub full: CacheStats,
    /// Relation indexes
    pub relation_index: CacheStats,
    /// Single relations
    pub relation: CacheStats,
    /// Global resources
    pub resource: CacheStats,
}

/// Rate-limited, coalescing lookups of upstream subjects.
///
/// Cloning is cheap: clones share the tiers, the quota window and the
/// credential.
#[derive(Debug, Clone)]
pub struct TieredLookupService {
    gate: RequestGate,
    upstream: Arc<dyn Upstream>,
    resolver: Arc<dyn IdentityResolver>,
    endpoints: Arc<Endpoints>,
    identities: CoalescingCache<String, Identity>,
    basic: CoalescingCache<IdentityKey, BasicEntity>,
    full: CoalescingCache<IdentityKey, Entity>,
    relation_indexes: CoalescingCache<IdentityKey, Vec<RelationSummary>>,
    relations: CoalescingCache<(IdentityKey, RelationKey), Relation>,
    resources: CoalescingCache<String, Value>,
}

impl TieredLookupService {
    /// Create a service with empty tiers and a fresh quota window
    #[must_use]
    pub fn new(
        config: Config,
        upstream: Arc<dyn Upstream>,
        resolver: Arc<dyn IdentityResolver>,
    ) -> Self {
        let Config {
            api_key,
            rate_limit,
            cache,
            endpoints,
            ..
        } = config;

        Self {
            gate: RequestGate::new(rate_limit, api_key),
            upstream,
            resolver,
            endpoints: Arc::new(endpoints),
            identities: CoalescingCache::new("identity", cache.identity),
            basic: CoalescingCache::new("basic", cache.basic),
            full: CoalescingCache::new("full", cache.full),
            relation_indexes: CoalescingCache::new("relation index", cache.relation_index),
            relations: CoalescingCache::new("relation", cache.relation),
            resources: CoalescingCache::new("resource", cache.resource),
        }
    }

    /// Create a service that talks to the upstream at `config.base_url`
    /// over HTTP
    ///
    /// # Errors
    ///
    /// Returns an `Err` if no base URL is configured or the HTTP client
    /// cannot be created
    pub fn with_http(config: Config, resolver: Arc<dyn IdentityResolver>) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| ErrorKind::Config("`base_url` is required for HTTP".to_string()))?;
        let upstream = HttpUpstream::new(base_url, config.timeout)?;
        Ok(Self::new(config, Arc::new(upstream), resolver))
    }

    /// The gate all upstream requests go through
    #[must_use]
    pub const fn gate(&self) -> &RequestGate {
        &self.gate
    }

    /// Resolve a name or a key to an identity.
    ///
    /// # Errors
    ///
    /// Fails if the resolver returns a non-transport error
    pub async fn resolve(&self, text: &str) -> Result<Option<Identity>> {
        let text = text.trim().to_string();
        let cache_key = identity_cache_key(&text);
        let this = self.clone();
        let pending_key = cache_key.clone();

        self.identities
            .get_or_fetch(cache_key, move || async move {
                let resolver = &this.resolver;
                let query = text.as_str();
                let identity = this
                    .gate
                    .retry_transport(move || resolver.resolve(query))
                    .await?;
                if let Some(identity) = &identity {
                    this.store_identity(identity, Some(pending_key.as_str()));
                }
                Ok(Fetched::from(identity))
            })
            .await
    }

    /// Resolve a name or a key to an identity key.
    ///
    /// Text spelled like a key is taken as the key without asking the
    /// resolver, so it is returned even if no such subject exists.
    ///
    /// # Errors
    ///
    /// See [`TieredLookupService::resolve`]
    pub async fn resolve_key(&self, text: &str) -> Result<Option<IdentityKey>> {
        let text = text.trim();
        if IdentityKey::looks_like_key(text) {
            return Ok(Some(IdentityKey::from(text)));
        }
        Ok(self.resolve(text).await?.map(|identity| identity.key))
    }

    /// Full state of `key`, from the full tier or the upstream.
    ///
    /// A fetched entity also fills the basic and identity tiers before any
    /// caller sees it.
    ///
    /// # Errors
    ///
    /// Fatal request gate errors, see [`RequestGate::execute`]
    pub async fn fetch_full(&self, key: &IdentityKey) -> Result<Option<Entity>> {
        let this = self.clone();
        let fetch_key = key.clone();
        self.full
            .get_or_fetch(key.clone(), move || async move {
                this.load_entity(&fetch_key).await
            })
            .await
    }

    /// Basic projection of `key`.
    ///
    /// Served from the basic tier when possible. Otherwise the full entity is
    /// fetched (or an in-flight full fetch joined), which fills both tiers.
    ///
    /// # Errors
    ///
    /// Fatal request gate errors, see [`RequestGate::execute`]
    pub async fn fetch_basic(&self, key: &IdentityKey) -> Result<Option<BasicEntity>> {
        let this = self.clone();
        let fetch_key = key.clone();
        self.basic
            .get_or_fetch(key.clone(), move || async move {
                match this.fetch_full(&fetch_key).await? {
                    Some(entity) => Ok(Fetched::Found(BasicEntity::from(&entity))),
                    None if this.full.is_tombstoned(&fetch_key) => Ok(Fetched::NotFound),
                    None => Ok(Fetched::Unavailable),
                }
            })
            .await
    }

    /// `key` at the given detail level
    ///
    /// # Errors
    ///
    /// Fatal request gate errors, see [`RequestGate::execute`]
    pub async fn fetch_detail(
        &self,
        key: &IdentityKey,
        level: DetailLevel,
    ) -> Result<Option<Detail>> {
        Ok(match level {
            DetailLevel::Basic => self.fetch_basic(key).await?.map(Detail::Basic),
            DetailLevel::Full => self.fetch_full(key).await?.map(Detail::Full),
        })
    }

    /// Relation summaries of `key`, most recently active first.
    ///
    /// Every relation of the index is also stored in the relation tier.
    ///
    /// # Errors
    ///
    /// Fatal request gate errors, see [`RequestGate::execute`]
    pub async fn fetch_relation_index(
        &self,
        key: &IdentityKey,
    ) -> Result<Option<Vec<RelationSummary>>> {
        let this = self.clone();
        let fetch_key = key.clone();
        self.relation_indexes
            .get_or_fetch(key.clone(), move || async move {
                this.load_relation_index(&fetch_key).await
            })
            .await
    }

    /// A single relation of `key`
    ///
    /// # Errors
    ///
    /// Fatal request gate errors, see [`RequestGate::execute`]
    pub async fn fetch_relation(
        &self,
        key: &IdentityKey,
        relation: &RelationKey,
    ) -> Result<Option<Relation>> {
        let this = self.clone();
        let fetch_key = key.clone();
        let relation_key = relation.clone();
        self.relations
            .get_or_fetch((key.clone(), relation.clone()), move || async move {
                this.load_relation(&fetch_key, &relation_key).await
            })
            .await
    }

    /// A relation of `key`, given by its key or its display name.
    ///
    /// Names are matched case-insensitively against the lightweight relation
    /// list and the cached relation index first. The index is only fetched
    /// if neither knows the name. Returns `None` if no relation of `key`
    /// carries that name.
    ///
    /// # Errors
    ///
    /// Fatal request gate errors, see [`RequestGate::execute`]
    pub async fn fetch_relation_by_name(
        &self,
        key: &IdentityKey,
        text: &str,
    ) -> Result<Option<Relation>> {
        let text = text.trim();
        if IdentityKey::looks_like_key(text) {
            return self.fetch_relation(key, &RelationKey::from(text)).await;
        }

        let wanted = text.to_lowercase();
        let cached = self
            .basic
            .get(key)
            .and_then(|basic| basic.relations)
            .and_then(|relations| {
                relations
                    .iter()
                    .map(RelationSummary::from)
                    .find(|summary| has_name(summary, &wanted))
            })
            .or_else(|| {
                self.relation_indexes
                    .get(key)
                    .and_then(|index| index.into_iter().find(|summary| has_name(summary, &wanted)))
            });

        let summary = match cached {
            Some(summary) => summary,
            None => {
                let found = self
                    .fetch_relation_index(key)
                    .await?
                    .and_then(|index| index.into_iter().find(|summary| has_name(summary, &wanted)));
                let Some(summary) = found else {
                    log::debug!("{key} has no relation named {text}");
                    return Ok(None);
                };
                summary
            }
        };

        Ok(self
            .fetch_relation(key, &summary.key)
            .await?
            .map(|mut relation| {
                if relation.name.is_none() {
                    relation.name = summary.name;
                }
                relation
            }))
    }

    /// A global resource at `path`, such as a static catalog.
    ///
    /// Resources are requested without the API key and do not count against
    /// the quota window.
    ///
    /// # Errors
    ///
    /// Fatal request gate errors, see [`RequestGate::execute`]
    pub async fn fetch_resource(&self, path: &str) -> Result<Option<Value>> {
        let this = self.clone();
        let resource = path.to_string();
        self.resources
            .get_or_fetch(path.to_string(), move || async move {
                this.load_resource(&resource).await
            })
            .await
    }

    /// Look up `key` with the detail and relations `options` ask for.
    ///
    /// Returns `None` if the subject does not exist.
    ///
    /// # Errors
    ///
    /// Fatal request gate errors, see [`RequestGate::execute`]
    pub async fn lookup(
        &self,
        key: &IdentityKey,
        options: LookupOptions,
    ) -> Result<Option<Profile>> {
        let level = if options.with_detail {
            DetailLevel::Full
        } else {
            DetailLevel::Basic
        };
        let Some(detail) = self.fetch_detail(key, level).await? else {
            return Ok(None);
        };

        let relations = if options.with_relations {
            Some(self.relation_summaries(key, options).await?)
        } else {
            None
        };

        Ok(Some(Profile { detail, relations }))
    }

    /// Resolve `text` to a key, then [`TieredLookupService::lookup`] it
    ///
    /// # Errors
    ///
    /// See [`TieredLookupService::resolve`] and
    /// [`TieredLookupService::lookup`]
    pub async fn lookup_text(&self, text: &str, options: LookupOptions) -> Result<Option<Profile>> {
        match self.resolve_key(text).await? {
            Some(key) => self.lookup(&key, options).await,
            None => Ok(None),
        }
    }

    /// Remove expired entries from every tier. Returns the number of removed
    /// entries.
    pub fn sweep_expired(&self) -> usize {
        self.identities.sweep()
            + self.basic.sweep()
            + self.full.sweep()
            + self.relation_indexes.sweep()
            + self.relations.sweep()
            + self.resources.sweep()
    }

    /// Sweep expired entries every `interval` in a background task.
    ///
    /// The task keeps the tiers alive until it is aborted.
    #[must_use]
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            // The first tick completes immediately
            ticks.tick().await;
            loop {
                ticks.tick().await;
                let removed = this.sweep_expired();
                if removed > 0 {
                    log::debug!("Background sweep removed {removed} expired entries");
                }
            }
        })
    }

    /// Install a new API key, lifting a previous rejection
    pub fn replace_credential(&self, secret: SecretString) {
        self.gate.credential().replace(secret);
    }

    /// Quota usage of this service
    #[must_use]
    pub fn usage(&self) -> UsageReporter {
        UsageReporter::new(
            Arc::clone(self.gate.tracker()),
            Arc::clone(self.gate.history()),
        )
    }

    /// Counters of every cache tier
    #[must_use]
    pub fn tier_stats(&self) -> TierStats {
        TierStats {
            identity: self.identities.stats(),
            basic: self.basic.stats(),
            full: self.full.stats(),
            relation_index: self.relation_indexes.stats(),
            relation: self.relations.stats(),
            resource: self.resources.stats(),
        }
    }

    async fn relation_summaries(
        &self,
        key: &IdentityKey,
        options: LookupOptions,
    ) -> Result<Vec<RelationSummary>> {
        if !options.authoritative_relations
            && let Some(relations) = self.basic.get(key).and_then(|basic| basic.relations)
        {
            log::debug!("Serving relations of {key} from the lightweight list");
            return Ok(relations.iter().map(RelationSummary::from).collect());
        }
        Ok(self.fetch_relation_index(key).await?.unwrap_or_default())
    }

    /// Send a credentialed request. A reply the upstream client could not
    /// decode is `None`, it is not cached as an absence.
    async fn request(&self, request: UpstreamRequest) -> Result<Option<UpstreamResponse>> {
        let request = &request;
        let upstream = &self.upstream;
        let response = self
            .gate
            .execute(Access::Credentialed, move |secret| async move {
                upstream.request(request, secret.as_deref()).await
            })
            .await;

        match response {
            Ok(response) => Ok(Some(response)),
            Err(ErrorKind::MalformedResponse(e)) => {
                log::warn!("Ignoring unreadable reply from {}: {e}", request.path);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn load_entity(&self, key: &IdentityKey) -> Result<Fetched<Entity>> {
        let request = UpstreamRequest::new(&self.endpoints.entity)
            .param(&self.endpoints.key_param, key.as_str());
        let Some(response) = self.request(request).await? else {
            return Ok(Fetched::Unavailable);
        };

        Ok(match decode::<Entity>(&response, "entity") {
            Ok(Some(entity)) => {
                self.store_projection(&entity);
                Fetched::Found(entity)
            }
            Ok(None) => Fetched::NotFound,
            Err(e) => {
                log::warn!("Ignoring reply for entity {key}: {e}");
                Fetched::Unavailable
            }
        })
    }

    async fn load_relation_index(&self, key: &IdentityKey) -> Result<Fetched<Vec<RelationSummary>>> {
        let request = UpstreamRequest::new(&self.endpoints.relations)
            .param(&self.endpoints.key_param, key.as_str());
        let Some(response) = self.request(request).await? else {
            return Ok(Fetched::Unavailable);
        };

        let relations = match decode::<Vec<Relation>>(&response, "relations") {
            Ok(Some(relations)) => relations,
            Ok(None) => return Ok(Fetched::NotFound),
            Err(e) => {
                log::warn!("Ignoring relation index for {key}: {e}");
                return Ok(Fetched::Unavailable);
            }
        };

        let mut summaries: Vec<_> = relations
            .iter()
            .map(|relation| relation.summary_for(key))
            .collect();
        sort_by_recency(&mut summaries);

        let ttl = self.relations.config().ttl;
        for relation in &relations {
            self.relations
                .set((key.clone(), relation.key.clone()), relation.clone(), ttl);
        }
        log::debug!("Stored {} relations of {key}", relations.len());

        Ok(Fetched::Found(summaries))
    }

    async fn load_relation(
        &self,
        key: &IdentityKey,
        relation: &RelationKey,
    ) -> Result<Fetched<Relation>> {
        let request = UpstreamRequest::new(&self.endpoints.relation)
            .param(&self.endpoints.key_param, key.as_str())
            .param(&self.endpoints.relation_param, relation.as_str());
        let Some(response) = self.request(request).await? else {
            return Ok(Fetched::Unavailable);
        };

        Ok(match decode::<Relation>(&response, "relation") {
            Ok(relation) => Fetched::from(relation),
            Err(e) => {
                log::warn!("Ignoring reply for relation {relation} of {key}: {e}");
                Fetched::Unavailable
            }
        })
    }

    async fn load_resource(&self, path: &str) -> Result<Fetched<Value>> {
        let request = &UpstreamRequest::new(path);
        let upstream = &self.upstream;
        let response = self
            .gate
            .execute(Access::Anonymous, move |_| async move {
                upstream.request(request, None).await
            })
            .await;

        Ok(match response {
            Ok(response) if response.success => Fetched::Found(response.data),
            Ok(response) => {
                log::warn!(
                    "Ignoring resource {path}: {}",
                    response.cause.as_deref().unwrap_or("no cause given")
                );
                Fetched::Unavailable
            }
            Err(ErrorKind::MalformedResponse(e)) => {
                log::warn!("Ignoring unreadable resource {path}: {e}");
                Fetched::Unavailable
            }
            Err(e) => return Err(e),
        })
    }

    /// Back-fill the basic and identity tiers from a full entity
    fn store_projection(&self, entity: &Entity) {
        log::debug!("Back-filling basic and identity tiers for {}", entity.key);
        self.basic.set(
            entity.key.clone(),
            BasicEntity::from(entity),
            self.basic.config().ttl,
        );
        self.store_identity(&Identity::new(entity.key.clone(), entity.name.clone()), None);
    }

    /// Store `identity` under its key and its name, except under `skip`,
    /// which is about to be filled by a pending fetch
    fn store_identity(&self, identity: &Identity, skip: Option<&str>) {
        let ttl = self.identities.config().ttl;
        for cache_key in [
            identity.key.as_str().to_string(),
            identity.name.to_lowercase(),
        ] {
            if skip != Some(cache_key.as_str()) {
                self.identities.set(cache_key, identity.clone(), ttl);
            }
        }
    }
}

/// Identity tier key of a name or key: the normalized key if `text` is
/// spelled like one, otherwise the lower-cased name
fn identity_cache_key(text: &str) -> String {
    if IdentityKey::looks_like_key(text) {
        IdentityKey::from(text).into_string()
    } else {
        text.to_lowercase()
    }
}

fn has_name(summary: &RelationSummary, wanted: &str) -> bool {
    summary
        .name
        .as_deref()
        .is_some_and(|name| name.to_lowercase() == wanted)
}

/// Decode `data[field]` of a successful reply.
/// `null` is a confirmed absence.
fn decode<T: DeserializeOwned>(response: &UpstreamResponse, field: &str) -> Result<Option<T>> {
    if !response.success {
        return Err(ErrorKind::MalformedResponse(format!(
            "upstream reported failure: {}",
            response.cause.as_deref().unwrap_or("no cause given")
        )));
    }
    match response.data.get(field) {
        None => Err(ErrorKind::MalformedResponse(format!(
            "missing field `{field}`"
        ))),
        Some(Value::Null) => Ok(None),
        Some(value) => T::deserialize(value)
            .map(Some)
            .map_err(|e| ErrorKind::MalformedResponse(format!("field `{field}`: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use futures::future::join_all;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::test_utils::{StubResolver, StubUpstream, world_upstream};

    const ALICE: &str = "0a11ce000000000000000000000000aa";
    const BOB: &str = "00b0b000000000000000000000000bbb";

    fn config() -> Config {
        Config {
            api_key: Some(SecretString::from("key".to_string())),
            ..Config::default()
        }
    }

    fn world() -> HashMap<&'static str, Value> {
        HashMap::from([
            (
                ALICE,
                json!({
                    "key": ALICE,
                    "name": "Alice",
                    "last_active": 500,
                    "rank": "gold",
                    "relations": [{"key": "guild", "name": "Guild"}],
                    "relations_full": [
                        {
                            "key": "party",
                            "members": [
                                {"key": ALICE, "last_active": 100},
                                {"key": BOB, "last_active": 900}
                            ]
                        },
                        {
                            "key": "guild",
                            "name": "Guild",
                            "members": [{"key": ALICE, "last_active": 300}]
                        },
                        {
                            "key": "club",
                            "members": [{"key": BOB, "last_active": 50}]
                        }
                    ]
                }),
            ),
            (BOB, json!({"key": BOB, "name": "Bob"})),
        ])
    }

    fn service(upstream: &Arc<StubUpstream>) -> TieredLookupService {
        TieredLookupService::new(
            config(),
            Arc::clone(upstream) as Arc<dyn Upstream>,
            Arc::new(StubResolver::new([
                Identity::new(ALICE, "Alice"),
                Identity::new(BOB, "Bob"),
            ])),
        )
    }

    fn alice() -> IdentityKey {
        IdentityKey::from(ALICE)
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_fetch_fills_basic_tier() {
        let upstream = Arc::new(world_upstream(world()));
        let service = service(&upstream);

        let entity = service.fetch_full(&alice()).await.unwrap().unwrap();
        assert_eq!(entity.name, "Alice");
        assert_eq!(entity.attributes["rank"], "gold");

        let basic = service.fetch_basic(&alice()).await.unwrap().unwrap();
        assert_eq!(basic, BasicEntity::from(&entity));
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_fetch_fills_identity_tier() {
        let upstream = Arc::new(world_upstream(world()));
        let resolver = Arc::new(StubResolver::default());
        let service = TieredLookupService::new(
            config(),
            Arc::clone(&upstream) as Arc<dyn Upstream>,
            Arc::clone(&resolver) as Arc<dyn IdentityResolver>,
        );

        service.fetch_full(&alice()).await.unwrap();
        assert_eq!(service.resolve_key("ALICE").await.unwrap(), Some(alice()));
        assert_eq!(service.resolve_key(ALICE).await.unwrap(), Some(alice()));
        assert_eq!(resolver.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_basic_fetch_fills_full_tier() {
        let upstream = Arc::new(world_upstream(world()));
        let service = service(&upstream);

        let basic = service.fetch_basic(&alice()).await.unwrap().unwrap();
        assert_eq!(basic.name, "Alice");

        service.fetch_full(&alice()).await.unwrap().unwrap();
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_basic_and_full_share_one_request() {
        let upstream =
            Arc::new(world_upstream(world()).with_delay(Duration::from_millis(100)));
        let service = service(&upstream);

        let key = alice();
        let (full, basic) = tokio::join!(service.fetch_full(&key), service.fetch_basic(&key));
        assert!(full.unwrap().is_some());
        assert!(basic.unwrap().is_some());
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_lookups_coalesce() {
        let upstream =
            Arc::new(world_upstream(world()).with_delay(Duration::from_millis(100)));
        let service = service(&upstream);

        let key = alice();
        let results = join_all((0..20).map(|_| service.fetch_full(&key))).await;
        assert!(results.iter().all(|r| r.as_ref().unwrap().is_some()));
        assert_eq!(upstream.calls(), 1);
        assert_eq!(service.tier_stats().full.coalesced, 19);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_tombstoned_until_ttl() {
        let upstream = Arc::new(world_upstream(world()));
        let service = service(&upstream);
        let ghost = IdentityKey::from("ghost");

        assert_eq!(service.fetch_full(&ghost).await, Ok(None));
        assert_eq!(service.fetch_full(&ghost).await, Ok(None));
        assert_eq!(service.fetch_basic(&ghost).await, Ok(None));
        assert_eq!(upstream.calls(), 1);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(service.fetch_full(&ghost).await, Ok(None));
        assert_eq!(upstream.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_reply_is_not_tombstoned() {
        let broken = AtomicBool::new(true);
        let upstream = Arc::new(StubUpstream::new(move |_| {
            if broken.swap(false, Ordering::SeqCst) {
                Ok(UpstreamResponse::ok(json!({"entity": "garbage"})))
            } else {
                Ok(UpstreamResponse::ok(json!({"entity": {"key": ALICE, "name": "Alice"}})))
            }
        }));
        let service = service(&upstream);

        assert_eq!(service.fetch_full(&alice()).await, Ok(None));
        let entity = service.fetch_full(&alice()).await.unwrap();
        assert_eq!(entity.map(|e| e.name), Some("Alice".to_string()));
        assert_eq!(upstream.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relation_index_sorted_by_recency() {
        let upstream = Arc::new(world_upstream(world()));
        let service = service(&upstream);

        let index = service
            .fetch_relation_index(&alice())
            .await
            .unwrap()
            .unwrap();
        let keys: Vec<_> = index.iter().map(|s| s.key.as_str()).collect();
        // Alice's own activity wins over more recent activity of other members
        assert_eq!(keys, vec!["guild", "party", "club"]);
        assert_eq!(index[0].last_active, Some(300));
        assert_eq!(index[2].last_active, Some(50));

        let party = service
            .fetch_relation(&alice(), &RelationKey::from("party"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(party.members.len(), 2);
        assert_eq!(upstream.calls_to("/relation"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_relation_directly() {
        let upstream = Arc::new(world_upstream(world()));
        let service = service(&upstream);

        let club = service
            .fetch_relation(&alice(), &RelationKey::from("club"))
            .await
            .unwrap();
        assert_eq!(club.map(|r| r.members.len()), Some(1));

        let missing = service
            .fetch_relation(&alice(), &RelationKey::from("nope"))
            .await;
        assert_eq!(missing, Ok(None));
        assert_eq!(upstream.calls_to("/relation"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_uses_lightweight_relations() {
        let upstream = Arc::new(world_upstream(world()));
        let service = service(&upstream);

        let options = LookupOptions::builder().with_relations(true).build();
        let profile = service.lookup(&alice(), options).await.unwrap().unwrap();

        assert_eq!(profile.detail.level(), DetailLevel::Basic);
        let relations = profile.relations.unwrap();
        assert_eq!(relations.len(), 1);
        assert_eq!(relations[0].key.as_str(), "guild");
        assert_eq!(upstream.calls_to("/relations"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_with_authoritative_relations() {
        let upstream = Arc::new(world_upstream(world()));
        let service = service(&upstream);

        let options = LookupOptions::builder()
            .with_detail(true)
            .with_relations(true)
            .authoritative_relations(true)
            .build();
        let profile = service.lookup(&alice(), options).await.unwrap().unwrap();

        assert_eq!(profile.detail.level(), DetailLevel::Full);
        assert_eq!(profile.relations.unwrap().len(), 3);
        assert_eq!(upstream.calls_to("/relations"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_without_lightweight_relations_fetches_index() {
        let upstream = Arc::new(world_upstream(world()));
        let service = service(&upstream);

        let options = LookupOptions::builder().with_relations(true).build();
        let profile = service
            .lookup(&IdentityKey::from(BOB), options)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(profile.relations, Some(Vec::new()));
        assert_eq!(upstream.calls_to("/relations"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_text() {
        let upstream = Arc::new(world_upstream(world()));
        let service = service(&upstream);

        let profile = service
            .lookup_text(" bob ", LookupOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(profile.detail.name(), "Bob");
        assert_eq!(profile.relations, None);

        assert_eq!(
            service.lookup_text("nobody", LookupOptions::default()).await,
            Ok(None)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolution_is_cached_under_both_forms() {
        let upstream = Arc::new(world_upstream(world()));
        let resolver = Arc::new(StubResolver::new([Identity::new(BOB, "Bob")]));
        let service = TieredLookupService::new(
            config(),
            Arc::clone(&upstream) as Arc<dyn Upstream>,
            Arc::clone(&resolver) as Arc<dyn IdentityResolver>,
        );

        let dashed = "00b0b000-0000-0000-0000-000000000bbb";
        assert_eq!(
            service.resolve(dashed).await.unwrap().map(|i| i.key),
            Some(IdentityKey::from(BOB))
        );
        assert_eq!(
            service.resolve("BOB").await.unwrap().map(|i| i.name),
            Some("Bob".to_string())
        );
        assert_eq!(resolver.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_text_is_not_resolved() {
        let upstream = Arc::new(world_upstream(world()));
        let resolver = Arc::new(StubResolver::default());
        let service = TieredLookupService::new(
            config(),
            Arc::clone(&upstream) as Arc<dyn Upstream>,
            Arc::clone(&resolver) as Arc<dyn IdentityResolver>,
        );

        assert_eq!(
            service
                .resolve_key(" 00B0B000-0000-0000-0000-000000000BBB ")
                .await
                .unwrap(),
            Some(IdentityKey::from(BOB))
        );
        let profile = service
            .lookup_text(BOB, LookupOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(profile.detail.name(), "Bob");
        assert_eq!(resolver.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_lightweight_list_skips_index() {
        let mut world = world();
        world.insert(BOB, json!({"key": BOB, "name": "Bob", "relations": []}));
        let upstream = Arc::new(world_upstream(world));
        let service = service(&upstream);

        let options = LookupOptions::builder().with_relations(true).build();
        let profile = service
            .lookup(&IdentityKey::from(BOB), options)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(profile.detail.relations(), Some(&[][..]));
        assert_eq!(profile.relations, Some(Vec::new()));
        assert_eq!(upstream.calls_to("/relations"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relation_by_name_from_index() {
        let upstream = Arc::new(world_upstream(world()));
        let service = service(&upstream);

        let guild = service
            .fetch_relation_by_name(&alice(), "GUILD")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(guild.key.as_str(), "guild");
        assert_eq!(guild.name.as_deref(), Some("Guild"));
        assert_eq!(upstream.calls_to("/relations"), 1);
        assert_eq!(upstream.calls_to("/relation"), 0);

        assert_eq!(
            service.fetch_relation_by_name(&alice(), "nobody").await,
            Ok(None)
        );
        assert_eq!(upstream.calls_to("/relations"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relation_by_name_from_lightweight_list() {
        let upstream = Arc::new(world_upstream(world()));
        let service = service(&upstream);

        service.fetch_basic(&alice()).await.unwrap();
        let guild = service
            .fetch_relation_by_name(&alice(), " guild ")
            .await
            .unwrap();
        assert_eq!(guild.map(|r| r.members.len()), Some(1));
        assert_eq!(upstream.calls_to("/relations"), 0);
        assert_eq!(upstream.calls_to("/relation"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_reply_is_not_tombstoned() {
        let unreadable = AtomicUsize::new(2);
        let upstream = Arc::new(StubUpstream::new(move |_| {
            let left = unreadable.load(Ordering::SeqCst);
            if left > 0 {
                unreadable.store(left - 1, Ordering::SeqCst);
                Err(ErrorKind::MalformedResponse("expected value".to_string()))
            } else {
                Ok(UpstreamResponse::ok(json!({"entity": {"key": ALICE, "name": "Alice"}})))
            }
        }));
        let service = service(&upstream);

        assert_eq!(service.fetch_full(&alice()).await, Ok(None));
        // The full tier holds no tombstone, so the basic tier stores none either
        assert_eq!(service.fetch_basic(&alice()).await, Ok(None));
        let basic = service.fetch_basic(&alice()).await.unwrap();
        assert_eq!(basic.map(|b| b.name), Some("Alice".to_string()));
        assert_eq!(upstream.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resources_are_cached_without_quota() {
        let upstream = Arc::new(StubUpstream::new(|request| {
            assert_eq!(request.path, "resources/achievements");
            Ok(UpstreamResponse::ok(json!({"achievements": {"one_time": 3}})))
        }));
        let service = service(&upstream);

        let achievements = service
            .fetch_resource("resources/achievements")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(achievements["achievements"]["one_time"], 3);
        service
            .fetch_resource("resources/achievements")
            .await
            .unwrap();

        assert_eq!(upstream.calls(), 1);
        assert_eq!(service.tier_stats().resource.hits, 1);
        assert_eq!(service.usage().snapshot().requests_last_minute, 0);

        tokio::time::advance(Duration::from_secs(30 * 60)).await;
        service
            .fetch_resource("resources/achievements")
            .await
            .unwrap();
        assert_eq!(upstream.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_credential_fails_fast_for_all_keys() {
        let upstream = Arc::new(StubUpstream::new(|_| {
            Ok(UpstreamResponse::failure("Invalid API key"))
        }));
        let service = service(&upstream);

        assert_eq!(
            service.fetch_full(&alice()).await,
            Err(ErrorKind::InvalidCredential)
        );
        assert_eq!(
            service.fetch_full(&IdentityKey::from(BOB)).await,
            Err(ErrorKind::InvalidCredential)
        );
        assert_eq!(
            service.fetch_relation_index(&alice()).await,
            Err(ErrorKind::InvalidCredential)
        );
        assert_eq!(upstream.calls(), 1);

        service.replace_credential(SecretString::from("fresh".to_string()));
        assert_eq!(
            service.fetch_full(&alice()).await,
            Err(ErrorKind::InvalidCredential)
        );
        assert_eq!(upstream.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_exhaustion_is_fatal() {
        let upstream = Arc::new(StubUpstream::new(|_| Ok(UpstreamResponse::throttled())));
        let service = service(&upstream);

        let result = service.fetch_full(&alice()).await;
        assert_eq!(result, Err(ErrorKind::Throttled { attempts: 4 }));
        assert!(result.unwrap_err().is_fatal());
        assert_eq!(upstream.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_and_usage() {
        let upstream = Arc::new(world_upstream(world()));
        let service = service(&upstream);

        service.fetch_full(&alice()).await.unwrap();
        assert_eq!(service.usage().snapshot().requests_last_minute, 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        // Only the full tier expires after a minute
        assert_eq!(service.sweep_expired(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper() {
        let upstream = Arc::new(world_upstream(world()));
        let service = service(&upstream);
        service.fetch_full(&alice()).await.unwrap();

        let sweeper = service.spawn_sweeper(Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(service.tier_stats().full.lookups(), 1);
        assert!(service.full.is_empty());
        sweeper.abort();
    }

    #[test]
    fn test_identity_cache_key() {
        assert_eq!(identity_cache_key("Alice"), "alice");
        assert_eq!(
            identity_cache_key("00B0B000-0000-0000-0000-000000000BBB"),
            BOB
        );
    }

    #[test]
    fn test_decode() {
        let response = UpstreamResponse::ok(json!({"entity": null}));
        assert_eq!(decode::<Entity>(&response, "entity"), Ok(None));
        assert!(matches!(
            decode::<Entity>(&response, "relation"),
            Err(ErrorKind::MalformedResponse(_))
        ));
        assert!(matches!(
            decode::<Entity>(&UpstreamResponse::failure("Malformed UUID"), "entity"),
            Err(ErrorKind::MalformedResponse(_))
        ));
    }
}
