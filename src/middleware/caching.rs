//! Response-caching middleware.
//!
//! Rules match by path/method glob and priority; the cache key combines a
//! configurable prefix, the rule scope, method, path, a stable hash of the
//! query map and a stable hash of the configured vary headers. Cached
//! bodies live in the cache coordinator under the `http_cache` namespace
//! (or whatever prefix is configured).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{glob_match, Middleware, MiddlewareConfig, MiddlewareContext, MiddlewareResult};
use crate::coordinator::CacheCoordinator;
use crate::key::{CacheKey, CacheValue};

/// Lookup/fill behavior of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachingStrategy {
    NoCache,
    /// Serve only from cache; a miss is a 404.
    CacheOnly,
    CacheFirst,
    NetworkFirst,
    /// Serve stale entries within a grace window and mark the request for
    /// asynchronous revalidation.
    StaleWhileRevalidate,
}

/// Dimension mixed into the cache key beyond method/path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheScope {
    Global,
    User,
    Session,
    Ip,
    Endpoint,
    Custom(String),
}

/// One caching rule.
#[derive(Debug, Clone)]
pub struct CacheRule {
    pub rule_id: String,
    pub path_pattern: String,
    pub method_pattern: String,
    pub strategy: CachingStrategy,
    pub scope: CacheScope,
    pub ttl: Duration,
    /// Header names whose values partition the cache.
    pub vary_headers: Vec<String>,
    pub cacheable_status_codes: Vec<u16>,
    pub priority: i32,
    pub enabled: bool,
}

impl CacheRule {
    #[must_use]
    pub fn new(rule_id: impl Into<String>, path_pattern: impl Into<String>, ttl: Duration) -> Self {
        Self {
            rule_id: rule_id.into(),
            path_pattern: path_pattern.into(),
            method_pattern: "GET".to_string(),
            strategy: CachingStrategy::CacheFirst,
            scope: CacheScope::Global,
            ttl,
            vary_headers: Vec::new(),
            cacheable_status_codes: vec![200, 301, 302, 304],
            priority: 0,
            enabled: true,
        }
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: CachingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_scope(mut self, scope: CacheScope) -> Self {
        self.scope = scope;
        self
    }

    #[must_use]
    pub fn with_vary_headers(mut self, headers: Vec<String>) -> Self {
        self.vary_headers = headers;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn matches(&self, method: &str, path: &str) -> bool {
        self.enabled
            && glob_match(&self.path_pattern, path)
            && (self.method_pattern == "*"
                || self.method_pattern.eq_ignore_ascii_case(method)
                || glob_match(&self.method_pattern, method))
    }

    #[must_use]
    pub fn should_cache_response(&self, status_code: u16) -> bool {
        self.cacheable_status_codes.contains(&status_code)
    }
}

/// Serialized form of a cached response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedResponse {
    status_code: u16,
    content_type: String,
    #[serde(with = "serde_bytes")]
    body: Vec<u8>,
    stored_at: DateTime<Utc>,
    fresh_ttl_secs: u64,
}

impl CachedResponse {
    fn freshness(&self) -> Freshness {
        let age = (Utc::now() - self.stored_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if age.as_secs() < self.fresh_ttl_secs {
            Freshness::Fresh
        } else {
            Freshness::Stale
        }
    }

    fn remaining_fresh_secs(&self) -> u64 {
        let age = (Utc::now() - self.stored_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.fresh_ttl_secs.saturating_sub(age.as_secs())
    }
}

enum Freshness {
    Fresh,
    Stale,
}

/// Caching middleware behavior options.
#[derive(Debug, Clone)]
pub struct CachingSettings {
    /// Namespace of cached responses inside the coordinator.
    pub key_prefix: String,
    /// Upper bound on any computed TTL.
    pub max_ttl: Duration,
    /// How long past expiry stale-while-revalidate may still serve.
    pub stale_grace: Duration,
    pub skip_paths: Vec<String>,
    /// Methods never cached.
    pub skip_methods: Vec<String>,
}

impl Default for CachingSettings {
    fn default() -> Self {
        Self {
            key_prefix: "http_cache".to_string(),
            max_ttl: Duration::from_secs(86_400),
            stale_grace: Duration::from_secs(60),
            skip_paths: Vec::new(),
            skip_methods: vec!["POST".into(), "PUT".into(), "DELETE".into()],
        }
    }
}

fn short_hash(input: &str) -> String {
    let digest = format!("{:x}", md5::compute(input.as_bytes()));
    digest.chars().take(8).collect()
}

/// Parse `Cache-Control: ... max-age=N ...`.
fn parse_max_age(cache_control: &str) -> Option<u64> {
    cache_control.split(',').find_map(|directive| {
        directive
            .trim()
            .strip_prefix("max-age=")
            .and_then(|value| value.trim().parse().ok())
    })
}

/// Parse an `Expires` header into seconds from now.
fn parse_expires(expires: &str) -> Option<u64> {
    let expires_at = DateTime::parse_from_rfc2822(expires).ok()?;
    let delta = expires_at.with_timezone(&Utc) - Utc::now();
    delta.to_std().ok().map(|d| d.as_secs())
}

/// Strategy-driven response cache over the coordinator.
pub struct CachingMiddleware {
    config: MiddlewareConfig,
    settings: CachingSettings,
    rules: parking_lot::RwLock<Vec<CacheRule>>,
    coordinator: Arc<CacheCoordinator>,
}

impl CachingMiddleware {
    #[must_use]
    pub fn new(
        config: MiddlewareConfig,
        settings: CachingSettings,
        coordinator: Arc<CacheCoordinator>,
    ) -> Self {
        Self {
            config,
            settings,
            rules: parking_lot::RwLock::new(Vec::new()),
            coordinator,
        }
    }

    pub fn add_rule(&self, rule: CacheRule) {
        self.rules.write().push(rule);
    }

    pub fn remove_rule(&self, rule_id: &str) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|rule| rule.rule_id != rule_id);
        before != rules.len()
    }

    fn should_skip(&self, method: &str, path: &str) -> bool {
        self.settings
            .skip_methods
            .iter()
            .any(|skip| skip.eq_ignore_ascii_case(method))
            || self
                .settings
                .skip_paths
                .iter()
                .any(|skip| path.starts_with(skip.as_str()))
    }

    fn matching_rule(&self, method: &str, path: &str) -> Option<CacheRule> {
        self.rules
            .read()
            .iter()
            .filter(|rule| rule.matches(method, path))
            .max_by_key(|rule| rule.priority)
            .cloned()
    }

    fn rule_by_id(&self, rule_id: &str) -> Option<CacheRule> {
        self.rules
            .read()
            .iter()
            .find(|rule| rule.rule_id == rule_id)
            .cloned()
    }

    /// Cache key: prefix namespace, then scope, method, path, a stable
    /// query hash and a stable vary-header hash.
    fn cache_key(&self, ctx: &MiddlewareContext, rule: &CacheRule) -> Option<CacheKey> {
        let mut parts: Vec<String> = Vec::new();

        match &rule.scope {
            CacheScope::Global => parts.push("global".to_string()),
            CacheScope::User => {
                let user = ctx
                    .user_data_as::<String>("user_id")
                    .unwrap_or_else(|| "anonymous".to_string());
                parts.push(format!("user_{user}"));
            }
            CacheScope::Session => {
                let session = ctx
                    .data_as::<String>("session_id")
                    .unwrap_or_else(|| "no_session".to_string());
                parts.push(format!("session_{session}"));
            }
            CacheScope::Ip => parts.push(format!("ip_{}", ctx.request.remote_addr)),
            CacheScope::Endpoint => parts.push(format!("endpoint_{}", ctx.request.path)),
            CacheScope::Custom(label) => parts.push(label.clone()),
        }

        parts.push(ctx.request.method.clone());
        parts.push(ctx.request.path.replace('/', "_"));

        if !ctx.request.query_params.is_empty() {
            let sorted: BTreeMap<&String, &String> = ctx.request.query_params.iter().collect();
            let rendered = serde_json::to_string(&sorted).ok()?;
            parts.push(format!("query_{}", short_hash(&rendered)));
        }

        if !rule.vary_headers.is_empty() {
            let mut vary_values = Vec::with_capacity(rule.vary_headers.len());
            for header in &rule.vary_headers {
                if let Some(value) = ctx.request.header(header) {
                    vary_values.push(format!("{header}_{value}"));
                }
            }
            if !vary_values.is_empty() {
                parts.push(format!("vary_{}", short_hash(&vary_values.join("_"))));
            }
        }

        CacheKey::new(self.settings.key_prefix.clone(), parts.join(":")).ok()
    }

    async fn lookup(&self, key: &CacheKey) -> Option<CachedResponse> {
        match self.coordinator.get(key).await {
            Ok(Some(value)) => serde_json::from_slice(&value.data).ok(),
            Ok(None) => None,
            Err(err) => {
                warn!(key = %key, error = %err, "cache lookup failed, treating as miss");
                None
            }
        }
    }

    fn hit_result(cached: &CachedResponse, state: &str) -> MiddlewareResult {
        MiddlewareResult::stop(cached.status_code, cached.body.clone())
            .with_header("X-Cache", state)
            .with_header("X-Cache-TTL", cached.remaining_fresh_secs().to_string())
            .with_header("Content-Type", cached.content_type.clone())
    }

    /// Effective TTL: the rule's TTL bounded by response `Cache-Control`
    /// max-age, `Expires` and the configured ceiling.
    fn effective_ttl(&self, rule: &CacheRule, response_headers: &super::Headers) -> Duration {
        let mut ttl_secs = rule.ttl.as_secs();
        if let Some(max_age) = response_headers.get("cache-control").and_then(parse_max_age) {
            ttl_secs = ttl_secs.min(max_age);
        }
        if let Some(expires) = response_headers.get("expires").and_then(parse_expires) {
            ttl_secs = ttl_secs.min(expires);
        }
        Duration::from_secs(ttl_secs.min(self.settings.max_ttl.as_secs()))
    }
}

#[async_trait]
impl Middleware for CachingMiddleware {
    fn config(&self) -> &MiddlewareConfig {
        &self.config
    }

    async fn process_request(
        &self,
        ctx: &mut MiddlewareContext,
    ) -> anyhow::Result<MiddlewareResult> {
        if self.should_skip(&ctx.request.method, &ctx.request.path) {
            ctx.set_data("caching_skipped", serde_json::json!(true));
            return Ok(MiddlewareResult::success());
        }

        let Some(rule) = self.matching_rule(&ctx.request.method, &ctx.request.path) else {
            ctx.set_data("caching_not_applicable", serde_json::json!(true));
            return Ok(MiddlewareResult::success());
        };

        let Some(key) = self.cache_key(ctx, &rule) else {
            ctx.set_data("caching_not_applicable", serde_json::json!(true));
            return Ok(MiddlewareResult::success());
        };

        ctx.set_data(
            "caching_state",
            serde_json::json!({
                "rule_id": rule.rule_id,
                "key": key.key(),
            }),
        );

        match rule.strategy {
            CachingStrategy::NoCache | CachingStrategy::NetworkFirst => {
                Ok(MiddlewareResult::success())
            }
            CachingStrategy::CacheOnly => match self.lookup(&key).await {
                Some(cached) => {
                    ctx.set_data("caching_hit", serde_json::json!(true));
                    Ok(Self::hit_result(&cached, "HIT"))
                }
                None => Ok(MiddlewareResult::stop(
                    404,
                    r#"{"error": "Resource not found in cache"}"#,
                )
                .with_header("X-Cache", "MISS")),
            },
            CachingStrategy::CacheFirst => match self.lookup(&key).await {
                Some(cached) => {
                    ctx.set_data("caching_hit", serde_json::json!(true));
                    Ok(Self::hit_result(&cached, "HIT"))
                }
                None => Ok(MiddlewareResult::success()),
            },
            CachingStrategy::StaleWhileRevalidate => match self.lookup(&key).await {
                Some(cached) => match cached.freshness() {
                    Freshness::Fresh => {
                        ctx.set_data("caching_hit", serde_json::json!(true));
                        Ok(Self::hit_result(&cached, "HIT"))
                    }
                    Freshness::Stale => {
                        ctx.set_data("caching_hit", serde_json::json!(true));
                        ctx.set_data("cache_revalidate", serde_json::json!(true));
                        Ok(Self::hit_result(&cached, "STALE"))
                    }
                },
                None => Ok(MiddlewareResult::success()),
            },
        }
    }

    async fn process_response(
        &self,
        ctx: &mut MiddlewareContext,
    ) -> anyhow::Result<MiddlewareResult> {
        if ctx.data("caching_skipped").is_some()
            || ctx.data("caching_not_applicable").is_some()
            || ctx.data("caching_hit").is_some()
        {
            return Ok(MiddlewareResult::success());
        }

        let Some(state) = ctx.data("caching_state").cloned() else {
            return Ok(MiddlewareResult::success());
        };
        let Some(rule_id) = state.get("rule_id").and_then(serde_json::Value::as_str) else {
            return Ok(MiddlewareResult::success());
        };
        let Some(key_part) = state.get("key").and_then(serde_json::Value::as_str) else {
            return Ok(MiddlewareResult::success());
        };
        let Some(rule) = self.rule_by_id(rule_id) else {
            return Ok(MiddlewareResult::success());
        };

        let (status_code, content_type, body, ttl) = {
            let Some(response) = ctx.response.as_ref() else {
                return Ok(MiddlewareResult::success());
            };
            if !rule.should_cache_response(response.status_code) {
                return Ok(MiddlewareResult::success());
            }
            let Some(body) = response.body.clone() else {
                return Ok(MiddlewareResult::success());
            };
            let ttl = self.effective_ttl(&rule, &response.headers);
            (
                response.status_code,
                response.content_type.clone(),
                body,
                ttl,
            )
        };

        let cached = CachedResponse {
            status_code,
            content_type,
            body: body.to_vec(),
            stored_at: Utc::now(),
            fresh_ttl_secs: ttl.as_secs(),
        };
        let store_ttl = if rule.strategy == CachingStrategy::StaleWhileRevalidate {
            ttl + self.settings.stale_grace
        } else {
            ttl
        };

        let key = CacheKey::new(self.settings.key_prefix.clone(), key_part)?;
        let payload = serde_json::to_vec(&cached)?;
        match self
            .coordinator
            .set(&key, CacheValue::new(payload), Some(store_ttl))
            .await
        {
            Ok(()) => {
                debug!(key = %key, ttl_secs = ttl.as_secs(), "cached response body");
                if let Some(response) = ctx.response.as_mut() {
                    response.set_header("X-Cache", "MISS");
                    response.set_header("X-Cache-TTL", ttl.as_secs().to_string());
                }
            }
            Err(err) => {
                warn!(key = %key, error = %err, "failed to cache response");
            }
        }

        Ok(MiddlewareResult::success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::{MemoryCache, MemoryCacheConfig};
    use crate::coordinator::CoordinatorConfig;
    use crate::middleware::{
        MiddlewarePipeline, MiddlewarePriority, MiddlewareRequest, MiddlewareType,
    };

    /// Terminal handler standing in for the upstream service.
    struct Responder {
        config: MiddlewareConfig,
        body: &'static str,
        headers: Vec<(&'static str, String)>,
    }

    impl Responder {
        fn new(body: &'static str) -> Self {
            Self {
                config: MiddlewareConfig::new("responder", MiddlewareType::Custom)
                    .with_priority(MiddlewarePriority::Lowest),
                body,
                headers: Vec::new(),
            }
        }

        fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
            self.headers.push((name, value.into()));
            self
        }
    }

    #[async_trait]
    impl Middleware for Responder {
        fn config(&self) -> &MiddlewareConfig {
            &self.config
        }

        async fn process_request(
            &self,
            _ctx: &mut MiddlewareContext,
        ) -> anyhow::Result<MiddlewareResult> {
            let mut result = MiddlewareResult::stop(200, self.body);
            for (name, value) in &self.headers {
                result = result.with_header(*name, value.clone());
            }
            Ok(result)
        }
    }

    fn coordinator() -> Arc<CacheCoordinator> {
        let coordinator = CacheCoordinator::new(CoordinatorConfig::default());
        let mut config = MemoryCacheConfig::new("mw-cache");
        config.base.background_cleanup = false;
        coordinator
            .add_cache(Arc::new(MemoryCache::new(config)), 0)
            .unwrap();
        Arc::new(coordinator)
    }

    fn pipeline_with_rule(rule: CacheRule) -> MiddlewarePipeline {
        let caching = CachingMiddleware::new(
            MiddlewareConfig::new("caching", MiddlewareType::Caching)
                .with_priority(MiddlewarePriority::Normal),
            CachingSettings::default(),
            coordinator(),
        );
        caching.add_rule(rule);

        let pipeline = MiddlewarePipeline::new();
        pipeline.register(Arc::new(caching)).unwrap();
        pipeline
            .register(Arc::new(Responder::new(r#"{"price": 42}"#)))
            .unwrap();
        pipeline
    }

    fn api_request(lang: &str) -> MiddlewareRequest {
        MiddlewareRequest::new("GET", "/api/ticker").with_header("Accept-Language", lang)
    }

    #[test]
    fn max_age_and_expires_parse() {
        assert_eq!(parse_max_age("public, max-age=120"), Some(120));
        assert_eq!(parse_max_age("no-store"), None);

        let future = (Utc::now() + Duration::from_secs(300)).to_rfc2822();
        let parsed = parse_expires(&future).unwrap();
        assert!((298..=300).contains(&parsed));
        assert!(parse_expires("not a date").is_none());
    }

    #[test]
    fn effective_ttl_takes_the_minimum() {
        let caching = CachingMiddleware::new(
            MiddlewareConfig::new("caching", MiddlewareType::Caching),
            CachingSettings::default(),
            coordinator(),
        );
        let rule = CacheRule::new("r", "/api/*", Duration::from_secs(600));

        let mut headers = super::super::Headers::new();
        headers.set("Cache-Control", "max-age=60");
        assert_eq!(
            caching.effective_ttl(&rule, &headers),
            Duration::from_secs(60)
        );

        let empty = super::super::Headers::new();
        assert_eq!(
            caching.effective_ttl(&rule, &empty),
            Duration::from_secs(600)
        );
    }

    #[tokio::test]
    async fn cache_first_fills_then_hits_with_vary() {
        let rule = CacheRule::new("api", "/api/*", Duration::from_secs(300))
            .with_vary_headers(vec!["Accept-Language".into()]);
        let pipeline = pipeline_with_rule(rule);

        // first en-US request goes to the responder and gets stored
        let (_, ctx) = pipeline.process_request(api_request("en-US")).await;
        let response = ctx.response.unwrap();
        assert_eq!(response.header("x-cache"), Some("MISS"));

        // second en-US request is served from cache
        let (result, ctx) = pipeline.process_request(api_request("en-US")).await;
        assert!(!result.continue_chain);
        let response = ctx.response.unwrap();
        assert_eq!(response.header("x-cache"), Some("HIT"));
        assert_eq!(
            response.body.as_deref(),
            Some(r#"{"price": 42}"#.as_bytes())
        );

        // a different vary value misses
        let (_, ctx) = pipeline.process_request(api_request("fr-FR")).await;
        let response = ctx.response.unwrap();
        assert_eq!(response.header("x-cache"), Some("MISS"));
    }

    #[tokio::test]
    async fn cache_only_misses_are_404() {
        let rule = CacheRule::new("only", "/api/*", Duration::from_secs(300))
            .with_strategy(CachingStrategy::CacheOnly);
        let pipeline = pipeline_with_rule(rule);

        let (result, ctx) = pipeline.process_request(api_request("en-US")).await;
        assert!(!result.continue_chain);
        assert_eq!(ctx.response.unwrap().status_code, 404);
    }

    #[tokio::test]
    async fn skip_methods_are_never_cached() {
        let rule = CacheRule::new("api", "/api/*", Duration::from_secs(300));
        // allow the rule to match any method so only skip_methods applies
        let rule = CacheRule {
            method_pattern: "*".into(),
            ..rule
        };
        let pipeline = pipeline_with_rule(rule);

        let request = MiddlewareRequest::new("POST", "/api/ticker");
        let (_, ctx) = pipeline.process_request(request).await;
        assert_eq!(
            ctx.data("caching_skipped"),
            Some(&serde_json::json!(true))
        );
        let response = ctx.response.unwrap();
        assert!(response.header("x-cache").is_none());
    }

    #[tokio::test]
    async fn response_cache_control_bounds_the_ttl() {
        let rule = CacheRule::new("api", "/api/*", Duration::from_secs(600));
        let caching = CachingMiddleware::new(
            MiddlewareConfig::new("caching", MiddlewareType::Caching)
                .with_priority(MiddlewarePriority::Normal),
            CachingSettings::default(),
            coordinator(),
        );
        caching.add_rule(rule);

        let pipeline = MiddlewarePipeline::new();
        pipeline.register(Arc::new(caching)).unwrap();
        pipeline
            .register(Arc::new(
                Responder::new("body").with_header("Cache-Control", "max-age=30"),
            ))
            .unwrap();

        let (_, ctx) = pipeline.process_request(api_request("en-US")).await;
        let response = ctx.response.unwrap();
        assert_eq!(response.header("x-cache-ttl"), Some("30"));
    }

    #[tokio::test]
    async fn query_params_partition_the_cache() {
        let rule = CacheRule::new("api", "/api/*", Duration::from_secs(300));
        let pipeline = pipeline_with_rule(rule);

        let with_symbol = |symbol: &str| {
            MiddlewareRequest::new("GET", "/api/ticker").with_query("symbol", symbol.to_string())
        };

        let (_, ctx) = pipeline.process_request(with_symbol("BTC")).await;
        assert_eq!(ctx.response.unwrap().header("x-cache"), Some("MISS"));

        let (_, ctx) = pipeline.process_request(with_symbol("BTC")).await;
        assert_eq!(ctx.response.unwrap().header("x-cache"), Some("HIT"));

        let (_, ctx) = pipeline.process_request(with_symbol("ETH")).await;
        assert_eq!(ctx.response.unwrap().header("x-cache"), Some("MISS"));
    }
}
