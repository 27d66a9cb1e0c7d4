//! Rate-limiting middleware.
//!
//! Three algorithms (token bucket, sliding window, fixed window) over a
//! pluggable store. Per-request keys derive from the rule's scope; rules
//! match by path/method glob and priority, falling back to the configured
//! defaults. A deny short-circuits with 429, `Retry-After` and a reset
//! timestamp header.
//!
//! Algorithm clocks use the tokio clock so tests can pause and advance
//! time deterministically.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use super::{glob_match, Middleware, MiddlewareConfig, MiddlewareContext, MiddlewareResult};

/// Rate-limit algorithm choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    TokenBucket,
    SlidingWindow,
    FixedWindow,
}

/// Dimension the limit key is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    Global,
    Ip,
    User,
    ApiKey,
    Endpoint,
}

impl RateLimitScope {
    /// Scope-derived identity token for a request.
    #[must_use]
    pub fn derive_key(self, ctx: &MiddlewareContext) -> String {
        match self {
            Self::Global => "global".to_string(),
            Self::Ip => format!("ip:{}", ctx.request.remote_addr),
            Self::User => {
                let user = ctx
                    .user_data_as::<String>("user_id")
                    .unwrap_or_else(|| "anonymous".to_string());
                format!("user:{user}")
            }
            Self::ApiKey => {
                let key = ctx
                    .request
                    .header("x-api-key")
                    .unwrap_or("none")
                    .to_string();
                format!("api_key:{key}")
            }
            Self::Endpoint => format!("endpoint:{}", ctx.request.path),
        }
    }
}

/// One rate-limit rule.
#[derive(Debug, Clone)]
pub struct RateLimitRule {
    pub rule_id: String,
    pub name: String,
    pub path_pattern: String,
    pub method_pattern: String,
    pub algorithm: RateLimitAlgorithm,
    pub scope: RateLimitScope,
    pub requests_per_window: u32,
    pub window_size: Duration,
    /// Token-bucket capacity; defaults to `requests_per_window`.
    pub burst_size: Option<u32>,
    pub priority: i32,
    pub enabled: bool,
}

impl RateLimitRule {
    #[must_use]
    pub fn new(rule_id: impl Into<String>, requests_per_window: u32, window_size: Duration) -> Self {
        let rule_id = rule_id.into();
        Self {
            name: rule_id.clone(),
            rule_id,
            path_pattern: "*".to_string(),
            method_pattern: "*".to_string(),
            algorithm: RateLimitAlgorithm::TokenBucket,
            scope: RateLimitScope::Ip,
            requests_per_window,
            window_size,
            burst_size: None,
            priority: 0,
            enabled: true,
        }
    }

    #[must_use]
    pub fn with_path_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.path_pattern = pattern.into();
        self
    }

    #[must_use]
    pub fn with_algorithm(mut self, algorithm: RateLimitAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    #[must_use]
    pub fn with_scope(mut self, scope: RateLimitScope) -> Self {
        self.scope = scope;
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
    pub fn capacity(&self) -> u32 {
        self.burst_size.unwrap_or(self.requests_per_window)
    }

    /// Steady-state refill rate in tokens per second.
    #[must_use]
    pub fn refill_rate(&self) -> f64 {
        f64::from(self.requests_per_window) / self.window_size.as_secs_f64()
    }
}

/// Outcome of one limit check.
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_time: DateTime<Utc>,
    /// Seconds to wait before the next permitted request (deny only).
    pub retry_after_secs: u64,
    pub rule_id: Option<String>,
}

impl RateLimitDecision {
    #[must_use]
    pub fn allow(remaining: u32, reset_time: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_time,
            retry_after_secs: 0,
            rule_id: None,
        }
    }

    #[must_use]
    pub fn deny(retry_after_secs: u64, reset_time: DateTime<Utc>) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_time,
            retry_after_secs,
            rule_id: None,
        }
    }
}

/// Classic token bucket: capacity C, refill R tokens/sec.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    #[must_use]
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity: f64::from(capacity),
            tokens: f64::from(capacity),
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take `n` tokens if available.
    pub fn consume(&mut self, n: f64) -> bool {
        self.refill();
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn remaining(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            self.tokens.max(0.0).floor() as u32
        }
    }

    /// Seconds until `n` tokens will be available.
    #[must_use]
    pub fn retry_after(&self, n: f64) -> f64 {
        if self.tokens >= n || self.refill_rate <= 0.0 {
            0.0
        } else {
            (n - self.tokens) / self.refill_rate
        }
    }
}

/// Timestamps of requests within the trailing window.
#[derive(Debug)]
pub struct SlidingWindow {
    window: Duration,
    max_requests: u32,
    hits: VecDeque<Instant>,
}

impl SlidingWindow {
    #[must_use]
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            hits: VecDeque::new(),
        }
    }

    fn prune(&mut self) {
        let now = Instant::now();
        while self
            .hits
            .front()
            .is_some_and(|hit| now.duration_since(*hit) >= self.window)
        {
            self.hits.pop_front();
        }
    }

    pub fn allow(&mut self) -> bool {
        self.prune();
        if (self.hits.len() as u32) < self.max_requests {
            self.hits.push_back(Instant::now());
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.max_requests.saturating_sub(self.hits.len() as u32)
    }

    /// Seconds until the oldest hit falls out of the window.
    #[must_use]
    pub fn retry_after(&self) -> f64 {
        self.hits.front().map_or(0.0, |oldest| {
            let age = Instant::now().duration_since(*oldest);
            (self.window.saturating_sub(age)).as_secs_f64()
        })
    }
}

/// Counter keyed by `floor(now / window)`.
#[derive(Debug)]
pub struct FixedWindow {
    window_secs: u64,
    max_requests: u32,
    bucket: u64,
    count: u32,
}

impl FixedWindow {
    #[must_use]
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window_secs: window.as_secs().max(1),
            max_requests,
            bucket: 0,
            count: 0,
        }
    }

    fn current_bucket(&self) -> u64 {
        #[allow(clippy::cast_sign_loss)]
        {
            (Utc::now().timestamp().max(0) as u64) / self.window_secs
        }
    }

    pub fn allow(&mut self) -> bool {
        let bucket = self.current_bucket();
        if bucket != self.bucket {
            self.bucket = bucket;
            self.count = 0;
        }
        if self.count < self.max_requests {
            self.count += 1;
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.max_requests.saturating_sub(self.count)
    }

    /// Seconds until the next window opens.
    #[must_use]
    pub fn retry_after(&self) -> u64 {
        let now = Utc::now().timestamp().max(0) as u64;
        let next = (self.bucket + 1) * self.window_secs;
        next.saturating_sub(now)
    }
}

/// Algorithm state storage; in-memory and remote-backed implementations
/// share this interface.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn check(&self, rule: &RateLimitRule, key: &str) -> RateLimitDecision;
    /// Drop accumulated state for a key (testing and admin tooling).
    async fn reset(&self, key: &str);
}

/// Per-process store; contention is proportional to key diversity because
/// every key owns its own lock.
#[derive(Default)]
pub struct MemoryRateLimitStore {
    buckets: DashMap<String, Mutex<TokenBucket>>,
    sliding: DashMap<String, Mutex<SlidingWindow>>,
    fixed: DashMap<String, Mutex<FixedWindow>>,
}

impl MemoryRateLimitStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn check(&self, rule: &RateLimitRule, key: &str) -> RateLimitDecision {
        let scoped = format!("{}:{key}", rule.rule_id);
        match rule.algorithm {
            RateLimitAlgorithm::TokenBucket => {
                let entry = self
                    .buckets
                    .entry(scoped)
                    .or_insert_with(|| Mutex::new(TokenBucket::new(rule.capacity(), rule.refill_rate())));
                let mut bucket = entry.lock();
                if bucket.consume(1.0) {
                    let reset = Utc::now() + rule.window_size;
                    RateLimitDecision::allow(bucket.remaining(), reset)
                } else {
                    let retry = bucket.retry_after(1.0).ceil();
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    let retry_secs = (retry as u64).max(1);
                    let reset = Utc::now() + Duration::from_secs(retry_secs);
                    RateLimitDecision::deny(retry_secs, reset)
                }
            }
            RateLimitAlgorithm::SlidingWindow => {
                let entry = self
                    .sliding
                    .entry(scoped)
                    .or_insert_with(|| {
                        Mutex::new(SlidingWindow::new(rule.window_size, rule.requests_per_window))
                    });
                let mut window = entry.lock();
                if window.allow() {
                    RateLimitDecision::allow(window.remaining(), Utc::now() + rule.window_size)
                } else {
                    let retry = window.retry_after().ceil();
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    let retry_secs = (retry as u64).max(1);
                    RateLimitDecision::deny(retry_secs, Utc::now() + Duration::from_secs(retry_secs))
                }
            }
            RateLimitAlgorithm::FixedWindow => {
                let entry = self
                    .fixed
                    .entry(scoped)
                    .or_insert_with(|| {
                        Mutex::new(FixedWindow::new(rule.window_size, rule.requests_per_window))
                    });
                let mut window = entry.lock();
                if window.allow() {
                    RateLimitDecision::allow(window.remaining(), Utc::now() + rule.window_size)
                } else {
                    let retry_secs = window.retry_after().max(1);
                    RateLimitDecision::deny(retry_secs, Utc::now() + Duration::from_secs(retry_secs))
                }
            }
        }
    }

    async fn reset(&self, key: &str) {
        self.buckets.retain(|stored, _| !stored.ends_with(key));
        self.sliding.retain(|stored, _| !stored.ends_with(key));
        self.fixed.retain(|stored, _| !stored.ends_with(key));
    }
}

/// Fallback limits used when no rule matches.
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub default_requests_per_minute: u32,
    pub default_burst_size: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            default_requests_per_minute: 600,
            default_burst_size: 100,
        }
    }
}

/// Matches rules and short-circuits over-limit requests with 429.
pub struct RateLimitingMiddleware {
    config: MiddlewareConfig,
    settings: RateLimitSettings,
    rules: parking_lot::RwLock<Vec<RateLimitRule>>,
    store: Arc<dyn RateLimitStore>,
}

impl RateLimitingMiddleware {
    #[must_use]
    pub fn new(
        config: MiddlewareConfig,
        settings: RateLimitSettings,
        store: Arc<dyn RateLimitStore>,
    ) -> Self {
        Self {
            config,
            settings,
            rules: parking_lot::RwLock::new(Vec::new()),
            store,
        }
    }

    pub fn add_rule(&self, rule: RateLimitRule) {
        self.rules.write().push(rule);
    }

    pub fn remove_rule(&self, rule_id: &str) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|rule| rule.rule_id != rule_id);
        before != rules.len()
    }

    fn matching_rule(&self, method: &str, path: &str) -> Option<RateLimitRule> {
        self.rules
            .read()
            .iter()
            .filter(|rule| rule.matches(method, path))
            .max_by_key(|rule| rule.priority)
            .cloned()
    }

    fn default_rule(&self) -> RateLimitRule {
        let mut rule = RateLimitRule::new(
            "default",
            self.settings.default_requests_per_minute,
            Duration::from_secs(60),
        );
        rule.burst_size = Some(self.settings.default_burst_size);
        rule
    }
}

#[async_trait]
impl Middleware for RateLimitingMiddleware {
    fn config(&self) -> &MiddlewareConfig {
        &self.config
    }

    async fn process_request(
        &self,
        ctx: &mut MiddlewareContext,
    ) -> anyhow::Result<MiddlewareResult> {
        let rule = self
            .matching_rule(&ctx.request.method, &ctx.request.path)
            .unwrap_or_else(|| self.default_rule());
        let key = rule.scope.derive_key(ctx);

        let mut decision = self.store.check(&rule, &key).await;
        decision.rule_id = Some(rule.rule_id.clone());

        ctx.set_data(
            "rate_limit",
            serde_json::json!({
                "rule_id": rule.rule_id,
                "key": key,
                "allowed": decision.allowed,
                "remaining": decision.remaining,
            }),
        );

        if decision.allowed {
            return Ok(MiddlewareResult::success());
        }

        debug!(rule = %rule.rule_id, key = %key, retry_after = decision.retry_after_secs, "rate limit exceeded");
        Ok(MiddlewareResult::stop(
            429,
            r#"{"error": "Rate limit exceeded"}"#,
        )
        .with_header("Retry-After", decision.retry_after_secs.to_string())
        .with_header(
            "X-RateLimit-Reset",
            decision.reset_time.timestamp().to_string(),
        )
        .with_header("X-RateLimit-Remaining", "0"))
    }
}
