//! Request-processing middleware pipeline.
//!
//! A priority-ordered chain of interceptors executed twice per request:
//! request phase in ascending priority order, response phase in reverse.
//! Any middleware may read or write the shared per-request bags,
//! short-circuit with a response, or fail; the processor catches failures
//! at exactly one point per invocation and converts them to error results.
//!
//! Concrete middlewares live in the submodules: [`auth`], [`authz`],
//! [`rate_limit`], [`caching`], [`cors`], [`logging`].

pub mod auth;
pub mod authz;
pub mod caching;
pub mod cors;
pub mod logging;
pub mod rate_limit;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

pub(crate) use crate::key::glob_match;

/// Middleware category tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MiddlewareType {
    Authentication,
    Authorization,
    RateLimiting,
    Logging,
    Cors,
    Caching,
    Security,
    Monitoring,
    Custom,
}

/// Chain position; lower runs first in the request phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum MiddlewarePriority {
    Highest,
    High,
    Normal,
    Low,
    Lowest,
}

impl MiddlewarePriority {
    #[must_use]
    pub fn value(self) -> u8 {
        match self {
            Self::Highest => 1,
            Self::High => 25,
            Self::Normal => 50,
            Self::Low => 75,
            Self::Lowest => 100,
        }
    }
}

/// Case-insensitive header map; names are stored lowercased.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    map: HashMap<String, String>,
}

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.map.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.map.remove(&name.to_ascii_lowercase()).is_some()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(&name.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl<S: Into<String>, V: Into<String>> FromIterator<(S, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (S, V)>>(iter: T) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            let name: String = name.into();
            headers.set(&name, value);
        }
        headers
    }
}

/// Request carrier handed to the chain.
#[derive(Debug, Clone)]
pub struct MiddlewareRequest {
    pub request_id: Uuid,
    pub method: String,
    pub path: String,
    pub query_params: HashMap<String, String>,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub remote_addr: String,
    pub user_agent: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl MiddlewareRequest {
    #[must_use]
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            method: method.into(),
            path: path.into(),
            query_params: HashMap::new(),
            headers: Headers::new(),
            body: None,
            remote_addr: String::new(),
            user_agent: String::new(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    #[must_use]
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = addr.into();
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query_params.get(name).map(String::as_str)
    }
}

/// Response carrier produced by the chain or a short-circuit.
#[derive(Debug, Clone)]
pub struct MiddlewareResponse {
    pub status_code: u16,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub content_type: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl MiddlewareResponse {
    #[must_use]
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: Headers::new(),
            body: None,
            content_type: "application/json".to_string(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.set(name, value);
    }

    /// Generic 500 used when a middleware fails; details stay in the logs.
    #[must_use]
    pub fn internal_error() -> Self {
        Self::new(500).with_body(Bytes::from_static(b"{\"error\": \"Internal server error\"}"))
    }
}

/// Per-request state threaded through the chain.
///
/// `middleware_data` is the inter-middleware bag (e.g. the authentication
/// context); `user_data` mirrors authenticated-user fields for downstream
/// consumers. Both are mutable by convention.
#[derive(Debug)]
pub struct MiddlewareContext {
    pub request: MiddlewareRequest,
    pub response: Option<MiddlewareResponse>,
    started: Instant,
    pub processing_time: Option<Duration>,
    middleware_data: HashMap<String, serde_json::Value>,
    user_data: HashMap<String, serde_json::Value>,
    pub errors: Vec<anyhow::Error>,
}

impl MiddlewareContext {
    #[must_use]
    pub fn new(request: MiddlewareRequest) -> Self {
        Self {
            request,
            response: None,
            started: Instant::now(),
            processing_time: None,
            middleware_data: HashMap::new(),
            user_data: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn set_data(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.middleware_data.insert(key.into(), value);
    }

    #[must_use]
    pub fn data(&self, key: &str) -> Option<&serde_json::Value> {
        self.middleware_data.get(key)
    }

    /// Typed view of a middleware-data entry.
    #[must_use]
    pub fn data_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.middleware_data
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn set_user_data(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.user_data.insert(key.into(), value);
    }

    #[must_use]
    pub fn user_data(&self, key: &str) -> Option<&serde_json::Value> {
        self.user_data.get(key)
    }

    #[must_use]
    pub fn user_data_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.user_data
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn add_error(&mut self, error: anyhow::Error) {
        self.errors.push(error);
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Stamp the end of chain processing.
    pub fn finalize(&mut self) {
        self.processing_time = Some(self.started.elapsed());
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Outcome of one middleware invocation.
#[derive(Debug, Clone)]
pub struct MiddlewareResult {
    pub success: bool,
    pub continue_chain: bool,
    pub status_code: Option<u16>,
    pub headers: HashMap<String, String>,
    pub body: Option<Bytes>,
    pub error: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl MiddlewareResult {
    /// Success; the chain proceeds.
    #[must_use]
    pub fn success() -> Self {
        Self {
            success: true,
            continue_chain: true,
            status_code: None,
            headers: HashMap::new(),
            body: None,
            error: None,
            metadata: HashMap::new(),
        }
    }

    /// Failure; the chain terminates with an error.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            continue_chain: false,
            error: Some(message.into()),
            ..Self::success()
        }
    }

    /// Short-circuit: skip the rest of the request phase and answer with
    /// this status and body.
    #[must_use]
    pub fn stop(status_code: u16, body: impl Into<Bytes>) -> Self {
        Self {
            continue_chain: false,
            status_code: Some(status_code),
            body: Some(body.into()),
            ..Self::success()
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Identity, ordering and the opaque option bag of a middleware.
#[derive(Debug, Clone)]
pub struct MiddlewareConfig {
    pub id: String,
    pub middleware_type: MiddlewareType,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub priority: MiddlewarePriority,
    pub options: HashMap<String, serde_json::Value>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl MiddlewareConfig {
    #[must_use]
    pub fn new(id: impl Into<String>, middleware_type: MiddlewareType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            middleware_type,
            description: String::new(),
            enabled: true,
            priority: MiddlewarePriority::Normal,
            options: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: MiddlewarePriority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// A single interceptor in the chain.
///
/// Failures are expressed two ways: an `Ok` result with `success: false`
/// (a controlled error) or an `Err` (the host-language exception path).
/// The processor converts both into terminal error results.
#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    fn config(&self) -> &MiddlewareConfig;

    fn id(&self) -> &str {
        &self.config().id
    }

    fn middleware_type(&self) -> MiddlewareType {
        self.config().middleware_type
    }

    fn priority(&self) -> MiddlewarePriority {
        self.config().priority
    }

    fn is_enabled(&self) -> bool {
        self.config().enabled
    }

    /// Called once before the chain starts serving.
    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called during teardown.
    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn process_request(&self, ctx: &mut MiddlewareContext)
        -> anyhow::Result<MiddlewareResult>;

    async fn process_response(
        &self,
        _ctx: &mut MiddlewareContext,
    ) -> anyhow::Result<MiddlewareResult> {
        Ok(MiddlewareResult::success())
    }
}

/// Atomic per-middleware counters.
#[derive(Debug, Default)]
pub struct MiddlewareStats {
    requests_processed: AtomicU64,
    requests_success: AtomicU64,
    requests_error: AtomicU64,
    total_processing_time_us: AtomicU64,
}

impl MiddlewareStats {
    fn record(&self, elapsed: Duration, success: bool) {
        self.requests_processed.fetch_add(1, Ordering::Relaxed);
        if success {
            self.requests_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_error.fetch_add(1, Ordering::Relaxed);
        }
        self.total_processing_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MiddlewareStatsSnapshot {
        let processed = self.requests_processed.load(Ordering::Relaxed);
        let total_us = self.total_processing_time_us.load(Ordering::Relaxed);
        #[allow(clippy::cast_precision_loss)]
        MiddlewareStatsSnapshot {
            requests_processed: processed,
            requests_success: self.requests_success.load(Ordering::Relaxed),
            requests_error: self.requests_error.load(Ordering::Relaxed),
            total_processing_time_us: total_us,
            avg_processing_time_us: if processed > 0 {
                total_us as f64 / processed as f64
            } else {
                0.0
            },
        }
    }
}

/// Read-only view of per-middleware counters.
#[derive(Debug, Clone, Serialize)]
pub struct MiddlewareStatsSnapshot {
    pub requests_processed: u64,
    pub requests_success: u64,
    pub requests_error: u64,
    pub total_processing_time_us: u64,
    pub avg_processing_time_us: f64,
}

struct ChainEntry {
    middleware: Arc<dyn Middleware>,
    stats: MiddlewareStats,
    seq: usize,
}

/// Ordered registry of middlewares with a cached priority sort.
#[derive(Default)]
pub struct MiddlewareChain {
    entries: RwLock<Vec<Arc<ChainEntry>>>,
    next_seq: AtomicUsize,
    sorted: AtomicBool,
}

impl MiddlewareChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a middleware. Duplicate ids fail without mutating the chain.
    pub fn register(&self, middleware: Arc<dyn Middleware>) -> anyhow::Result<()> {
        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.middleware.id() == middleware.id()) {
            return Err(anyhow!(
                "middleware '{}' is already registered",
                middleware.id()
            ));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        entries.push(Arc::new(ChainEntry {
            middleware,
            stats: MiddlewareStats::default(),
            seq,
        }));
        self.sorted.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Remove a middleware by id.
    pub fn unregister(&self, id: &str) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.middleware.id() != id);
        before != entries.len()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<dyn Middleware>> {
        self.entries
            .read()
            .iter()
            .find(|e| e.middleware.id() == id)
            .map(|e| Arc::clone(&e.middleware))
    }

    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .map(|e| e.middleware.id().to_string())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write();
        entries.clear();
        self.sorted.store(false, Ordering::Relaxed);
    }

    /// Enabled middlewares in priority order; ties break by registration
    /// order. The sort is cached until the chain mutates.
    ///
    /// The flag is only read while holding the entries lock and only set
    /// after the sort completes, so a concurrent caller can never observe
    /// a sorted flag ahead of a sorted list.
    fn ordered(&self) -> Vec<Arc<ChainEntry>> {
        {
            let entries = self.entries.read();
            if self.sorted.load(Ordering::Relaxed) {
                return entries
                    .iter()
                    .filter(|e| e.middleware.is_enabled())
                    .cloned()
                    .collect();
            }
        }

        let mut entries = self.entries.write();
        entries.sort_by_key(|e| (e.middleware.priority().value(), e.seq));
        self.sorted.store(true, Ordering::Relaxed);
        entries
            .iter()
            .filter(|e| e.middleware.is_enabled())
            .cloned()
            .collect()
    }

    /// Per-middleware stats keyed by id.
    #[must_use]
    pub fn stats(&self) -> Vec<(String, MiddlewareStatsSnapshot)> {
        self.entries
            .read()
            .iter()
            .map(|e| (e.middleware.id().to_string(), e.stats.snapshot()))
            .collect()
    }
}

/// Atomic processor-level counters.
#[derive(Debug, Default)]
pub struct ProcessorStats {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    total_processing_time_us: AtomicU64,
}

impl ProcessorStats {
    fn record(&self, elapsed: Duration, success: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        self.total_processing_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> ProcessorStatsSnapshot {
        let total = self.total_requests.load(Ordering::Relaxed);
        let total_us = self.total_processing_time_us.load(Ordering::Relaxed);
        #[allow(clippy::cast_precision_loss)]
        ProcessorStatsSnapshot {
            total_requests: total,
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            avg_processing_time_us: if total > 0 {
                total_us as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

/// Read-only view of processor counters.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessorStatsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub avg_processing_time_us: f64,
}

/// Walks the chain through both phases with exception isolation.
pub struct MiddlewareProcessor {
    chain: Arc<MiddlewareChain>,
    stats: ProcessorStats,
    /// Optional per-request budget; exhausted budget synthesizes an error
    /// result for the middleware that ran over.
    request_deadline: Option<Duration>,
}

impl MiddlewareProcessor {
    #[must_use]
    pub fn new(chain: Arc<MiddlewareChain>) -> Self {
        Self {
            chain,
            stats: ProcessorStats::default(),
            request_deadline: None,
        }
    }

    #[must_use]
    pub fn with_request_deadline(mut self, deadline: Duration) -> Self {
        self.request_deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn stats(&self) -> ProcessorStatsSnapshot {
        self.stats.snapshot()
    }

    fn synthesize_response(result: &MiddlewareResult) -> MiddlewareResponse {
        let mut response = MiddlewareResponse::new(result.status_code.unwrap_or(200));
        for (name, value) in &result.headers {
            response.headers.set(name, value.clone());
        }
        if let Some(content_type) = response.headers.get("content-type") {
            response.content_type = content_type.to_string();
        }
        response.body.clone_from(&result.body);
        response
    }

    /// Run the request through the enabled chain.
    ///
    /// Request phase: success+continue proceeds; success+stop
    /// short-circuits into the response phase; an error terminates the
    /// request with a generic 500 and the response phase is not executed.
    /// Response phase: reverse order, errors recorded but best-effort.
    pub async fn process(
        &self,
        request: MiddlewareRequest,
    ) -> (MiddlewareResult, MiddlewareContext) {
        let mut ctx = MiddlewareContext::new(request);
        let entries = self.chain.ordered();
        let overall = Instant::now();

        let mut final_result = MiddlewareResult::success();
        let mut terminal_error = false;

        for entry in &entries {
            let budget = match self.request_deadline {
                Some(deadline) => match deadline.checked_sub(overall.elapsed()) {
                    Some(remaining) => Some(remaining),
                    None => {
                        let message =
                            format!("request deadline exceeded before '{}'", entry.middleware.id());
                        ctx.add_error(anyhow!(message.clone()));
                        final_result = MiddlewareResult::error(message);
                        terminal_error = true;
                        break;
                    }
                },
                None => None,
            };

            let started = Instant::now();
            let outcome = match budget {
                Some(remaining) => {
                    match tokio::time::timeout(remaining, entry.middleware.process_request(&mut ctx))
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(_) => Err(anyhow!(
                            "middleware '{}' exceeded the request deadline",
                            entry.middleware.id()
                        )),
                    }
                }
                None => entry.middleware.process_request(&mut ctx).await,
            };
            let elapsed = started.elapsed();

            match outcome {
                Ok(result) if result.success => {
                    entry.stats.record(elapsed, true);
                    if !result.continue_chain {
                        debug!(
                            middleware = %entry.middleware.id(),
                            status = ?result.status_code,
                            "chain short-circuited"
                        );
                        ctx.response = Some(Self::synthesize_response(&result));
                        final_result = result;
                        break;
                    }
                }
                Ok(result) => {
                    entry.stats.record(elapsed, false);
                    if let Some(message) = &result.error {
                        ctx.add_error(anyhow!(message.clone()));
                    }
                    final_result = result;
                    terminal_error = true;
                    break;
                }
                Err(err) => {
                    entry.stats.record(elapsed, false);
                    warn!(middleware = %entry.middleware.id(), error = %err, "middleware failed");
                    final_result = MiddlewareResult::error(err.to_string());
                    ctx.add_error(err);
                    terminal_error = true;
                    break;
                }
            }
        }

        if terminal_error {
            // errors are terminal: no response phase, generic body out
            ctx.response = Some(MiddlewareResponse::internal_error());
            ctx.finalize();
            self.stats.record(overall.elapsed(), false);
            return (final_result, ctx);
        }

        if ctx.response.is_some() {
            for entry in entries.iter().rev() {
                let started = Instant::now();
                let outcome = entry.middleware.process_response(&mut ctx).await;
                let elapsed = started.elapsed();
                match outcome {
                    Ok(result) if result.success => entry.stats.record(elapsed, true),
                    Ok(result) => {
                        entry.stats.record(elapsed, false);
                        if let Some(message) = result.error {
                            ctx.add_error(anyhow!(message));
                        }
                    }
                    Err(err) => {
                        entry.stats.record(elapsed, false);
                        warn!(
                            middleware = %entry.middleware.id(),
                            error = %err,
                            "response-phase middleware failed, continuing"
                        );
                        ctx.add_error(err);
                    }
                }
            }
        }

        ctx.finalize();
        self.stats.record(overall.elapsed(), true);
        (final_result, ctx)
    }
}

/// Framework facade: registry, lifecycle and aggregate statistics.
pub struct MiddlewarePipeline {
    chain: Arc<MiddlewareChain>,
    processor: MiddlewareProcessor,
    initialized: AtomicBool,
}

impl Default for MiddlewarePipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl MiddlewarePipeline {
    #[must_use]
    pub fn new() -> Self {
        let chain = Arc::new(MiddlewareChain::new());
        Self {
            processor: MiddlewareProcessor::new(Arc::clone(&chain)),
            chain,
            initialized: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_request_deadline(deadline: Duration) -> Self {
        let chain = Arc::new(MiddlewareChain::new());
        Self {
            processor: MiddlewareProcessor::new(Arc::clone(&chain)).with_request_deadline(deadline),
            chain,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn register(&self, middleware: Arc<dyn Middleware>) -> anyhow::Result<()> {
        self.chain.register(middleware)
    }

    pub fn unregister(&self, id: &str) -> bool {
        self.chain.unregister(id)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<dyn Middleware>> {
        self.chain.get(id)
    }

    #[must_use]
    pub fn chain(&self) -> &Arc<MiddlewareChain> {
        &self.chain
    }

    /// Initialize every registered middleware once.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        if self.initialized.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        for id in self.chain.ids() {
            if let Some(middleware) = self.chain.get(&id) {
                middleware.initialize().await?;
            }
        }
        Ok(())
    }

    /// Shut down every registered middleware.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if !self.initialized.swap(false, Ordering::Relaxed) {
            return Ok(());
        }
        for id in self.chain.ids() {
            if let Some(middleware) = self.chain.get(&id) {
                middleware.shutdown().await?;
            }
        }
        Ok(())
    }

    pub async fn process_request(
        &self,
        request: MiddlewareRequest,
    ) -> (MiddlewareResult, MiddlewareContext) {
        self.processor.process(request).await
    }

    /// Aggregate framework, processor and per-middleware statistics.
    #[must_use]
    pub fn comprehensive_stats(&self) -> PipelineStats {
        PipelineStats {
            initialized: self.initialized.load(Ordering::Relaxed),
            total_middlewares: self.chain.len(),
            processor: self.processor.stats(),
            middlewares: self.chain.stats(),
        }
    }
}

/// Aggregate pipeline statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub initialized: bool,
    pub total_middlewares: usize,
    pub processor: ProcessorStatsSnapshot,
    pub middlewares: Vec<(String, MiddlewareStatsSnapshot)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe {
        config: MiddlewareConfig,
        behavior: Behavior,
        calls: Arc<AtomicU64>,
        response_calls: Arc<AtomicU64>,
    }

    enum Behavior {
        Continue,
        Stop(u16),
        Fail,
        Explode,
    }

    impl Probe {
        fn new(id: &str, priority: MiddlewarePriority, behavior: Behavior) -> Self {
            Self {
                config: MiddlewareConfig::new(id, MiddlewareType::Custom).with_priority(priority),
                behavior,
                calls: Arc::new(AtomicU64::new(0)),
                response_calls: Arc::new(AtomicU64::new(0)),
            }
        }
    }

    #[async_trait::async_trait]
    impl Middleware for Probe {
        fn config(&self) -> &MiddlewareConfig {
            &self.config
        }

        async fn process_request(
            &self,
            ctx: &mut MiddlewareContext,
        ) -> anyhow::Result<MiddlewareResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let order = ctx
                .data("order")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("")
                .to_string();
            ctx.set_data(
                "order",
                serde_json::json!(format!("{order}{},", self.config.id)),
            );
            match self.behavior {
                Behavior::Continue => Ok(MiddlewareResult::success()),
                Behavior::Stop(status) => Ok(MiddlewareResult::stop(status, "stopped")),
                Behavior::Fail => Ok(MiddlewareResult::error("controlled failure")),
                Behavior::Explode => Err(anyhow!("boom")),
            }
        }

        async fn process_response(
            &self,
            ctx: &mut MiddlewareContext,
        ) -> anyhow::Result<MiddlewareResult> {
            self.response_calls.fetch_add(1, Ordering::SeqCst);
            let order = ctx
                .data("response_order")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("")
                .to_string();
            ctx.set_data(
                "response_order",
                serde_json::json!(format!("{order}{},", self.config.id)),
            );
            Ok(MiddlewareResult::success())
        }
    }

    #[test]
    fn headers_are_case_insensitive() {
        let mut headers = Headers::new();
        headers.set("Content-Type", "application/json");
        assert_eq!(headers.get("content-type"), Some("application/json"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("application/json"));
        assert!(headers.remove("Content-type"));
        assert!(headers.is_empty());
    }

    #[test]
    fn duplicate_registration_fails_without_mutation() {
        let chain = MiddlewareChain::new();
        chain
            .register(Arc::new(Probe::new(
                "a",
                MiddlewarePriority::Normal,
                Behavior::Continue,
            )))
            .unwrap();
        let err = chain.register(Arc::new(Probe::new(
            "a",
            MiddlewarePriority::High,
            Behavior::Continue,
        )));
        assert!(err.is_err());
        assert_eq!(chain.len(), 1);
    }

    #[tokio::test]
    async fn request_phase_runs_in_priority_order() {
        let pipeline = MiddlewarePipeline::new();
        // register out of order on purpose
        pipeline
            .register(Arc::new(Probe::new(
                "low",
                MiddlewarePriority::Low,
                Behavior::Continue,
            )))
            .unwrap();
        pipeline
            .register(Arc::new(Probe::new(
                "highest",
                MiddlewarePriority::Highest,
                Behavior::Continue,
            )))
            .unwrap();
        pipeline
            .register(Arc::new(Probe::new(
                "normal",
                MiddlewarePriority::Normal,
                Behavior::Continue,
            )))
            .unwrap();

        let (result, ctx) = pipeline
            .process_request(MiddlewareRequest::new("GET", "/x"))
            .await;
        assert!(result.success);
        assert_eq!(
            ctx.data("order").and_then(serde_json::Value::as_str),
            Some("highest,normal,low,")
        );
    }

    #[tokio::test]
    async fn stop_short_circuits_and_runs_response_phase_in_reverse() {
        let pipeline = MiddlewarePipeline::new();
        let tail = Arc::new(Probe::new(
            "tail",
            MiddlewarePriority::Lowest,
            Behavior::Continue,
        ));
        let tail_calls = Arc::clone(&tail.calls);
        pipeline
            .register(Arc::new(Probe::new(
                "first",
                MiddlewarePriority::Highest,
                Behavior::Continue,
            )))
            .unwrap();
        pipeline
            .register(Arc::new(Probe::new(
                "stopper",
                MiddlewarePriority::Normal,
                Behavior::Stop(204),
            )))
            .unwrap();
        pipeline.register(tail).unwrap();

        let (result, ctx) = pipeline
            .process_request(MiddlewareRequest::new("GET", "/x"))
            .await;
        assert!(result.success);
        assert!(!result.continue_chain);
        assert_eq!(ctx.response.as_ref().map(|r| r.status_code), Some(204));
        // the middleware after the stop never saw the request phase
        assert_eq!(tail_calls.load(Ordering::SeqCst), 0);
        // response phase walked the whole enabled chain in reverse
        assert_eq!(
            ctx.data("response_order").and_then(serde_json::Value::as_str),
            Some("tail,stopper,first,")
        );
    }

    #[tokio::test]
    async fn controlled_failure_is_terminal_with_generic_500() {
        let pipeline = MiddlewarePipeline::new();
        let tail = Arc::new(Probe::new(
            "after",
            MiddlewarePriority::Low,
            Behavior::Continue,
        ));
        let tail_responses = Arc::clone(&tail.response_calls);
        pipeline
            .register(Arc::new(Probe::new(
                "failing",
                MiddlewarePriority::Normal,
                Behavior::Fail,
            )))
            .unwrap();
        pipeline.register(tail).unwrap();

        let (result, ctx) = pipeline
            .process_request(MiddlewareRequest::new("GET", "/x"))
            .await;
        assert!(!result.success);
        assert!(ctx.has_errors());
        assert_eq!(ctx.response.as_ref().map(|r| r.status_code), Some(500));
        // the response phase is not executed on request-phase errors
        assert_eq!(tail_responses.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_style_errors_are_isolated_per_invocation() {
        let pipeline = MiddlewarePipeline::new();
        pipeline
            .register(Arc::new(Probe::new(
                "exploder",
                MiddlewarePriority::Normal,
                Behavior::Explode,
            )))
            .unwrap();

        let (result, ctx) = pipeline
            .process_request(MiddlewareRequest::new("GET", "/x"))
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("boom"));
        assert_eq!(ctx.errors.len(), 1);

        let stats = pipeline.comprehensive_stats();
        assert_eq!(stats.processor.failed_requests, 1);
    }

    #[tokio::test]
    async fn disabled_middlewares_are_skipped() {
        let pipeline = MiddlewarePipeline::new();
        let mut config = MiddlewareConfig::new("off", MiddlewareType::Custom);
        config.enabled = false;
        let disabled = Probe {
            config,
            behavior: Behavior::Fail,
            calls: Arc::new(AtomicU64::new(0)),
            response_calls: Arc::new(AtomicU64::new(0)),
        };
        let calls = Arc::clone(&disabled.calls);
        pipeline.register(Arc::new(disabled)).unwrap();

        let (result, _) = pipeline
            .process_request(MiddlewareRequest::new("GET", "/x"))
            .await;
        assert!(result.success);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
