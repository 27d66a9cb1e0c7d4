//! Logging and monitoring middlewares.
//!
//! Logging emits one structured line per phase; monitoring aggregates
//! per-endpoint counters and latency for the stats surface. Both sit at
//! the low-priority end of the chain so they observe the final outcome.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tracing::info;

use super::{Middleware, MiddlewareConfig, MiddlewareContext, MiddlewareResult};

/// Structured request/response logging.
pub struct LoggingMiddleware {
    config: MiddlewareConfig,
    /// Also log request headers at debug level.
    pub log_headers: bool,
}

impl LoggingMiddleware {
    #[must_use]
    pub fn new(config: MiddlewareConfig) -> Self {
        Self {
            config,
            log_headers: false,
        }
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn config(&self) -> &MiddlewareConfig {
        &self.config
    }

    async fn process_request(
        &self,
        ctx: &mut MiddlewareContext,
    ) -> anyhow::Result<MiddlewareResult> {
        info!(
            request_id = %ctx.request.request_id,
            method = %ctx.request.method,
            path = %ctx.request.path,
            remote_addr = %ctx.request.remote_addr,
            "request received"
        );
        if self.log_headers {
            for (name, value) in ctx.request.headers.iter() {
                tracing::debug!(request_id = %ctx.request.request_id, header = name, value, "request header");
            }
        }
        Ok(MiddlewareResult::success())
    }

    async fn process_response(
        &self,
        ctx: &mut MiddlewareContext,
    ) -> anyhow::Result<MiddlewareResult> {
        let status = ctx.response.as_ref().map_or(0, |r| r.status_code);
        info!(
            request_id = %ctx.request.request_id,
            method = %ctx.request.method,
            path = %ctx.request.path,
            status,
            elapsed_us = ctx.elapsed().as_micros() as u64,
            "request completed"
        );
        Ok(MiddlewareResult::success())
    }
}

#[derive(Debug, Default)]
struct EndpointCounters {
    requests: AtomicU64,
    errors: AtomicU64,
    total_time_us: AtomicU64,
}

/// Per-endpoint aggregate.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    pub endpoint: String,
    pub requests: u64,
    pub errors: u64,
    pub avg_time_us: f64,
}

/// Per-endpoint request counters and latency aggregation.
pub struct MonitoringMiddleware {
    config: MiddlewareConfig,
    endpoints: DashMap<String, EndpointCounters>,
}

impl MonitoringMiddleware {
    #[must_use]
    pub fn new(config: MiddlewareConfig) -> Self {
        Self {
            config,
            endpoints: DashMap::new(),
        }
    }

    /// Aggregates for every observed endpoint.
    #[must_use]
    pub fn endpoint_stats(&self) -> Vec<EndpointStats> {
        self.endpoints
            .iter()
            .map(|entry| {
                let requests = entry.value().requests.load(Ordering::Relaxed);
                let total_us = entry.value().total_time_us.load(Ordering::Relaxed);
                #[allow(clippy::cast_precision_loss)]
                EndpointStats {
                    endpoint: entry.key().clone(),
                    requests,
                    errors: entry.value().errors.load(Ordering::Relaxed),
                    avg_time_us: if requests > 0 {
                        total_us as f64 / requests as f64
                    } else {
                        0.0
                    },
                }
            })
            .collect()
    }

    fn observe(&self, endpoint: &str, elapsed: Duration, is_error: bool) {
        let counters = self
            .endpoints
            .entry(endpoint.to_string())
            .or_default();
        counters.requests.fetch_add(1, Ordering::Relaxed);
        if is_error {
            counters.errors.fetch_add(1, Ordering::Relaxed);
        }
        counters
            .total_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }
}

#[async_trait]
impl Middleware for MonitoringMiddleware {
    fn config(&self) -> &MiddlewareConfig {
        &self.config
    }

    async fn process_request(
        &self,
        _ctx: &mut MiddlewareContext,
    ) -> anyhow::Result<MiddlewareResult> {
        Ok(MiddlewareResult::success())
    }

    async fn process_response(
        &self,
        ctx: &mut MiddlewareContext,
    ) -> anyhow::Result<MiddlewareResult> {
        let endpoint = format!("{} {}", ctx.request.method, ctx.request.path);
        let is_error = ctx
            .response
            .as_ref()
            .is_some_and(|r| r.status_code >= 500)
            || ctx.has_errors();
        self.observe(&endpoint, ctx.elapsed(), is_error);
        Ok(MiddlewareResult::success())
    }
}
