//! Cache Fabric
//!
//! A multi-level cache coordination fabric with a pluggable
//! request-processing middleware pipeline, built for market-data
//! platforms:
//! - **Cache Coordinator**: memory / Redis / disk tiers behind one facade
//!   with read/write routing policies, health-aware failover, gated
//!   promotion of hot data and periodic cross-tier synchronization
//! - **Middleware Pipeline**: a priority-ordered interceptor chain
//!   (authentication, authorization, rate limiting, response caching,
//!   CORS, logging, monitoring) executed forward on requests and in
//!   reverse on responses, with per-middleware short-circuit and error
//!   isolation
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cache_fabric::backends::{MemoryCache, MemoryCacheConfig, RedisCache, RedisCacheConfig};
//! use cache_fabric::coordinator::{CacheCoordinator, CoordinatorConfig};
//! use cache_fabric::{CacheKey, CacheValue};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let coordinator = CacheCoordinator::new(CoordinatorConfig::default());
//!     coordinator.add_cache(
//!         Arc::new(MemoryCache::new(MemoryCacheConfig::new("hot"))),
//!         0,
//!     )?;
//!     coordinator.add_cache(
//!         Arc::new(RedisCache::connect(RedisCacheConfig::new("shared")).await?),
//!         1,
//!     )?;
//!     coordinator.start().await?;
//!
//!     let key = CacheKey::new("ticker", "btc-usd")?;
//!     coordinator
//!         .set(&key, CacheValue::new(b"42000.5".to_vec()), None)
//!         .await?;
//!     if let Some(value) = coordinator.get(&key).await? {
//!         println!("cached: {} bytes", value.data.len());
//!     }
//!
//!     coordinator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! request → middleware pipeline (authn → authz → rate limit → caching → cors → …)
//!              │ caching / rate-limit state
//!              ▼
//!          cache coordinator → memory tier → redis tier → disk tier
//!                               ↓ hit        ↓ hit (gated  ↓ hit
//!                               return       promotion)    backfill
//! ```

pub mod backends;
pub mod codecs;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod key;
pub mod middleware;
pub mod stats;
pub mod strategies;
pub mod traits;

pub use config::{CacheConfig, CacheLevel, EvictionPolicy, SerializationFormat};
pub use coordinator::{
    CacheCoordinator, CoordinatorConfig, CoordinatorStats, ReadPolicy, SyncStrategy, WritePolicy,
};
pub use error::CacheError;
pub use key::{CacheEntry, CacheKey, CacheValue};
pub use middleware::{
    Middleware, MiddlewareChain, MiddlewareConfig, MiddlewareContext, MiddlewarePipeline,
    MiddlewarePriority, MiddlewareProcessor, MiddlewareRequest, MiddlewareResponse,
    MiddlewareResult, MiddlewareType,
};
pub use stats::{CacheStatistics, CacheStatsSnapshot};
pub use traits::{Cache, CacheHealthReport, FillFn};

// Re-export async_trait for custom tier and middleware implementations
pub use async_trait::async_trait;
