//! Cache tier implementations.
//!
//! Three tiers satisfy the [`Cache`](crate::traits::Cache) contract:
//!
//! - [`MemoryCache`] — in-process concurrent map with pluggable eviction
//!   (fast tier)
//! - [`RedisCache`] — pooled client to a shared Redis store with pipelined
//!   batches (warm tier)
//! - [`DiskCache`] — sharded value files with an on-disk index and optional
//!   compression (durable tier)
//!
//! Register any of them (or your own `Cache` implementation) with the
//! [`CacheCoordinator`](crate::coordinator::CacheCoordinator) at a priority
//! reflecting its speed.

pub mod disk;
pub mod memory;
pub mod redis;

pub use disk::{DiskCache, DiskCacheConfig};
pub use memory::{MemoryCache, MemoryCacheConfig};
pub use redis::{RedisCache, RedisCacheConfig};
