#![allow(clippy::result_large_err)]
//! # Cachet Core
//!
//! A tag-indexed cache layer for web services.
//!
//! ## Architecture
//!
//! - **Cache Manager**: typed get/set/remember over Redis with tag indexing
//!   and single-flight regeneration
//! - **Policies**: declarative per-route caching and invalidation rules
//! - **Query Cache**: parameter-hashed operation results tagged by table
//! - **Warmer**: scheduled population of keys and HTTP endpoints
//! - **HTTP Middleware**: axum/tower layers, ETag and `Cache-Control` helpers
//! - **Telemetry**: structured logging and `metrics` counters

pub mod cache;
pub mod config;
pub mod error;
pub mod telemetry;

pub use error::{CacheError, ErrorCode, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache::{
        CacheBackend, CacheControl, CacheDecision, CacheManager, CachePolicy, CacheWarmer,
        ETagGenerator, EventInvalidator, InMemoryBackend, InvalidationEvent, InvalidationLayer,
        InvalidationPolicy, InvalidationTiming, ManagerConfig, QueryCache, RedisBackend,
        RequestContext, ResponseCacheLayer, WarmTarget,
    };
    pub use crate::config::Settings;
    pub use crate::error::{CacheError, ErrorCode, ErrorSeverity, Result};
}
