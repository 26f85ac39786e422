//! Tag-indexed caching layer.
//!
//! - **Backends**: Redis for production, an in-process map for tests and
//!   single-node use, both behind [`CacheBackend`]
//! - **Manager**: typed get/set/remember with tag indexing, stampede
//!   protection and optional probabilistic early expiration
//! - **Policies**: declarative per-route caching and invalidation rules
//!   evaluated against a [`RequestContext`]
//! - **Query cache**: operation results keyed by name and parameter digest,
//!   tagged by the tables they read
//! - **Warmer**: background population of known keys and endpoints
//! - **HTTP middleware**: tower layers for response caching and
//!   invalidation, plus `Cache-Control`/ETag helpers
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │  ResponseCacheLayer   InvalidationLayer   QueryCache   CacheWarmer   │
//! │         │                    │                │             │        │
//! │   CachePolicy        InvalidationPolicy       │             │        │
//! │         └──────────┬─────────┴────────────────┴─────────────┘        │
//! │                    ▼                                                 │
//! │  ┌────────────────────────────────────────────────────────────────┐ │
//! │  │ CacheManager  (namespace, tag index, locks, stats)             │ │
//! │  └───────────────────────────┬────────────────────────────────────┘ │
//! │                              ▼                                      │
//! │                 CacheBackend: RedisBackend | InMemoryBackend        │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use cachet_core::cache::{CacheManager, CachePolicy, ResponseCacheLayer};
//!
//! let manager = Arc::new(CacheManager::from_settings(backend, &settings));
//!
//! let user: User = manager
//!     .remember("user:42", Some(Duration::from_secs(300)), &["users".into()], || load_user(42))
//!     .await?;
//!
//! let policy = CachePolicy::builder()
//!     .ttl(Duration::from_secs(60))
//!     .tag("products")
//!     .build()?;
//! let app = Router::new()
//!     .route("/products", get(list_products))
//!     .layer(ResponseCacheLayer::new(manager.clone(), policy));
//!
//! manager.flush_tags(&["products".into()]).await;
//! ```

pub mod backend;
pub mod condition;
pub mod context;
pub mod invalidation;
pub mod key;
pub mod manager;
pub mod middleware;
pub mod policy;
pub mod query;
pub mod stats;
pub mod warmer;

pub use backend::{CacheBackend, InMemoryBackend, RedisBackend, RedisConfig};
pub use condition::Condition;
pub use context::RequestContext;
pub use invalidation::{
    EventInvalidator, InvalidationEvent, InvalidationPolicy, InvalidationPolicySpec,
    InvalidationTiming,
};
pub use key::{query_key, KeyNamespace};
pub use manager::{CacheEntry, CacheManager, ManagerConfig, ManagerConfigBuilder};
pub use middleware::{
    CacheControl, CacheDirective, CachedResponse, ETagGenerator, InvalidationLayer,
    ResponseCacheLayer,
};
pub use policy::{
    AuthRequirement, CacheDecision, CachePlan, CachePolicy, CachePolicyBuilder, CachePolicySpec,
    SkipReason,
};
pub use query::{table_tag, QueryCache};
pub use stats::{StatsCollector, StatsSnapshot};
pub use warmer::{CacheWarmer, HttpWarmTarget, WarmReport, WarmTarget};
