//! The cache manager.
//!
//! Every public operation is fail-open: backend and serialization failures are
//! logged and turned into a miss, `false` or `0`, so caching can never break
//! the operation it wraps. The only error `remember` can return is the
//! producer's own.
//!
//! # Stampede protection
//!
//! On a miss, `remember` takes a short-lived lock (`SET NX` on
//! `{prefix}:lock:{key}`, expiring after `lock_timeout`). The holder runs the
//! producer and stores the value; everyone else polls the key until it
//! appears, the lock disappears, or `lock_timeout` passes. Waiters that run
//! out of time run the producer themselves. This bounds latency rather than
//! guaranteeing exactly one producer call, so producers must tolerate running
//! more than once.

use super::backend::{CacheBackend, InMemoryBackend};
use super::context::RequestContext;
use super::invalidation::{InvalidationEvent, InvalidationPolicy};
use super::key::KeyNamespace;
use super::stats::{StatsCollector, StatsSnapshot};
use crate::config::Settings;
use crate::error::CacheError;
use crate::telemetry::metrics as names;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════════════════════
// Manager Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Runtime configuration of a [`CacheManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// When false, reads miss, writes are dropped and `remember` always
    /// calls the producer
    pub enabled: bool,

    /// Namespace for keys, tag sets and locks
    pub prefix: String,

    /// TTL used when the caller gives none
    pub default_ttl: Duration,

    /// Lock expiry, and the longest a waiter polls
    pub lock_timeout: Duration,

    /// Delay between polls while waiting on another caller
    pub lock_poll_interval: Duration,

    /// Probabilistic early refresh of hot entries
    pub early_expiration: bool,

    /// Larger values refresh earlier
    pub beta: f64,

    /// Per table/procedure TTLs
    pub ttl_overrides: HashMap<String, Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: "cachet".to_string(),
            default_ttl: Duration::from_secs(3600),
            lock_timeout: Duration::from_secs(10),
            lock_poll_interval: Duration::from_millis(50),
            early_expiration: false,
            beta: 1.0,
            ttl_overrides: HashMap::new(),
        }
    }
}

impl From<&Settings> for ManagerConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            enabled: settings.enabled,
            prefix: settings.prefix.clone(),
            default_ttl: settings.default_ttl,
            lock_timeout: settings.lock_timeout,
            lock_poll_interval: settings.lock_poll_interval,
            early_expiration: settings.early_expiration.enabled,
            beta: settings.early_expiration.beta,
            ttl_overrides: settings
                .ttl_overrides
                .iter()
                .map(|(name, secs)| (name.clone(), Duration::from_secs(*secs)))
                .collect(),
        }
    }
}

impl ManagerConfig {
    pub fn builder() -> ManagerConfigBuilder {
        ManagerConfigBuilder::default()
    }
}

/// Builder for manager configuration.
#[derive(Debug, Default)]
pub struct ManagerConfigBuilder {
    config: ManagerConfig,
}

impl ManagerConfigBuilder {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.prefix = prefix.into();
        self
    }

    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.config.default_ttl = ttl;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = timeout;
        self
    }

    pub fn lock_poll_interval(mut self, interval: Duration) -> Self {
        self.config.lock_poll_interval = interval;
        self
    }

    pub fn early_expiration(mut self, beta: f64) -> Self {
        self.config.early_expiration = true;
        self.config.beta = beta;
        self
    }

    pub fn ttl_override(mut self, name: impl Into<String>, ttl: Duration) -> Self {
        self.config.ttl_overrides.insert(name.into(), ttl);
        self
    }

    pub fn build(self) -> ManagerConfig {
        self.config
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Stored Entry
// ═══════════════════════════════════════════════════════════════════════════════

/// Envelope written to the backend for every cached value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub value: T,

    /// Zero means no expiry
    pub ttl_secs: u64,

    pub tags: Vec<String>,

    pub created_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    /// Fraction of the TTL already elapsed; `None` for entries that never expire.
    pub fn age_fraction(&self) -> Option<f64> {
        if self.ttl_secs == 0 {
            return None;
        }
        let age = (Utc::now() - self.created_at).num_milliseconds().max(0) as f64 / 1000.0;
        Some(age / self.ttl_secs as f64)
    }
}

enum Lookup<T> {
    Hit(CacheEntry<T>),
    Miss,
    Failed,
}

enum LockAttempt {
    Acquired(String),
    Busy,
    Unavailable,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Manager
// ═══════════════════════════════════════════════════════════════════════════════

/// Tag-indexed cache over a [`CacheBackend`].
///
/// Construct one per process at the composition root and share it by `Arc`.
pub struct CacheManager {
    backend: Arc<dyn CacheBackend>,
    namespace: KeyNamespace,
    config: ManagerConfig,
    stats: StatsCollector,
}

impl CacheManager {
    /// Create a manager over the given backend.
    pub fn new(backend: Arc<dyn CacheBackend>, config: ManagerConfig) -> Self {
        Self {
            backend,
            namespace: KeyNamespace::new(config.prefix.clone()),
            config,
            stats: StatsCollector::new(),
        }
    }

    /// Create a manager from loaded settings.
    pub fn from_settings(backend: Arc<dyn CacheBackend>, settings: &Settings) -> Self {
        Self::new(backend, ManagerConfig::from(settings))
    }

    /// Create a manager over a fresh in-memory backend.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryBackend::new()), ManagerConfig::default())
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn default_ttl(&self) -> Duration {
        self.config.default_ttl
    }

    /// TTL for a named table or procedure, falling back to the default.
    pub fn ttl_for(&self, name: &str) -> Duration {
        self.config
            .ttl_overrides
            .get(name)
            .copied()
            .unwrap_or(self.config.default_ttl)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    /// Get a value. Misses, backend failures and undecodable entries are `None`.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_entry(key).await.map(|entry| entry.value)
    }

    /// Get a value, or `default` when there is none.
    pub async fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).await.unwrap_or(default)
    }

    /// Get the stored envelope, including tags and creation time.
    pub async fn get_entry<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
        self.stats.record_operation("get");
        if !self.config.enabled {
            return None;
        }

        match self.fetch(&self.namespace.full_key(key)).await {
            Lookup::Hit(entry) => {
                self.stats.record_hit();
                Some(entry)
            }
            Lookup::Miss => {
                self.stats.record_miss();
                None
            }
            Lookup::Failed => None,
        }
    }

    /// Whether a key is present.
    pub async fn exists(&self, key: &str) -> bool {
        self.stats.record_operation("exists");
        if !self.config.enabled {
            return false;
        }
        match self.backend.exists(&self.namespace.full_key(key)).await {
            Ok(found) => found,
            Err(e) => {
                warn!(key, error = %e, "Cache exists check failed");
                false
            }
        }
    }

    /// Remaining TTL of a key; `None` when absent, unreachable or never expiring.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        self.stats.record_operation("ttl");
        match self.backend.ttl(&self.namespace.full_key(key)).await {
            Ok(ttl) => ttl,
            Err(e) => {
                warn!(key, error = %e, "Cache TTL lookup failed");
                None
            }
        }
    }

    /// One backend read, without touching statistics.
    async fn fetch<T: DeserializeOwned>(&self, full_key: &str) -> Lookup<T> {
        match self.backend.get(full_key).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<CacheEntry<T>>(&bytes) {
                Ok(entry) => Lookup::Hit(entry),
                Err(e) => {
                    warn!(key = full_key, error = %e, "Discarding undecodable cache entry");
                    Lookup::Miss
                }
            },
            Ok(None) => Lookup::Miss,
            Err(e) => {
                e.log();
                Lookup::Failed
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Store a value and index it under `tags`.
    ///
    /// `ttl` of `None` uses the default; `Some(Duration::ZERO)` never expires.
    /// Returns false if the value could not be encoded or written, or if a
    /// tag association failed (the value itself may then be present).
    #[instrument(skip(self, value, tags), fields(key = %key))]
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        tags: &[String],
    ) -> bool {
        self.stats.record_operation("set");
        if !self.config.enabled {
            return false;
        }
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        self.store(key, value, ttl, tags).await
    }

    /// Store a value that never expires.
    pub async fn set_forever<T: Serialize>(&self, key: &str, value: &T, tags: &[String]) -> bool {
        self.set(key, value, Some(Duration::ZERO), tags).await
    }

    async fn store<T: Serialize>(&self, key: &str, value: &T, ttl: Duration, tags: &[String]) -> bool {
        let entry = CacheEntry {
            value,
            ttl_secs: ttl.as_secs(),
            tags: tags.to_vec(),
            created_at: Utc::now(),
        };
        let bytes = match serde_json::to_vec(&entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key, error = %e, "Failed to serialize value for cache");
                return false;
            }
        };

        let full_key = self.namespace.full_key(key);
        let expiry = (!ttl.is_zero()).then_some(ttl);
        if let Err(e) = self.backend.set(&full_key, &bytes, expiry).await {
            e.log();
            return false;
        }
        self.stats.record_set(bytes.len());

        let mut indexed = true;
        for tag in tags {
            if let Err(e) = self.backend.set_add(&self.namespace.tag_key(tag), &full_key).await {
                warn!(key, tag = %tag, error = %e, "Failed to index cache key under tag");
                indexed = false;
            }
        }

        debug!(key, ttl_secs = ttl.as_secs(), tags = tags.len(), "Cache set");
        indexed
    }

    /// Delete a key. Returns whether it existed.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn delete(&self, key: &str) -> bool {
        self.stats.record_operation("delete");
        match self.backend.delete(&self.namespace.full_key(key)).await {
            Ok(removed) => {
                self.stats.record_delete();
                removed > 0
            }
            Err(e) => {
                e.log();
                false
            }
        }
    }

    /// Add `delta` to an integer key. `None` if the backend refused.
    pub async fn increment(&self, key: &str, delta: i64) -> Option<i64> {
        self.stats.record_operation("increment");
        self.add(key, delta).await
    }

    /// Subtract `delta` from an integer key.
    pub async fn decrement(&self, key: &str, delta: i64) -> Option<i64> {
        self.stats.record_operation("decrement");
        self.add(key, delta.checked_neg()?).await
    }

    async fn add(&self, key: &str, delta: i64) -> Option<i64> {
        match self.backend.increment(&self.namespace.full_key(key), delta).await {
            Ok(value) => Some(value),
            Err(e) => {
                e.log();
                None
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Remember
    // ─────────────────────────────────────────────────────────────────────────

    /// Get `key`, or compute it with `producer` and store it.
    ///
    /// Concurrent misses on the same key are coalesced through a backend lock
    /// (see the module docs). A producer error is returned as-is and nothing
    /// is stored.
    #[instrument(skip(self, tags, producer), fields(key = %key))]
    pub async fn remember<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        tags: &[String],
        producer: F,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.stats.record_operation("remember");
        if !self.config.enabled {
            return producer().await;
        }

        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let full_key = self.namespace.full_key(key);

        match self.fetch::<T>(&full_key).await {
            Lookup::Hit(entry) => {
                self.stats.record_hit();
                if self.should_refresh_early(&entry) {
                    return self.refresh_early(key, entry, ttl, tags, producer).await;
                }
                return Ok(entry.value);
            }
            Lookup::Miss => self.stats.record_miss(),
            Lookup::Failed => {
                // Backend unreachable; no point locking or storing
                return producer().await;
            }
        }

        match self.acquire_lock(key).await {
            LockAttempt::Acquired(token) => {
                let result = producer().await;
                if let Ok(value) = &result {
                    self.store(key, value, ttl, tags).await;
                }
                self.release_lock(key, &token).await;
                result
            }
            LockAttempt::Busy => {
                counter!(names::STAMPEDE_WAITS).increment(1);
                if let Some(value) = self.wait_for::<T>(key, &full_key).await {
                    return Ok(value);
                }

                counter!(names::STAMPEDE_FALLBACKS).increment(1);
                debug!(key, "Regeneration wait ended without a value, computing directly");
                let value = producer().await?;
                self.store(key, &value, ttl, tags).await;
                Ok(value)
            }
            LockAttempt::Unavailable => {
                let value = producer().await?;
                self.store(key, &value, ttl, tags).await;
                Ok(value)
            }
        }
    }

    /// [`remember`](Self::remember) with no expiry.
    pub async fn remember_forever<T, E, F, Fut>(
        &self,
        key: &str,
        tags: &[String],
        producer: F,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.remember(key, Some(Duration::ZERO), tags, producer).await
    }

    /// Refresh probability rises as the entry ages: refresh when a uniform
    /// draw exceeds `exp(-beta * elapsed / ttl)`.
    fn should_refresh_early<T>(&self, entry: &CacheEntry<T>) -> bool {
        if !self.config.early_expiration {
            return false;
        }
        match entry.age_fraction() {
            Some(fraction) => rand::random::<f64>() > (-self.config.beta * fraction).exp(),
            None => false,
        }
    }

    /// Recompute a still-valid entry if nobody else is already doing so.
    async fn refresh_early<T, E, F, Fut>(
        &self,
        key: &str,
        entry: CacheEntry<T>,
        ttl: Duration,
        tags: &[String],
        producer: F,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let LockAttempt::Acquired(token) = self.acquire_lock(key).await else {
            return Ok(entry.value);
        };

        counter!(names::EARLY_REFRESHES).increment(1);
        let value = match producer().await {
            Ok(fresh) => {
                self.store(key, &fresh, ttl, tags).await;
                fresh
            }
            Err(_) => {
                debug!(key, "Early refresh failed, serving cached value");
                entry.value
            }
        };
        self.release_lock(key, &token).await;
        Ok(value)
    }

    async fn acquire_lock(&self, key: &str) -> LockAttempt {
        let token = Uuid::new_v4().to_string();
        let lock_key = self.namespace.lock_key(key);
        match self
            .backend
            .set_nx(&lock_key, token.as_bytes(), self.config.lock_timeout)
            .await
        {
            Ok(true) => LockAttempt::Acquired(token),
            Ok(false) => LockAttempt::Busy,
            Err(e) => {
                e.log();
                LockAttempt::Unavailable
            }
        }
    }

    async fn release_lock(&self, key: &str, token: &str) {
        let lock_key = self.namespace.lock_key(key);
        match self.backend.release_lock(&lock_key, token).await {
            Ok(true) => {}
            Ok(false) => debug!(key, "Regeneration lock expired before release"),
            Err(e) => e.log(),
        }
    }

    /// Poll for a value another caller is producing.
    async fn wait_for<T: DeserializeOwned>(&self, key: &str, full_key: &str) -> Option<T> {
        let deadline = Instant::now() + self.config.lock_timeout;
        let lock_key = self.namespace.lock_key(key);

        while Instant::now() < deadline {
            tokio::time::sleep(self.config.lock_poll_interval).await;

            match self.fetch::<T>(full_key).await {
                Lookup::Hit(entry) => return Some(entry.value),
                Lookup::Failed => return None,
                Lookup::Miss => {}
            }

            // Holder gave up (producer failed) or its lock expired
            match self.backend.exists(&lock_key).await {
                Ok(true) => {}
                Ok(false) => {
                    return match self.fetch::<T>(full_key).await {
                        Lookup::Hit(entry) => Some(entry.value),
                        _ => None,
                    };
                }
                Err(_) => return None,
            }
        }

        CacheError::lock_timeout(key, self.config.lock_timeout).log();
        None
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Flushes
    // ─────────────────────────────────────────────────────────────────────────

    /// Delete every key indexed under any of `tags`, then the tag sets.
    ///
    /// Members are deleted before their tag set. Members that already expired
    /// count as nothing removed.
    #[instrument(skip(self))]
    pub async fn flush_tags(&self, tags: &[String]) -> u64 {
        self.stats.record_operation("flush_tags");
        let mut removed = 0;

        for tag in tags {
            let tag_key = self.namespace.tag_key(tag);
            let members = match self.backend.set_members(&tag_key).await {
                Ok(members) => members,
                Err(e) => {
                    warn!(tag = %tag, error = %e, "Failed to read tag index");
                    continue;
                }
            };

            match self.backend.delete_many(&members).await {
                Ok(count) => removed += count,
                Err(e) => {
                    // Keep the index so a retry can still find the members
                    warn!(tag = %tag, error = %e, "Failed to delete tagged keys");
                    continue;
                }
            }

            if let Err(e) = self.backend.delete(&tag_key).await {
                warn!(tag = %tag, error = %e, "Failed to delete tag index");
            }
        }

        self.stats.record_flush("tags");
        info!(tags = ?tags, removed, "Flushed cache tags");
        removed
    }

    /// Delete every key matching a glob pattern (`*`, `?`) under the prefix.
    /// Tag indexes are left alone.
    #[instrument(skip(self))]
    pub async fn flush_pattern(&self, pattern: &str) -> u64 {
        self.stats.record_operation("flush_pattern");
        let full_pattern = self.namespace.full_pattern(pattern);
        let keys = match self.backend.scan(&full_pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                e.log();
                return 0;
            }
        };

        // Tag sets and regeneration locks share the prefix but are not entries
        let tag_prefix = self.namespace.tag_key("");
        let lock_prefix = self.namespace.lock_key("");
        let keys: Vec<String> = keys
            .into_iter()
            .filter(|key| !key.starts_with(&tag_prefix) && !key.starts_with(&lock_prefix))
            .collect();

        let removed = match self.backend.delete_many(&keys).await {
            Ok(count) => count,
            Err(e) => {
                e.log();
                return 0;
            }
        };

        self.stats.record_flush("pattern");
        info!(pattern, removed, "Flushed cache pattern");
        removed
    }

    /// Flush the entire backend. Administrative use only.
    #[instrument(skip(self))]
    pub async fn flush_all(&self) -> bool {
        self.stats.record_operation("flush_all");
        match self.backend.flush_all().await {
            Ok(()) => {
                self.stats.record_flush("all");
                warn!(backend = self.backend.name(), "Flushed entire cache backend");
                true
            }
            Err(e) => {
                e.log();
                false
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Invalidation
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply one resolved invalidation. Returns the keys removed; a full
    /// flush reports zero since the backend does not count.
    pub async fn apply(&self, event: &InvalidationEvent) -> u64 {
        match event {
            InvalidationEvent::Key { key } => u64::from(self.delete(key).await),
            InvalidationEvent::Tag { tag } => self.flush_tags(std::slice::from_ref(tag)).await,
            InvalidationEvent::Pattern { pattern } => self.flush_pattern(pattern).await,
            InvalidationEvent::All => {
                self.flush_all().await;
                0
            }
        }
    }

    /// Apply an invalidation policy for a request.
    pub async fn invalidate(&self, policy: &InvalidationPolicy, ctx: &RequestContext) -> u64 {
        let events = policy.events(ctx);
        let mut removed = 0;
        for event in &events {
            removed += self.apply(event).await;
        }
        if !events.is_empty() {
            counter!(names::INVALIDATIONS, "source" => "policy").increment(removed);
        }
        removed
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct TestData {
        id: String,
        value: i32,
    }

    fn manager_with(backend: Arc<InMemoryBackend>, config: ManagerConfig) -> CacheManager {
        CacheManager::new(backend, config)
    }

    fn tags(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = CacheManager::in_memory();
        let data = TestData {
            id: "a".into(),
            value: 42,
        };

        assert!(cache.set("item:a", &data, None, &[]).await);
        assert_eq!(cache.get::<TestData>("item:a").await, Some(data.clone()));
        assert!(cache.exists("item:a").await);

        assert!(cache.delete("item:a").await);
        assert!(!cache.delete("item:a").await);
        assert_eq!(cache.get::<TestData>("item:a").await, None);
        assert_eq!(cache.get_or("item:a", 7).await, 7);
    }

    #[tokio::test]
    async fn test_keys_are_prefixed() {
        let backend = Arc::new(InMemoryBackend::new());
        let cache = manager_with(
            backend.clone(),
            ManagerConfig::builder().prefix("app").build(),
        );

        cache.set("user:1", &1, None, &tags(&["users"])).await;
        assert!(backend.exists("app:user:1").await.unwrap());
        assert_eq!(
            backend.set_members("app:tag:users").await.unwrap(),
            vec!["app:user:1"]
        );
    }

    #[tokio::test]
    async fn test_entry_envelope() {
        let cache = CacheManager::in_memory();
        cache
            .set("k", &"v", Some(Duration::from_secs(60)), &tags(&["t"]))
            .await;

        let entry = cache.get_entry::<String>("k").await.unwrap();
        assert_eq!(entry.value, "v");
        assert_eq!(entry.ttl_secs, 60);
        assert_eq!(entry.tags, vec!["t"]);
        assert!(entry.age_fraction().unwrap() < 0.5);
    }

    #[tokio::test]
    async fn test_stats_are_recorded_once_per_call() {
        let cache = CacheManager::in_memory();
        cache.set("k", &1, None, &tags(&["a", "b"])).await;
        cache.get::<i32>("k").await;
        cache.get::<i32>("missing").await;
        cache.delete("k").await;
        cache.flush_tags(&tags(&["a", "b"])).await;

        let stats = cache.stats();
        assert_eq!(stats.sets, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.deletes, 1);
        assert_eq!(stats.flushes, 1);
        assert!(stats.bytes_stored > 0);

        cache.reset_stats();
        assert_eq!(cache.stats().operations, 0);
    }

    #[tokio::test]
    async fn test_every_public_call_counts_one_operation() {
        let cache = CacheManager::in_memory();
        cache.exists("k").await;
        cache.ttl("k").await;
        cache.increment("n", 5).await;
        cache.decrement("n", 2).await;
        assert_eq!(cache.stats().operations, 4);

        let value: std::result::Result<i32, ()> =
            cache.remember("r", None, &[], || async { Ok(1) }).await;
        assert_eq!(value, Ok(1));
        assert_eq!(cache.get_or("r", 0).await, 1);
        cache.flush_pattern("none:*").await;
        cache.flush_all().await;

        let stats = cache.stats();
        assert_eq!(stats.operations, 8);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.sets, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_flush_pattern_spares_tag_indexes_and_locks() {
        let backend = Arc::new(InMemoryBackend::new());
        let cache = manager_with(backend.clone(), ManagerConfig::default());
        cache.set("a", &1, None, &tags(&["t"])).await;
        backend
            .set_nx("cachet:lock:b", b"token", Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(cache.flush_pattern("*").await, 1);
        assert!(!cache.exists("a").await);
        assert!(backend.exists("cachet:tag:t").await.unwrap());
        assert!(backend.exists("cachet:lock:b").await.unwrap());
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_a_miss() {
        let backend = Arc::new(InMemoryBackend::new());
        let cache = manager_with(backend.clone(), ManagerConfig::default());
        backend.set("cachet:bad", b"not json", None).await.unwrap();

        assert_eq!(cache.get::<TestData>("bad").await, None);
        cache.set("typed", &"text", None, &[]).await;
        assert_eq!(cache.get::<TestData>("typed").await, None);
    }

    #[tokio::test]
    async fn test_fail_open_on_backend_failure() {
        let backend = Arc::new(InMemoryBackend::new());
        let cache = manager_with(backend.clone(), ManagerConfig::default());
        cache.set("k", &1, None, &[]).await;

        backend.set_failing(true);
        assert_eq!(cache.get::<i32>("k").await, None);
        assert_eq!(cache.get_or("k", -1).await, -1);
        assert!(!cache.set("k", &2, None, &[]).await);
        assert!(!cache.delete("k").await);
        assert!(!cache.exists("k").await);
        assert_eq!(cache.flush_tags(&tags(&["x"])).await, 0);
        assert_eq!(cache.flush_pattern("*").await, 0);
        assert!(!cache.flush_all().await);
        assert_eq!(cache.increment("n", 1).await, None);

        let value: Result<i32, ()> = cache.remember("k", None, &[], || async { Ok(9) }).await;
        assert_eq!(value, Ok(9));

        // Failures are not counted as misses
        assert_eq!(cache.stats().misses, 0);
    }

    #[tokio::test]
    async fn test_disabled_cache() {
        let cache = manager_with(
            Arc::new(InMemoryBackend::new()),
            ManagerConfig::builder().enabled(false).build(),
        );
        assert!(!cache.set("k", &1, None, &[]).await);
        assert_eq!(cache.get::<i32>("k").await, None);

        let calls = AtomicU32::new(0);
        for _ in 0..2 {
            let value: Result<i32, ()> = cache
                .remember("k", None, &[], || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                })
                .await;
            assert_eq!(value, Ok(1));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_remember_caches_value() {
        let cache = CacheManager::in_memory();
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let value: Result<TestData, ()> = cache
                .remember("agent:1", None, &tags(&["agents"]), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(TestData {
                        id: "agent:1".into(),
                        value: 100,
                    })
                })
                .await;
            assert_eq!(value.unwrap().value, 100);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!cache.exists("lock:agent:1").await);
        assert_eq!(cache.flush_tags(&tags(&["agents"])).await, 1);
    }

    #[tokio::test]
    async fn test_remember_does_not_store_errors() {
        let cache = CacheManager::in_memory();
        let result: Result<i32, String> = cache
            .remember("k", None, &[], || async { Err("boom".to_string()) })
            .await;
        assert_eq!(result, Err("boom".to_string()));
        assert!(!cache.exists("k").await);
        // Lock is released so the next caller can try immediately
        assert!(!cache.exists("lock:k").await);
    }

    #[tokio::test]
    async fn test_waiter_falls_back_when_lock_is_held() {
        let backend = Arc::new(InMemoryBackend::new());
        let cache = manager_with(
            backend.clone(),
            ManagerConfig::builder()
                .lock_timeout(Duration::from_millis(200))
                .lock_poll_interval(Duration::from_millis(20))
                .build(),
        );

        // A crashed holder: the lock exists but no value will ever appear
        backend
            .set_nx("cachet:lock:k", b"someone-else", Duration::from_secs(5))
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let value: Result<i32, ()> = cache.remember("k", None, &[], || async { Ok(5) }).await;
        assert_eq!(value, Ok(5));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(cache.get::<i32>("k").await, Some(5));
        // Never releases a lock it does not own
        assert!(backend.exists("cachet:lock:k").await.unwrap());
    }

    #[tokio::test]
    async fn test_early_refresh_with_high_beta() {
        let cache = manager_with(
            Arc::new(InMemoryBackend::new()),
            ManagerConfig::builder().early_expiration(1_000_000.0).build(),
        );
        cache.set("k", &1, Some(Duration::from_secs(1)), &[]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let value: Result<i32, ()> = cache
            .remember("k", Some(Duration::from_secs(1)), &[], || async { Ok(2) })
            .await;
        assert_eq!(value, Ok(2));
        assert_eq!(cache.get::<i32>("k").await, Some(2));
    }

    #[tokio::test]
    async fn test_flush_tags_and_pattern() {
        let cache = CacheManager::in_memory();
        cache.set("user:1", &1, None, &tags(&["users"])).await;
        cache.set("user:2", &2, None, &tags(&["users", "admins"])).await;
        cache.set("post:1", &3, None, &tags(&["posts"])).await;

        assert_eq!(cache.flush_tags(&tags(&["users"])).await, 2);
        assert!(!cache.exists("user:2").await);
        assert!(cache.exists("post:1").await);
        // Dangling member of another tag counts as nothing removed
        assert_eq!(cache.flush_tags(&tags(&["admins"])).await, 0);

        cache.set("post:2", &4, None, &[]).await;
        assert_eq!(cache.flush_pattern("post:*").await, 2);
        assert!(!cache.exists("post:1").await);
    }

    #[tokio::test]
    async fn test_increment_decrement() {
        let cache = CacheManager::in_memory();
        assert_eq!(cache.increment("hits", 1).await, Some(1));
        assert_eq!(cache.increment("hits", 4).await, Some(5));
        assert_eq!(cache.decrement("hits", 2).await, Some(3));
    }

    #[tokio::test]
    async fn test_ttl_for_overrides() {
        let cache = manager_with(
            Arc::new(InMemoryBackend::new()),
            ManagerConfig::builder()
                .default_ttl(Duration::from_secs(60))
                .ttl_override("sp_get_users", Duration::from_secs(5))
                .build(),
        );
        assert_eq!(cache.ttl_for("sp_get_users"), Duration::from_secs(5));
        assert_eq!(cache.ttl_for("other"), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_invalidate_policy() {
        let cache = CacheManager::in_memory();
        cache.set("user:7", &1, None, &tags(&["users"])).await;
        cache.set("team:1", &1, None, &tags(&["teams"])).await;

        let policy = InvalidationPolicy::tags(["users"]).unwrap();
        assert_eq!(cache.invalidate(&policy, &RequestContext::new()).await, 1);
        assert!(cache.exists("team:1").await);

        assert_eq!(cache.invalidate(&InvalidationPolicy::all(), &RequestContext::new()).await, 0);
        assert!(!cache.exists("team:1").await);
    }
}
