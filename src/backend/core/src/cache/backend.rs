//! Cache backend implementations.
//!
//! A backend is a thin adapter over a key-value store. It knows nothing about
//! prefixes, tags or policies; the manager hands it fully-resolved keys.
//!
//! - **RedisBackend**: the production store, shared by every cache instance
//! - **InMemoryBackend**: a process-local store with the same semantics, used
//!   for tests, benches and single-node development
//!
//! Absence is `Ok(None)` / `Ok(false)`; a failure to reach or use the store is
//! always an `Err`, never a miss.

use crate::error::{CacheError, ErrorCode, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Backend Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Trait for cache backends.
///
/// A `ttl` of `None` or zero stores without expiry.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get a raw value.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a raw value.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;

    /// Store a value only if the key is absent. Returns whether it was stored.
    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Delete `key` only while it still holds `token`.
    async fn release_lock(&self, key: &str, token: &str) -> Result<bool>;

    /// Delete a key. Returns the number of keys removed (0 or 1).
    async fn delete(&self, key: &str) -> Result<u64>;

    /// Delete many keys. Returns the number actually removed.
    async fn delete_many(&self, keys: &[String]) -> Result<u64>;

    /// Check if a key exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Add `delta` (may be negative) to an integer key, creating it at zero.
    async fn increment(&self, key: &str, delta: i64) -> Result<i64>;

    /// Remaining time to live. `None` when the key is absent or never expires.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// List keys matching a Redis glob pattern.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>>;

    /// Add a member to a set.
    async fn set_add(&self, key: &str, member: &str) -> Result<()>;

    /// Read all members of a set.
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Remove every key in the store.
    async fn flush_all(&self) -> Result<()>;

    /// Check connectivity.
    async fn ping(&self) -> Result<()>;

    /// Get the backend name.
    fn name(&self) -> &'static str;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis Backend
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for the Redis backend.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Command timeout
    pub command_timeout: Duration,

    /// Keys requested per SCAN round-trip
    pub scan_count: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(2),
            scan_count: 100,
        }
    }
}

impl From<&crate::config::RedisSettings> for RedisConfig {
    fn from(settings: &crate::config::RedisSettings) -> Self {
        Self {
            url: settings.url.clone(),
            connect_timeout: settings.connect_timeout,
            command_timeout: settings.command_timeout,
            ..Default::default()
        }
    }
}

/// Compare-and-delete so a holder never releases a lock it no longer owns.
const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Redis cache backend.
///
/// Holds one reconnecting multiplexed connection; clones of it are cheap and
/// safe to use from any number of concurrent callers.
pub struct RedisBackend {
    conn: ConnectionManager,
    config: RedisConfig,
    release_script: redis::Script,
}

impl RedisBackend {
    /// Connect to Redis and verify the connection with a PING.
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| {
            CacheError::with_internal(
                ErrorCode::ConfigurationError,
                "Invalid Redis URL",
                e.to_string(),
            )
        })?;

        let conn = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
            .await??;

        let backend = Self {
            conn,
            config,
            release_script: redis::Script::new(RELEASE_LOCK_SCRIPT),
        };
        backend.ping().await?;

        info!("Redis cache backend connected to {}", backend.config.url);
        Ok(backend)
    }

    /// Run one command against a fresh handle, bounded by the command timeout.
    async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let conn = self.conn.clone();
        let value = tokio::time::timeout(self.config.command_timeout, op(conn)).await??;
        Ok(value)
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.run(|mut conn| async move {
            redis::cmd("GET").arg(key).query_async(&mut conn).await
        })
        .await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let millis = ttl.filter(|t| !t.is_zero()).map(|t| t.as_millis().max(1) as u64);
        self.run(|mut conn| async move {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            if let Some(millis) = millis {
                cmd.arg("PX").arg(millis);
            }
            cmd.query_async::<_, ()>(&mut conn).await
        })
        .await
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let millis = ttl.as_millis().max(1) as u64;
        let reply: Option<String> = self
            .run(|mut conn| async move {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(millis)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(reply.is_some())
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<bool> {
        let script = &self.release_script;
        let removed: i64 = self
            .run(|mut conn| async move {
                let mut invocation = script.key(key);
                invocation.arg(token);
                invocation.invoke_async(&mut conn).await
            })
            .await?;
        Ok(removed > 0)
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let removed: u64 = self
            .run(|mut conn| async move { redis::cmd("DEL").arg(key).query_async(&mut conn).await })
            .await?;
        Ok(removed)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let removed: u64 = self
            .run(|mut conn| async move { redis::cmd("DEL").arg(keys).query_async(&mut conn).await })
            .await?;
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.run(|mut conn| async move {
            redis::cmd("EXISTS").arg(key).query_async(&mut conn).await
        })
        .await
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        self.run(|mut conn| async move {
            redis::cmd("INCRBY").arg(key).arg(delta).query_async(&mut conn).await
        })
        .await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let millis: i64 = self
            .run(|mut conn| async move { redis::cmd("PTTL").arg(key).query_async(&mut conn).await })
            .await?;
        // -2: missing, -1: no expiry
        Ok((millis >= 0).then(|| Duration::from_millis(millis as u64)))
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let count = self.config.scan_count;
        let mut cursor: u64 = 0;
        let mut found = Vec::new();

        loop {
            let (next, keys): (u64, Vec<String>) = self
                .run(|mut conn| async move {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(count)
                        .query_async(&mut conn)
                        .await
                })
                .await?;

            found.extend(keys);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        // SCAN may return a key more than once
        found.sort();
        found.dedup();
        Ok(found)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        self.run(|mut conn| async move {
            redis::cmd("SADD").arg(key).arg(member).query_async::<_, ()>(&mut conn).await
        })
        .await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        self.run(|mut conn| async move {
            redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await
        })
        .await
    }

    async fn flush_all(&self) -> Result<()> {
        self.run(|mut conn| async move {
            redis::cmd("FLUSHDB").query_async::<_, ()>(&mut conn).await
        })
        .await?;
        info!("Flushed Redis database");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let pong: String = self
            .run(|mut conn| async move { redis::cmd("PING").query_async(&mut conn).await })
            .await?;
        debug!(reply = %pong, "Redis ping");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Backend
// ═══════════════════════════════════════════════════════════════════════════════

enum StoredValue {
    Bytes(Vec<u8>),
    Set(HashSet<String>),
}

struct InMemoryEntry {
    value: StoredValue,
    expires_at: Option<Instant>,
}

impl InMemoryEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Process-local backend with Redis-like semantics.
///
/// Expiry is checked lazily on access, the way Redis treats reads of
/// logically expired keys.
#[derive(Default)]
pub struct InMemoryBackend {
    entries: DashMap<String, InMemoryEntry>,
    failing: AtomicBool,
}

impl InMemoryBackend {
    /// Create a new in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail as if the store were unreachable.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.value().is_expired()).count()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CacheError::unavailable("in-memory backend marked as failing"));
        }
        Ok(())
    }

    fn expiry(ttl: Option<Duration>) -> Option<Instant> {
        ttl.filter(|t| !t.is_zero()).map(|t| Instant::now() + t)
    }

    /// Drop `key` if it is logically expired.
    fn purge_if_expired(&self, key: &str) {
        self.entries.remove_if(key, |_, entry| entry.is_expired());
    }

    fn wrong_type(key: &str) -> CacheError {
        CacheError::backend(format!("WRONGTYPE operation against key {}", key))
    }
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check()?;
        self.purge_if_expired(key);
        match self.entries.get(key) {
            Some(entry) => match &entry.value {
                StoredValue::Bytes(bytes) => Ok(Some(bytes.clone())),
                StoredValue::Set(_) => Err(Self::wrong_type(key)),
            },
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        self.check()?;
        self.entries.insert(
            key.to_string(),
            InMemoryEntry {
                value: StoredValue::Bytes(value.to_vec()),
                expires_at: Self::expiry(ttl),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        self.check()?;
        self.purge_if_expired(key);
        let mut inserted = false;
        self.entries.entry(key.to_string()).or_insert_with(|| {
            inserted = true;
            InMemoryEntry {
                value: StoredValue::Bytes(value.to_vec()),
                expires_at: Self::expiry(Some(ttl)),
            }
        });
        Ok(inserted)
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<bool> {
        self.check()?;
        let removed = self.entries.remove_if(key, |_, entry| {
            !entry.is_expired()
                && matches!(&entry.value, StoredValue::Bytes(b) if b.as_slice() == token.as_bytes())
        });
        Ok(removed.is_some())
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        self.check()?;
        self.purge_if_expired(key);
        Ok(self.entries.remove(key).map_or(0, |_| 1))
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        self.check()?;
        let mut removed = 0;
        for key in keys {
            self.purge_if_expired(key);
            if self.entries.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check()?;
        self.purge_if_expired(key);
        Ok(self.entries.contains_key(key))
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        self.check()?;
        self.purge_if_expired(key);
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| InMemoryEntry {
            value: StoredValue::Bytes(b"0".to_vec()),
            expires_at: None,
        });

        let current = match &entry.value {
            StoredValue::Bytes(bytes) => std::str::from_utf8(bytes)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| CacheError::backend("value is not an integer or out of range"))?,
            StoredValue::Set(_) => return Err(Self::wrong_type(key)),
        };

        let next = current
            .checked_add(delta)
            .ok_or_else(|| CacheError::backend("increment or decrement would overflow"))?;
        entry.value = StoredValue::Bytes(next.to_string().into_bytes());
        Ok(next)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.check()?;
        self.purge_if_expired(key);
        Ok(self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now())))
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        self.check()?;
        let regex = regex::Regex::new(&glob_to_regex(pattern)).map_err(|e| {
            CacheError::with_internal(ErrorCode::InvalidPattern, "Invalid key pattern", e.to_string())
        })?;

        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !e.value().is_expired() && regex.is_match(e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        self.check()?;
        self.purge_if_expired(key);
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| InMemoryEntry {
            value: StoredValue::Set(HashSet::new()),
            expires_at: None,
        });
        match &mut entry.value {
            StoredValue::Set(members) => {
                members.insert(member.to_string());
                Ok(())
            }
            StoredValue::Bytes(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        self.check()?;
        self.purge_if_expired(key);
        match self.entries.get(key) {
            Some(entry) => match &entry.value {
                StoredValue::Set(members) => {
                    let mut members: Vec<String> = members.iter().cloned().collect();
                    members.sort();
                    Ok(members)
                }
                StoredValue::Bytes(_) => Err(Self::wrong_type(key)),
            },
            None => Ok(Vec::new()),
        }
    }

    async fn flush_all(&self) -> Result<()> {
        self.check()?;
        self.entries.clear();
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

/// Convert a Redis-style glob pattern to an anchored regex.
///
/// Supports `*`, `?`, `[abc]`, `[^a]`, `[a-z]` and `\x` escapes. An
/// unterminated `[` matches itself.
pub(crate) fn glob_to_regex(glob: &str) -> String {
    let mut regex = String::with_capacity(glob.len() * 2);
    regex.push('^');

    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            '\\' => match chars.next() {
                Some(escaped) => push_literal(&mut regex, escaped),
                None => push_literal(&mut regex, '\\'),
            },
            '[' => {
                let mut class = String::from("[");
                let mut raw = String::from("[");
                let mut closed = false;
                if chars.peek() == Some(&'^') {
                    chars.next();
                    class.push('^');
                    raw.push('^');
                }
                while let Some(member) = chars.next() {
                    raw.push(member);
                    match member {
                        ']' => {
                            closed = true;
                            break;
                        }
                        '-' => class.push('-'),
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                raw.push(escaped);
                                push_literal(&mut class, escaped);
                            }
                        }
                        other => push_literal(&mut class, other),
                    }
                }

                if !closed {
                    for literal in raw.chars() {
                        push_literal(&mut regex, literal);
                    }
                } else if class == "[" || class == "[^" {
                    // `[]` matches nothing, `[^]` anything
                    regex.push_str(if class == "[" { "[^\\s\\S]" } else { "." });
                } else {
                    class.push(']');
                    regex.push_str(&class);
                }
            }
            other => push_literal(&mut regex, other),
        }
    }

    regex.push('$');
    regex
}

fn push_literal(regex: &mut String, c: char) {
    regex.push_str(&regex::escape(c.encode_utf8(&mut [0; 4])));
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
