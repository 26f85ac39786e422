//! Query and stored-procedure result caching.
//!
//! Results are keyed by the operation name (or query text) and its
//! parameters, both hashed, and tagged with the tables they read from so
//! writes to a table can flush every result derived from it.

use super::key::{query_key, query_key_prefix};
use super::manager::CacheManager;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

const TABLE_TAG_PREFIX: &str = "table:";
const QUERY_TAG_PREFIX: &str = "query:";

/// Tag flushed when `table` changes.
pub fn table_tag(table: &str) -> String {
    format!("{}{}", TABLE_TAG_PREFIX, table)
}

/// Cache for named operations over a shared [`CacheManager`].
#[derive(Clone)]
pub struct QueryCache {
    manager: Arc<CacheManager>,
}

impl QueryCache {
    pub fn new(manager: Arc<CacheManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }

    /// Derive the cache key. `None` if the parameters cannot be serialized.
    pub fn key<P: Serialize + ?Sized>(&self, name: &str, params: &P) -> Option<String> {
        let derived = serde_json::to_value(params).and_then(|value| query_key(name, &value));
        match derived {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(operation = name, error = %e, "Query parameters are not serializable");
                None
            }
        }
    }

    /// `table:{t}` for every table plus `query:{name}`.
    pub fn tags(&self, name: &str, tables: &[&str]) -> Vec<String> {
        let mut tags: Vec<String> = tables.iter().map(|t| table_tag(t)).collect();
        tags.push(format!("{}{}", QUERY_TAG_PREFIX, name));
        tags
    }

    /// Get a cached result, or run the operation and cache it.
    ///
    /// The TTL is the per-operation override if one is configured, else the
    /// manager default.
    #[instrument(skip(self, params, tables, producer))]
    pub async fn remember<P, T, E, F, Fut>(
        &self,
        name: &str,
        params: &P,
        tables: &[&str],
        producer: F,
    ) -> std::result::Result<T, E>
    where
        P: Serialize + ?Sized,
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let Some(key) = self.key(name, params) else {
            return producer().await;
        };
        let ttl = self.manager.ttl_for(name);
        let tags = self.tags(name, tables);
        self.manager.remember(&key, Some(ttl), &tags, producer).await
    }

    pub async fn get<P, T>(&self, name: &str, params: &P) -> Option<T>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let key = self.key(name, params)?;
        self.manager.get(&key).await
    }

    pub async fn put<P, T>(&self, name: &str, params: &P, value: &T, tables: &[&str]) -> bool
    where
        P: Serialize + ?Sized,
        T: Serialize,
    {
        let Some(key) = self.key(name, params) else {
            return false;
        };
        let ttl = self.manager.ttl_for(name);
        self.manager
            .set(&key, value, Some(ttl), &self.tags(name, tables))
            .await
    }

    /// Drop the cached result for one parameter set.
    pub async fn forget<P: Serialize + ?Sized>(&self, name: &str, params: &P) -> bool {
        match self.key(name, params) {
            Some(key) => self.manager.delete(&key).await,
            None => false,
        }
    }

    /// With parameters, drop that one result; without, drop every result of
    /// the operation.
    pub async fn invalidate_by_operation(&self, name: &str, params: Option<&Value>) -> u64 {
        let removed = match params {
            Some(params) => u64::from(self.forget(name, params).await),
            None => {
                let pattern = format!("{}:*", query_key_prefix(name));
                self.manager.flush_pattern(&pattern).await
            }
        };
        debug!(operation = name, removed, "Invalidated query results");
        removed
    }

    /// Drop every result tagged with `table`.
    pub async fn invalidate_by_table(&self, table: &str) -> u64 {
        self.manager.flush_tags(&[table_tag(table)]).await
    }

    pub async fn invalidate_by_tables(&self, tables: &[&str]) -> u64 {
        let tags: Vec<String> = tables.iter().map(|t| table_tag(t)).collect();
        self.manager.flush_tags(&tags).await
    }
}
