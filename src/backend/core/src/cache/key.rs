//! Cache key construction.
//!
//! Every key the manager hands to a backend is namespaced:
//!
//! - values: `{prefix}:{key}`
//! - tag index sets: `{prefix}:tag:{tag}`
//! - regeneration locks: `{prefix}:lock:{key}`
//!
//! Query keys are fixed-width digests so arbitrary SQL text or large parameter
//! objects never end up verbatim in the keyspace.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hex characters kept from each SHA-256 digest.
pub const DIGEST_WIDTH: usize = 32;

/// Sentinel used in place of a parameter digest when there are no parameters.
pub const NO_PARAMS: &str = "no-params";

// ═══════════════════════════════════════════════════════════════════════════════
// Namespacing
// ═══════════════════════════════════════════════════════════════════════════════

/// Resolves logical keys, tags and locks against a configured prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyNamespace {
    prefix: String,
}

impl KeyNamespace {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix: String = prefix.into();
        Self {
            prefix: prefix.trim_end_matches(':').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `{prefix}:{key}`
    pub fn full_key(&self, key: &str) -> String {
        self.join(key)
    }

    /// `{prefix}:tag:{tag}`
    pub fn tag_key(&self, tag: &str) -> String {
        self.join(&format!("tag:{}", tag))
    }

    /// `{prefix}:lock:{key}`
    pub fn lock_key(&self, key: &str) -> String {
        self.join(&format!("lock:{}", key))
    }

    /// Namespace a glob pattern the same way as a key.
    pub fn full_pattern(&self, pattern: &str) -> String {
        self.join(pattern)
    }

    fn join(&self, rest: &str) -> String {
        if self.prefix.is_empty() {
            rest.to_string()
        } else {
            format!("{}:{}", self.prefix, rest)
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Key Hashing Utilities
// ═══════════════════════════════════════════════════════════════════════════════

/// SHA-256 of `input`, hex encoded and truncated to [`DIGEST_WIDTH`].
pub fn digest(input: &[u8]) -> String {
    let mut hex = hex::encode(Sha256::digest(input));
    hex.truncate(DIGEST_WIDTH);
    hex
}

/// Serialize to JSON with object keys sorted at every depth.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<String> {
    let value = serde_json::to_value(value)?;
    serde_json::to_string(&sort_value(value))
}

fn sort_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, sort_value(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_value).collect()),
        other => other,
    }
}

fn is_empty_params(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Digest of a parameter set, or [`NO_PARAMS`] when it is empty.
pub fn params_digest(params: &Value) -> serde_json::Result<String> {
    if is_empty_params(params) {
        return Ok(NO_PARAMS.to_string());
    }
    Ok(digest(canonical_json(params)?.as_bytes()))
}

/// `query:{digest(name)}`, the prefix shared by every key of one operation.
pub fn query_key_prefix(name: &str) -> String {
    format!("query:{}", digest(name.as_bytes()))
}

/// `query:{digest(name)}:{digest(params) | no-params}`
pub fn query_key(name: &str, params: &Value) -> serde_json::Result<String> {
    Ok(format!("{}:{}", query_key_prefix(name), params_digest(params)?))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
