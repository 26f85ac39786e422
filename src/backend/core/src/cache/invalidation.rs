//! Cache invalidation.
//!
//! This module provides:
//! - [`InvalidationPolicy`]: declarative invalidation attached to write routes
//! - [`InvalidationEvent`]: one concrete flush (key, tag, pattern or all)
//! - [`EventInvalidator`]: domain event names mapped to tag/key templates
//!
//! Policies only describe what to flush; the manager executes it.

use super::condition::Condition;
use super::context::RequestContext;
use super::manager::CacheManager;
use super::policy::validate_template;
use crate::config::Settings;
use crate::error::{CacheError, Result};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

// ═══════════════════════════════════════════════════════════════════════════════
// Invalidation Events
// ═══════════════════════════════════════════════════════════════════════════════

/// A single resolved invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InvalidationEvent {
    /// Delete one logical key
    Key { key: String },

    /// Flush every key indexed under a tag
    Tag { tag: String },

    /// Flush every key matching a glob pattern
    Pattern { pattern: String },

    /// Flush the whole backend
    All,
}

impl InvalidationEvent {
    pub fn key(key: impl Into<String>) -> Self {
        Self::Key { key: key.into() }
    }

    pub fn tag(tag: impl Into<String>) -> Self {
        Self::Tag { tag: tag.into() }
    }

    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self::Pattern { pattern: pattern.into() }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Key { .. } => "key",
            Self::Tag { .. } => "tag",
            Self::Pattern { .. } => "pattern",
            Self::All => "all",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Invalidation Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// When a route's invalidation runs relative to its handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationTiming {
    Before,
    #[default]
    After,
}

/// Declarative invalidation options as written in route configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InvalidationPolicySpec {
    pub tags: Vec<String>,
    /// Key templates with `{placeholder}`s
    pub keys: Vec<String>,
    pub pattern: Option<String>,
    pub all: bool,
    pub when: Option<String>,
    pub timing: InvalidationTiming,
    pub cascade: bool,
    pub cascade_tags: Vec<String>,
}

/// A validated invalidation policy.
#[derive(Debug, Clone)]
pub struct InvalidationPolicy {
    tags: Vec<String>,
    keys: Vec<String>,
    pattern: Option<String>,
    all: bool,
    when: Option<Condition>,
    timing: InvalidationTiming,
    cascade: bool,
    cascade_tags: Vec<String>,
}

impl InvalidationPolicy {
    /// Validate a declarative spec.
    ///
    /// # Errors
    ///
    /// `InvalidPolicy` when `all` is combined with tags, keys or a pattern,
    /// when nothing would be flushed, when `cascadeTags` is given without
    /// `cascade`, or when a condition or template is malformed.
    pub fn from_spec(spec: InvalidationPolicySpec) -> Result<Self> {
        let has_targets = !spec.tags.is_empty() || !spec.keys.is_empty() || spec.pattern.is_some();

        if spec.all && has_targets {
            return Err(CacheError::invalid_policy(
                "Invalidation policy cannot combine 'all' with tags, keys or pattern",
            ));
        }
        if !spec.all && !has_targets && !(spec.cascade && !spec.cascade_tags.is_empty()) {
            return Err(CacheError::invalid_policy(
                "Invalidation policy must name tags, keys, a pattern or 'all'",
            ));
        }
        if !spec.cascade && !spec.cascade_tags.is_empty() {
            return Err(CacheError::invalid_policy(
                "Invalidation policy sets 'cascadeTags' without 'cascade'",
            ));
        }

        for template in spec
            .tags
            .iter()
            .chain(&spec.keys)
            .chain(&spec.cascade_tags)
            .chain(spec.pattern.as_ref())
        {
            validate_template(template)?;
        }

        Ok(Self {
            when: spec.when.as_deref().map(Condition::parse).transpose()?,
            tags: spec.tags,
            keys: spec.keys,
            pattern: spec.pattern,
            all: spec.all,
            timing: spec.timing,
            cascade: spec.cascade,
            cascade_tags: spec.cascade_tags,
        })
    }

    /// Flush the given tags after the handler.
    pub fn tags(tags: impl IntoIterator<Item = impl Into<String>>) -> Result<Self> {
        Self::from_spec(InvalidationPolicySpec {
            tags: tags.into_iter().map(Into::into).collect(),
            ..Default::default()
        })
    }

    /// Flush everything after the handler.
    pub fn all() -> Self {
        Self {
            tags: Vec::new(),
            keys: Vec::new(),
            pattern: None,
            all: true,
            when: None,
            timing: InvalidationTiming::After,
            cascade: false,
            cascade_tags: Vec::new(),
        }
    }

    pub fn timing(&self) -> InvalidationTiming {
        self.timing
    }

    pub fn with_timing(mut self, timing: InvalidationTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn is_all(&self) -> bool {
        self.all
    }

    /// Whether the `when` condition (if any) holds.
    pub fn should_invalidate(&self, ctx: &RequestContext) -> bool {
        self.when.as_ref().map_or(true, |c| c.evaluate(ctx))
    }

    /// `tags ∪ cascadeTags` when cascading, else `tags`. Templates unresolved.
    pub fn all_tags(&self) -> Vec<String> {
        let mut tags = self.tags.clone();
        if self.cascade {
            for tag in &self.cascade_tags {
                if !tags.contains(tag) {
                    tags.push(tag.clone());
                }
            }
        }
        tags
    }

    /// Render the key templates; keys with unresolvable placeholders are dropped.
    pub fn resolve_keys(&self, ctx: &RequestContext) -> Vec<String> {
        self.keys.iter().filter_map(|k| ctx.render(k)).collect()
    }

    /// The concrete flushes for this request. Empty when `when` is false.
    pub fn events(&self, ctx: &RequestContext) -> Vec<InvalidationEvent> {
        if !self.should_invalidate(ctx) {
            return Vec::new();
        }
        if self.all {
            return vec![InvalidationEvent::All];
        }

        let mut events: Vec<InvalidationEvent> = self
            .all_tags()
            .iter()
            .filter_map(|t| ctx.render(t))
            .map(InvalidationEvent::tag)
            .collect();
        events.extend(self.resolve_keys(ctx).into_iter().map(InvalidationEvent::key));
        if let Some(pattern) = self.pattern.as_deref().and_then(|p| ctx.render(p)) {
            events.push(InvalidationEvent::pattern(pattern));
        }
        events
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Event-Driven Invalidation
// ═══════════════════════════════════════════════════════════════════════════════

const KEY_RULE_PREFIX: &str = "key:";
const PATTERN_RULE_PREFIX: &str = "pattern:";

/// Maps domain events (`user_updated`, `order_placed`, ...) to flushes.
///
/// Rule entries are templates: `key:user:{id}` deletes a key,
/// `pattern:feed:{id}:*` flushes a pattern, anything else names a tag.
pub struct EventInvalidator {
    manager: Arc<CacheManager>,
    rules: HashMap<String, Vec<String>>,
    sender: broadcast::Sender<InvalidationEvent>,
}

impl EventInvalidator {
    pub fn new(manager: Arc<CacheManager>, rules: HashMap<String, Vec<String>>) -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            manager,
            rules,
            sender,
        }
    }

    /// Build from the `invalidation_rules` table of the settings.
    pub fn from_settings(manager: Arc<CacheManager>, settings: &Settings) -> Self {
        Self::new(manager, settings.invalidation_rules.clone())
    }

    /// Names of the events with rules.
    pub fn events(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    /// Register or replace the templates for one event.
    pub fn register(&mut self, event: impl Into<String>, templates: Vec<String>) {
        self.rules.insert(event.into(), templates);
    }

    /// Receive every invalidation applied from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.sender.subscribe()
    }

    /// Resolve an event's rules against a context without applying them.
    pub fn events_for(&self, event: &str, ctx: &RequestContext) -> Vec<InvalidationEvent> {
        let Some(templates) = self.rules.get(event) else {
            return Vec::new();
        };

        templates
            .iter()
            .filter_map(|template| {
                if let Some(key) = template.strip_prefix(KEY_RULE_PREFIX) {
                    ctx.render(key).map(InvalidationEvent::key)
                } else if let Some(pattern) = template.strip_prefix(PATTERN_RULE_PREFIX) {
                    ctx.render(pattern).map(InvalidationEvent::pattern)
                } else {
                    ctx.render(template).map(InvalidationEvent::tag)
                }
            })
            .collect()
    }

    /// Apply the rules for a domain event. Returns the number of keys removed.
    pub async fn on_event(&self, event: &str, ctx: &RequestContext) -> u64 {
        let events = self.events_for(event, ctx);
        if events.is_empty() {
            debug!(event, "No invalidation rules matched");
            return 0;
        }

        let mut removed = 0;
        for invalidation in events {
            removed += self.manager.apply(&invalidation).await;
            // No subscribers is fine
            let _ = self.sender.send(invalidation);
        }

        counter!(crate::telemetry::metrics::INVALIDATIONS, "source" => "event").increment(removed);
        info!(event, removed, "Applied invalidation rules");
        removed
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_all_is_exclusive() {
        let err = InvalidationPolicy::from_spec(InvalidationPolicySpec {
            all: true,
            tags: vec!["users".into()],
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPolicy);

        assert!(InvalidationPolicy::from_spec(InvalidationPolicySpec {
            all: true,
            pattern: Some("user:*".into()),
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn test_empty_policy_is_rejected() {
        assert!(InvalidationPolicy::from_spec(InvalidationPolicySpec::default()).is_err());
    }

    #[test]
    fn test_cascade_tags_require_cascade() {
        let spec = InvalidationPolicySpec {
            tags: vec!["users".into()],
            cascade_tags: vec!["teams".into()],
            ..Default::default()
        };
        assert!(InvalidationPolicy::from_spec(spec.clone()).is_err());

        let policy = InvalidationPolicy::from_spec(InvalidationPolicySpec {
            cascade: true,
            ..spec
        })
        .unwrap();
        assert_eq!(policy.all_tags(), vec!["users", "teams"]);
    }

    #[test]
    fn test_spec_deserializes_camel_case() {
        let spec: InvalidationPolicySpec = serde_json::from_value(json!({
            "tags": ["users"],
            "keys": ["user:{id}"],
            "timing": "before",
            "cascade": true,
            "cascadeTags": ["teams"],
        }))
        .unwrap();
        let policy = InvalidationPolicy::from_spec(spec).unwrap();
        assert_eq!(policy.timing(), InvalidationTiming::Before);
    }

    #[test]
    fn test_events_resolve_templates() {
        let policy = InvalidationPolicy::from_spec(InvalidationPolicySpec {
            tags: vec!["users".into(), "team:{team}".into()],
            keys: vec!["user:{id}".into(), "profile:{missing}".into()],
            pattern: Some("feed:{id}:*".into()),
            ..Default::default()
        })
        .unwrap();

        let ctx = RequestContext::new().with_param("id", 7);
        assert_eq!(
            policy.events(&ctx),
            vec![
                InvalidationEvent::tag("users"),
                InvalidationEvent::key("user:7"),
                InvalidationEvent::pattern("feed:7:*"),
            ]
        );
    }

    #[test]
    fn test_when_gates_events() {
        let policy = InvalidationPolicy::from_spec(InvalidationPolicySpec {
            tags: vec!["posts".into()],
            when: Some("params.publish == true".into()),
            ..Default::default()
        })
        .unwrap();

        let draft = RequestContext::new().with_param("publish", false);
        let published = RequestContext::new().with_param("publish", true);
        assert!(!policy.should_invalidate(&draft));
        assert!(policy.events(&draft).is_empty());
        assert_eq!(policy.events(&published), vec![InvalidationEvent::tag("posts")]);
    }

    #[test]
    fn test_all_policy_events() {
        let policy = InvalidationPolicy::all();
        assert_eq!(policy.events(&RequestContext::new()), vec![InvalidationEvent::All]);
    }

    #[tokio::test]
    async fn test_event_invalidator_rules() {
        let manager = Arc::new(CacheManager::in_memory());
        let ttl = Some(Duration::from_secs(60));
        manager.set("user:7", &"u", ttl, &["users".to_string()]).await;
        manager.set("other", &"o", ttl, &["users".to_string()]).await;
        manager.set("feed:7:1", &"f", ttl, &[]).await;
        manager.set("feed:8:1", &"f", ttl, &[]).await;

        let mut rules = HashMap::new();
        rules.insert(
            "user_updated".to_string(),
            vec!["key:user:{id}".to_string(), "pattern:feed:{id}:*".to_string()],
        );
        let invalidator = EventInvalidator::new(manager.clone(), rules);
        let mut events = invalidator.subscribe();

        let ctx = RequestContext::new().with_param("id", 7);
        let removed = invalidator.on_event("user_updated", &ctx).await;

        assert_eq!(removed, 2);
        assert!(!manager.exists("user:7").await);
        assert!(!manager.exists("feed:7:1").await);
        assert!(manager.exists("other").await);
        assert!(manager.exists("feed:8:1").await);
        assert_eq!(events.recv().await.unwrap(), InvalidationEvent::key("user:7"));

        assert_eq!(invalidator.on_event("unknown", &ctx).await, 0);
    }

    #[tokio::test]
    async fn test_event_invalidator_tags() {
        let manager = Arc::new(CacheManager::in_memory());
        manager
            .set("user:1", &1, None, &["users".to_string()])
            .await;

        let mut invalidator = EventInvalidator::new(manager.clone(), HashMap::new());
        invalidator.register("users_imported", vec!["users".to_string()]);

        assert_eq!(invalidator.on_event("users_imported", &RequestContext::new()).await, 1);
        assert!(!manager.exists("user:1").await);
    }

    #[tokio::test]
    async fn test_event_invalidator_from_settings() {
        let manager = Arc::new(CacheManager::in_memory());
        manager.set("order:3", &3, None, &["orders".to_string()]).await;
        manager.set("order:4", &4, None, &["orders".to_string()]).await;

        let mut settings = Settings::default();
        settings.invalidation_rules.insert(
            "order_shipped".to_string(),
            vec!["key:order:{id}".to_string()],
        );
        let invalidator = EventInvalidator::from_settings(manager.clone(), &settings);

        assert_eq!(invalidator.events().collect::<Vec<_>>(), vec!["order_shipped"]);
        let ctx = RequestContext::new().with_param("id", 3);
        assert_eq!(invalidator.on_event("order_shipped", &ctx).await, 1);
        assert!(!manager.exists("order:3").await);
        assert!(manager.exists("order:4").await);
    }
}
