//! Declarative cache policies.
//!
//! A route or operation declares a [`CachePolicySpec`] (the serde surface,
//! camelCase so it can sit in JSON/TOML route tables). Building it into a
//! [`CachePolicy`] validates every option and parses conditions once; after
//! that, [`CachePolicy::evaluate`] is pure and never fails.
//!
//! Evaluation order:
//!
//! 1. `always` caches forever and skips the auth and condition checks
//! 2. `authenticated` / `guest` requirements
//! 3. `when` must hold, `unless` must not
//! 4. method, then (when known) response status
//! 5. key: the template, else `{prefix}:{METHOD}:{path}` plus a vary digest
//! 6. TTL: `always` is forever, else the policy TTL, else the caller default

use super::condition::Condition;
use super::context::{value_to_key_fragment, RequestContext};
use super::key::digest;
use super::middleware::CacheControl;
use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_KEY_PREFIX: &str = "route";

// ═══════════════════════════════════════════════════════════════════════════════
// Policy Surface
// ═══════════════════════════════════════════════════════════════════════════════

/// Declarative cache options as written in route configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CachePolicySpec {
    /// Seconds; `0` is forever, absent falls back to the caller default
    pub ttl: Option<u64>,
    pub tags: Vec<String>,
    /// Key template with `{placeholder}`s
    pub key: Option<String>,
    pub vary_by: Vec<String>,
    pub when: Option<String>,
    pub unless: Option<String>,
    pub always: bool,
    pub authenticated: bool,
    pub guest: bool,
    /// Empty means `GET` and `HEAD`
    pub methods: Vec<String>,
    /// Empty means `200`
    pub status_codes: Vec<u16>,
    pub vary_by_query: bool,
    pub vary_by_headers: bool,
    /// Header names folded into the key when `varyByHeaders` is set
    pub headers: Vec<String>,
    pub prefix: Option<String>,
    pub max_age: Option<u64>,
    pub public: bool,
    pub private: bool,
    pub must_revalidate: bool,
    pub etag: bool,
    pub last_modified: bool,
}

/// Authentication requirement of a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRequirement {
    Any,
    Authenticated,
    Guest,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cache-Control Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// HTTP-facing directives of a policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControlPolicy {
    pub public: bool,
    pub private: bool,
    pub max_age: Option<u64>,
    pub must_revalidate: bool,
    pub immutable: bool,
    /// Attach an `ETag` to served responses
    pub etag: bool,
    /// Attach `Last-Modified` from the entry's creation time
    pub last_modified: bool,
}

impl CacheControlPolicy {
    /// Reject contradictory directives.
    pub fn validate(&self) -> Result<()> {
        if self.public && self.private {
            return Err(CacheError::invalid_policy(
                "Cache policy cannot be both public and private",
            ));
        }
        Ok(())
    }

    /// The `Cache-Control` builder, or `None` when no directive is set.
    pub fn to_cache_control(&self) -> Option<CacheControl> {
        let mut cc = CacheControl::new();
        if self.public {
            cc = cc.public();
        }
        if self.private {
            cc = cc.private();
        }
        if let Some(max_age) = self.max_age {
            cc = cc.max_age(Duration::from_secs(max_age));
        }
        if self.must_revalidate {
            cc = cc.must_revalidate();
        }
        if self.immutable {
            cc = cc.immutable();
        }
        (!cc.is_empty()).then_some(cc)
    }

    pub fn header_value(&self) -> Option<String> {
        self.to_cache_control().map(|cc| cc.build())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Decisions
// ═══════════════════════════════════════════════════════════════════════════════

/// Why a request is not cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AuthenticationRequired,
    GuestOnly,
    WhenNotMet,
    UnlessMet,
    MethodNotCacheable,
    StatusNotCacheable,
    UnresolvedKey,
}

/// Concrete plan for one cacheable request.
#[derive(Debug, Clone, PartialEq)]
pub struct CachePlan {
    pub key: String,
    /// Zero means forever
    pub ttl: Duration,
    pub tags: Vec<String>,
    pub cache_control: Option<String>,
    /// `Vary` header value listing the headers folded into the key
    pub vary: Option<String>,
    pub etag: bool,
    pub last_modified: bool,
}

/// Outcome of evaluating a policy against a request.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheDecision {
    Cache(CachePlan),
    Skip(SkipReason),
}

impl CacheDecision {
    pub fn is_cacheable(&self) -> bool {
        matches!(self, Self::Cache(_))
    }

    pub fn plan(&self) -> Option<&CachePlan> {
        match self {
            Self::Cache(plan) => Some(plan),
            Self::Skip(_) => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// A validated, ready-to-evaluate cache policy.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    ttl: Option<Duration>,
    tags: Vec<String>,
    key_template: Option<String>,
    vary_by: Vec<String>,
    when: Option<Condition>,
    unless: Option<Condition>,
    always: bool,
    auth: AuthRequirement,
    methods: Vec<String>,
    status_codes: Vec<u16>,
    vary_by_query: bool,
    vary_by_headers: bool,
    headers: Vec<String>,
    prefix: String,
    cache_control: CacheControlPolicy,
}

impl CachePolicy {
    pub fn builder() -> CachePolicyBuilder {
        CachePolicyBuilder::default()
    }

    /// Validate a declarative spec.
    ///
    /// # Errors
    ///
    /// `InvalidPolicy` when `authenticated` and `guest` are both set, when
    /// `public` and `private` are both set, or when a condition, template,
    /// method or status code is malformed.
    pub fn from_spec(spec: CachePolicySpec) -> Result<Self> {
        if spec.authenticated && spec.guest {
            return Err(CacheError::invalid_policy(
                "Cache policy cannot require both authenticated and guest requests",
            ));
        }

        let cache_control = CacheControlPolicy {
            public: spec.public,
            private: spec.private,
            max_age: spec.max_age,
            must_revalidate: spec.must_revalidate,
            immutable: spec.always,
            etag: spec.etag,
            last_modified: spec.last_modified,
        };
        cache_control.validate()?;

        let when = spec.when.as_deref().map(Condition::parse).transpose()?;
        let unless = spec.unless.as_deref().map(Condition::parse).transpose()?;

        if let Some(template) = &spec.key {
            validate_template(template)?;
        }
        for tag in &spec.tags {
            validate_template(tag)?;
        }

        let methods = if spec.methods.is_empty() {
            vec!["GET".to_string(), "HEAD".to_string()]
        } else {
            spec.methods
                .iter()
                .map(|m| {
                    let method = m.trim().to_ascii_uppercase();
                    if method.is_empty() || !method.chars().all(|c| c.is_ascii_alphabetic()) {
                        Err(CacheError::invalid_policy(format!("Invalid HTTP method '{}'", m)))
                    } else {
                        Ok(method)
                    }
                })
                .collect::<Result<Vec<_>>>()?
        };

        let status_codes = if spec.status_codes.is_empty() {
            vec![200]
        } else {
            if let Some(bad) = spec.status_codes.iter().find(|s| !(100..=599).contains(*s)) {
                return Err(CacheError::invalid_policy(format!("Invalid status code {}", bad)));
            }
            spec.status_codes
        };

        let auth = match (spec.authenticated, spec.guest) {
            (true, _) => AuthRequirement::Authenticated,
            (_, true) => AuthRequirement::Guest,
            _ => AuthRequirement::Any,
        };

        Ok(Self {
            ttl: spec.ttl.map(Duration::from_secs),
            tags: spec.tags,
            key_template: spec.key,
            vary_by: spec.vary_by,
            when,
            unless,
            always: spec.always,
            auth,
            methods,
            status_codes,
            vary_by_query: spec.vary_by_query,
            vary_by_headers: spec.vary_by_headers,
            headers: spec.headers.iter().map(|h| h.to_ascii_lowercase()).collect(),
            prefix: spec
                .prefix
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
            cache_control,
        })
    }

    pub fn auth_requirement(&self) -> AuthRequirement {
        self.auth
    }

    pub fn cache_control(&self) -> &CacheControlPolicy {
        &self.cache_control
    }

    pub fn is_always(&self) -> bool {
        self.always
    }

    /// Whether a response with this status may be stored.
    pub fn should_store(&self, status: u16) -> bool {
        self.status_codes.contains(&status)
    }

    pub fn allows_method(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }

    /// Evaluate the policy against a request.
    pub fn evaluate(&self, ctx: &RequestContext, default_ttl: Duration) -> CacheDecision {
        if !self.always {
            match self.auth {
                AuthRequirement::Authenticated if !ctx.is_authenticated() => {
                    return CacheDecision::Skip(SkipReason::AuthenticationRequired);
                }
                AuthRequirement::Guest if ctx.is_authenticated() => {
                    return CacheDecision::Skip(SkipReason::GuestOnly);
                }
                _ => {}
            }

            if let Some(when) = &self.when {
                if !when.evaluate(ctx) {
                    return CacheDecision::Skip(SkipReason::WhenNotMet);
                }
            }
            if let Some(unless) = &self.unless {
                if unless.evaluate(ctx) {
                    return CacheDecision::Skip(SkipReason::UnlessMet);
                }
            }
        }

        let method = ctx.method().unwrap_or("GET");
        if !self.allows_method(method) {
            return CacheDecision::Skip(SkipReason::MethodNotCacheable);
        }
        if let Some(status) = ctx.status() {
            if !self.should_store(status) {
                return CacheDecision::Skip(SkipReason::StatusNotCacheable);
            }
        }

        let key = match self.resolve_key(ctx, method) {
            Some(key) => key,
            None => return CacheDecision::Skip(SkipReason::UnresolvedKey),
        };

        let ttl = if self.always {
            Duration::ZERO
        } else {
            self.ttl.unwrap_or(default_ttl)
        };

        let tags = self
            .tags
            .iter()
            .filter_map(|tag| ctx.render(tag))
            .collect();

        CacheDecision::Cache(CachePlan {
            key,
            ttl,
            tags,
            cache_control: self.cache_control.header_value(),
            vary: (self.vary_by_headers && !self.headers.is_empty()).then(|| self.headers.join(", ")),
            etag: self.cache_control.etag,
            last_modified: self.cache_control.last_modified,
        })
    }

    fn resolve_key(&self, ctx: &RequestContext, method: &str) -> Option<String> {
        if let Some(template) = &self.key_template {
            let rendered = ctx.render(template)?;
            return Some(format!("{}:{}", self.prefix, rendered));
        }

        let path = ctx.path().unwrap_or("/");
        let base = format!("{}:{}:{}", self.prefix, method.to_ascii_uppercase(), path);

        let mut vary = Vec::new();
        for field in &self.vary_by {
            let value = ctx.lookup(field).map(value_to_key_fragment).unwrap_or_default();
            vary.push(format!("{}={}", field, value));
        }
        if self.vary_by_query {
            for (name, value) in ctx.query_pairs() {
                vary.push(format!("query.{}={}", name, value));
            }
        }
        if self.vary_by_headers {
            for name in &self.headers {
                vary.push(format!("headers.{}={}", name, ctx.header(name).unwrap_or_default()));
            }
        }

        if vary.is_empty() {
            Some(base)
        } else {
            Some(format!("{}:{}", base, digest(vary.join("&").as_bytes())))
        }
    }
}

pub(crate) fn validate_template(template: &str) -> Result<()> {
    let balanced = template
        .chars()
        .try_fold(false, |open, c| match (open, c) {
            (false, '{') => Some(true),
            (true, '}') => Some(false),
            (true, '{') | (false, '}') => None,
            (state, _) => Some(state),
        })
        .is_some_and(|open| !open);

    if balanced && !template.contains("{}") {
        Ok(())
    } else {
        Err(CacheError::invalid_policy(format!(
            "Template '{}' has unbalanced or empty placeholders",
            template
        )))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════════════

/// Fluent construction of a [`CachePolicy`]; validated by [`build`](Self::build).
#[derive(Debug, Default)]
pub struct CachePolicyBuilder {
    spec: CachePolicySpec,
}

impl CachePolicyBuilder {
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.spec.ttl = Some(ttl.as_secs());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.spec.tags.push(tag.into());
        self
    }

    pub fn tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.spec.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn key(mut self, template: impl Into<String>) -> Self {
        self.spec.key = Some(template.into());
        self
    }

    pub fn vary_by(mut self, field: impl Into<String>) -> Self {
        self.spec.vary_by.push(field.into());
        self
    }

    pub fn vary_by_query(mut self) -> Self {
        self.spec.vary_by_query = true;
        self
    }

    pub fn vary_by_headers(mut self, headers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.spec.vary_by_headers = true;
        self.spec.headers.extend(headers.into_iter().map(Into::into));
        self
    }

    pub fn when(mut self, expression: impl Into<String>) -> Self {
        self.spec.when = Some(expression.into());
        self
    }

    pub fn unless(mut self, expression: impl Into<String>) -> Self {
        self.spec.unless = Some(expression.into());
        self
    }

    pub fn always(mut self) -> Self {
        self.spec.always = true;
        self
    }

    pub fn authenticated(mut self) -> Self {
        self.spec.authenticated = true;
        self
    }

    pub fn guest(mut self) -> Self {
        self.spec.guest = true;
        self
    }

    pub fn methods(mut self, methods: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.spec.methods = methods.into_iter().map(Into::into).collect();
        self
    }

    pub fn status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.spec.status_codes = codes.into_iter().collect();
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.spec.prefix = Some(prefix.into());
        self
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.spec.max_age = Some(max_age.as_secs());
        self
    }

    pub fn public(mut self) -> Self {
        self.spec.public = true;
        self
    }

    pub fn private(mut self) -> Self {
        self.spec.private = true;
        self
    }

    pub fn must_revalidate(mut self) -> Self {
        self.spec.must_revalidate = true;
        self
    }

    pub fn etag(mut self) -> Self {
        self.spec.etag = true;
        self
    }

    pub fn last_modified(mut self) -> Self {
        self.spec.last_modified = true;
        self
    }

    pub fn build(self) -> Result<CachePolicy> {
        CachePolicy::from_spec(self.spec)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
