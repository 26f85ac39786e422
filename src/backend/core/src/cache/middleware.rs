//! HTTP caching middleware.
//!
//! Two tower layers sit in front of axum routes:
//!
//! - [`ResponseCacheLayer`] evaluates a [`CachePolicy`] per request, serves
//!   cached responses (with `If-None-Match` revalidation) and stores fresh
//!   ones through [`CacheManager::remember`], so concurrent misses on one
//!   route run the handler once.
//! - [`InvalidationLayer`] applies an [`InvalidationPolicy`] before or after
//!   the handler.
//!
//! The header helpers ([`CacheControl`], [`ETagGenerator`]) are usable on
//! their own.

use super::context::RequestContext;
use super::invalidation::{InvalidationPolicy, InvalidationTiming};
use super::manager::CacheManager;
use super::policy::{CacheDecision, CachePolicy};
use crate::telemetry::metrics::RESPONSE_CACHE;
use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::Response,
};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use metrics::counter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::mem::discriminant;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::{Layer, Service};
use tracing::{debug, warn};

const X_CACHE: &str = "x-cache";

/// Connection-scoped headers that must not be replayed from a stored response.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Control Directives
// ═══════════════════════════════════════════════════════════════════════════════

/// Cache-Control directive types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheDirective {
    MaxAge(u64),
    /// Shared-cache max age
    SMaxAge(u64),
    NoCache,
    NoStore,
    MustRevalidate,
    Private,
    Public,
    Immutable,
    StaleWhileRevalidate(u64),
}

impl CacheDirective {
    pub fn to_header_string(&self) -> String {
        match self {
            Self::MaxAge(secs) => format!("max-age={}", secs),
            Self::SMaxAge(secs) => format!("s-maxage={}", secs),
            Self::NoCache => "no-cache".to_string(),
            Self::NoStore => "no-store".to_string(),
            Self::MustRevalidate => "must-revalidate".to_string(),
            Self::Private => "private".to_string(),
            Self::Public => "public".to_string(),
            Self::Immutable => "immutable".to_string(),
            Self::StaleWhileRevalidate(secs) => format!("stale-while-revalidate={}", secs),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Control Builder
// ═══════════════════════════════════════════════════════════════════════════════

/// Builder for `Cache-Control` values.
///
/// Directives render in insertion order. Adding a directive of a kind that
/// is already present replaces it in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheControl {
    directives: Vec<CacheDirective>,
}

impl CacheControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// `public, max-age=<one year>, immutable`
    pub fn static_assets() -> Self {
        Self::new()
            .public()
            .max_age(Duration::from_secs(31_536_000))
            .immutable()
    }

    pub fn no_cache() -> Self {
        Self::new()
            .with_directive(CacheDirective::NoCache)
            .with_directive(CacheDirective::NoStore)
            .must_revalidate()
    }

    pub fn with_directive(mut self, directive: CacheDirective) -> Self {
        match self
            .directives
            .iter_mut()
            .find(|d| discriminant(*d) == discriminant(&directive))
        {
            Some(existing) => *existing = directive,
            None => self.directives.push(directive),
        }
        self
    }

    pub fn max_age(self, duration: Duration) -> Self {
        self.with_directive(CacheDirective::MaxAge(duration.as_secs()))
    }

    pub fn s_maxage(self, duration: Duration) -> Self {
        self.with_directive(CacheDirective::SMaxAge(duration.as_secs()))
    }

    pub fn private(self) -> Self {
        self.with_directive(CacheDirective::Private)
    }

    pub fn public(self) -> Self {
        self.with_directive(CacheDirective::Public)
    }

    pub fn immutable(self) -> Self {
        self.with_directive(CacheDirective::Immutable)
    }

    pub fn must_revalidate(self) -> Self {
        self.with_directive(CacheDirective::MustRevalidate)
    }

    pub fn stale_while_revalidate(self, duration: Duration) -> Self {
        self.with_directive(CacheDirective::StaleWhileRevalidate(duration.as_secs()))
    }

    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }

    pub fn build(&self) -> String {
        self.directives
            .iter()
            .map(|d| d.to_header_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn to_header_value(&self) -> HeaderValue {
        HeaderValue::from_str(&self.build()).unwrap_or_else(|_| HeaderValue::from_static("no-cache"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ETag Generator
// ═══════════════════════════════════════════════════════════════════════════════

/// ETag generation and comparison.
pub struct ETagGenerator;

impl ETagGenerator {
    /// Strong ETag: quoted first 16 bytes of the body's SHA-256.
    pub fn strong(content: &[u8]) -> String {
        let hash = Sha256::digest(content);
        format!("\"{}\"", hex::encode(&hash[..16]))
    }

    pub fn weak(content: &[u8]) -> String {
        let hash = Sha256::digest(content);
        format!("W/\"{}\"", hex::encode(&hash[..8]))
    }

    /// Weak comparison: a `W/` prefix on either side is ignored.
    pub fn matches(etag1: &str, etag2: &str) -> bool {
        etag1.trim_start_matches("W/") == etag2.trim_start_matches("W/")
    }

    /// Match against an `If-None-Match` value (list or `*`).
    pub fn matches_any(etag: &str, if_none_match: &str) -> bool {
        if if_none_match.trim() == "*" {
            return true;
        }
        if_none_match
            .split(',')
            .any(|candidate| Self::matches(etag, candidate.trim()))
    }
}

fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cached Response
// ═══════════════════════════════════════════════════════════════════════════════

/// A buffered HTTP response as stored in the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(with = "base64_body")]
    pub body: Vec<u8>,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

mod base64_body {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

impl CachedResponse {
    /// Buffer a response. An ETag already set by the handler is kept;
    /// otherwise one is generated when `with_etag` is set.
    pub async fn capture(response: Response, with_etag: bool, with_last_modified: bool) -> Self {
        let (parts, body) = response.into_parts();
        let bytes = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to buffer response body");
                Default::default()
            }
        };

        let existing_etag = parts
            .headers
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let etag = existing_etag.or_else(|| with_etag.then(|| ETagGenerator::strong(&bytes)));
        let created_at = Utc::now();

        let headers = parts
            .headers
            .iter()
            .filter(|(name, _)| {
                let name = name.as_str();
                name != "etag"
                    && name != X_CACHE
                    && !(with_last_modified && name == "last-modified")
                    && !HOP_BY_HOP.contains(&name)
            })
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.to_string(), v.to_string())))
            .collect();

        Self {
            status: parts.status.as_u16(),
            headers,
            body: bytes.to_vec(),
            etag,
            last_modified: with_last_modified.then_some(created_at),
            created_at,
        }
    }

    /// Whether the response hands out a cookie. Such responses are
    /// per-client and never stored.
    pub fn sets_cookie(&self) -> bool {
        self.headers.iter().any(|(name, _)| name == "set-cookie")
    }

    /// Seconds since the response was captured.
    pub fn age_secs(&self) -> i64 {
        (Utc::now() - self.created_at).num_seconds().max(0)
    }

    pub fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        let mut response = Response::builder().status(status);

        for (name, value) in self.headers {
            if let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::from_str(&value)) {
                response = response.header(name, value);
            }
        }
        if let Some(etag) = self.etag.as_deref().and_then(|e| HeaderValue::from_str(e).ok()) {
            response = response.header(header::ETAG, etag);
        }
        if let Some(modified) = self.last_modified {
            response = response.header(header::LAST_MODIFIED, http_date(modified));
        }

        response
            .body(Body::from(self.body))
            .unwrap_or_else(|_| Response::new(Body::empty()))
    }
}

/// 304 Not Modified carrying the validator.
pub fn not_modified_response(etag: Option<&str>) -> Response {
    let mut response = Response::builder().status(StatusCode::NOT_MODIFIED);
    if let Some(value) = etag.and_then(|e| HeaderValue::from_str(e).ok()) {
        response = response.header(header::ETAG, value);
    }
    response
        .header(X_CACHE, "HIT")
        .body(Body::empty())
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Response Cache Layer
// ═══════════════════════════════════════════════════════════════════════════════

/// Adds application state (auth, route params) to the request context
/// before policies see it.
pub type ContextFn = Arc<dyn Fn(&Request, &mut RequestContext) + Send + Sync>;

fn build_context(request: &Request, extend: Option<&ContextFn>) -> RequestContext {
    let mut ctx = RequestContext::from_http(request.method(), request.uri(), request.headers());
    if let Some(extend) = extend {
        extend(request, &mut ctx);
    }
    ctx
}

/// Layer that caches route responses under a [`CachePolicy`].
#[derive(Clone)]
pub struct ResponseCacheLayer {
    manager: Arc<CacheManager>,
    policy: Arc<CachePolicy>,
    context_fn: Option<ContextFn>,
}

impl ResponseCacheLayer {
    pub fn new(manager: Arc<CacheManager>, policy: CachePolicy) -> Self {
        Self {
            manager,
            policy: Arc::new(policy),
            context_fn: None,
        }
    }

    pub fn with_context<F>(mut self, extend: F) -> Self
    where
        F: Fn(&Request, &mut RequestContext) + Send + Sync + 'static,
    {
        self.context_fn = Some(Arc::new(extend));
        self
    }
}

impl<S> Layer<S> for ResponseCacheLayer {
    type Service = ResponseCache<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ResponseCache {
            inner,
            manager: self.manager.clone(),
            policy: self.policy.clone(),
            context_fn: self.context_fn.clone(),
        }
    }
}

/// Service produced by [`ResponseCacheLayer`].
#[derive(Clone)]
pub struct ResponseCache<S> {
    inner: S,
    manager: Arc<CacheManager>,
    policy: Arc<CachePolicy>,
    context_fn: Option<ContextFn>,
}

/// Why a produced response did not end up in the cache.
enum Bypass<E> {
    Uncacheable(CachedResponse),
    Inner(E),
}

impl<S> Service<Request> for ResponseCache<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Send + Sync + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let manager = self.manager.clone();
        let policy = self.policy.clone();

        let ctx = build_context(&request, self.context_fn.as_ref());
        let if_none_match = request
            .headers()
            .get(header::IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Box::pin(async move {
            let plan = match policy.evaluate(&ctx, manager.default_ttl()) {
                CacheDecision::Cache(plan) if manager.is_enabled() => plan,
                CacheDecision::Cache(_) => return inner.call(request).await,
                CacheDecision::Skip(reason) => {
                    debug!(?reason, path = ?ctx.path(), "Response cache bypassed");
                    counter!(RESPONSE_CACHE, "outcome" => "bypass").increment(1);
                    return inner.call(request).await;
                }
            };

            let produced = Arc::new(AtomicBool::new(false));
            let produced_flag = produced.clone();
            let (with_etag, with_last_modified) = (plan.etag, plan.last_modified);
            let store_policy = policy.clone();

            let result = manager
                .remember(&plan.key, Some(plan.ttl), &plan.tags, move || async move {
                    produced_flag.store(true, Ordering::SeqCst);
                    let response = match inner.call(request).await {
                        Ok(response) => response,
                        Err(e) => return Err(Bypass::Inner(e)),
                    };
                    let captured = CachedResponse::capture(response, with_etag, with_last_modified).await;
                    if store_policy.should_store(captured.status) && !captured.sets_cookie() {
                        Ok(captured)
                    } else {
                        Err(Bypass::Uncacheable(captured))
                    }
                })
                .await;

            let cached = match result {
                Ok(cached) => cached,
                Err(Bypass::Uncacheable(captured)) => {
                    counter!(RESPONSE_CACHE, "outcome" => "uncacheable").increment(1);
                    return Ok(captured.into_response());
                }
                Err(Bypass::Inner(e)) => return Err(e),
            };

            if let (Some(etag), Some(candidates)) = (&cached.etag, &if_none_match) {
                if ETagGenerator::matches_any(etag, candidates) {
                    counter!(RESPONSE_CACHE, "outcome" => "not_modified").increment(1);
                    return Ok(not_modified_response(Some(etag)));
                }
            }

            let hit = !produced.load(Ordering::SeqCst);
            counter!(RESPONSE_CACHE, "outcome" => if hit { "hit" } else { "miss" }).increment(1);

            let age = cached.age_secs();
            let mut response = cached.into_response();
            let headers = response.headers_mut();
            headers.insert(
                HeaderName::from_static(X_CACHE),
                HeaderValue::from_static(if hit { "HIT" } else { "MISS" }),
            );
            if hit {
                headers.insert(header::AGE, HeaderValue::from(age));
            }
            if let Some(value) = plan.cache_control.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
                headers.insert(header::CACHE_CONTROL, value);
            }
            if let Some(value) = plan.vary.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
                headers.insert(header::VARY, value);
            }
            Ok(response)
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Invalidation Layer
// ═══════════════════════════════════════════════════════════════════════════════

/// Layer that applies an [`InvalidationPolicy`] around a handler.
///
/// `After` timing fires only for 2xx responses. `Before` timing fires
/// regardless of how the handler turns out.
#[derive(Clone)]
pub struct InvalidationLayer {
    manager: Arc<CacheManager>,
    policy: Arc<InvalidationPolicy>,
    context_fn: Option<ContextFn>,
}

impl InvalidationLayer {
    pub fn new(manager: Arc<CacheManager>, policy: InvalidationPolicy) -> Self {
        Self {
            manager,
            policy: Arc::new(policy),
            context_fn: None,
        }
    }

    pub fn with_context<F>(mut self, extend: F) -> Self
    where
        F: Fn(&Request, &mut RequestContext) + Send + Sync + 'static,
    {
        self.context_fn = Some(Arc::new(extend));
        self
    }
}

impl<S> Layer<S> for InvalidationLayer {
    type Service = Invalidate<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Invalidate {
            inner,
            manager: self.manager.clone(),
            policy: self.policy.clone(),
            context_fn: self.context_fn.clone(),
        }
    }
}

/// Service produced by [`InvalidationLayer`].
#[derive(Clone)]
pub struct Invalidate<S> {
    inner: S,
    manager: Arc<CacheManager>,
    policy: Arc<InvalidationPolicy>,
    context_fn: Option<ContextFn>,
}

impl<S> Service<Request> for Invalidate<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let manager = self.manager.clone();
        let policy = self.policy.clone();
        let mut ctx = build_context(&request, self.context_fn.as_ref());

        Box::pin(async move {
            if policy.timing() == InvalidationTiming::Before {
                let removed = manager.invalidate(&policy, &ctx).await;
                debug!(removed, "Invalidated before handler");
            }

            let response = inner.call(request).await?;

            if policy.timing() == InvalidationTiming::After && response.status().is_success() {
                ctx = ctx.with_status(response.status().as_u16());
                let removed = manager.invalidate(&policy, &ctx).await;
                debug!(removed, "Invalidated after handler");
            }

            Ok(response)
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{get, post};
    use axum::Router;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    fn counting_router(calls: Arc<AtomicU32>, status: StatusCode) -> Router {
        Router::new().route(
            "/products",
            get(move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    (status, "product list")
                }
            }),
        )
    }

    fn get_request(uri: &str) -> Request {
        HttpRequest::get(uri).body(Body::empty()).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_cache_control_order_and_replacement() {
        let cc = CacheControl::new()
            .public()
            .max_age(Duration::from_secs(60))
            .max_age(Duration::from_secs(120))
            .must_revalidate();
        assert_eq!(cc.build(), "public, max-age=120, must-revalidate");
        assert!(CacheControl::new().is_empty());
        assert_eq!(
            CacheControl::static_assets().build(),
            "public, max-age=31536000, immutable"
        );
        assert_eq!(CacheControl::no_cache().build(), "no-cache, no-store, must-revalidate");
    }

    #[test]
    fn test_etag_generator() {
        let etag1 = ETagGenerator::strong(b"test content");
        let etag2 = ETagGenerator::strong(b"test content");
        let etag3 = ETagGenerator::strong(b"different content");
        assert_eq!(etag1, etag2);
        assert_ne!(etag1, etag3);
        assert!(etag1.starts_with('"') && etag1.ends_with('"'));
        assert!(ETagGenerator::weak(b"x").starts_with("W/\""));
    }

    #[test]
    fn test_etag_matching() {
        assert!(ETagGenerator::matches("W/\"abc\"", "\"abc\""));
        assert!(!ETagGenerator::matches("\"abc\"", "\"xyz\""));
        assert!(ETagGenerator::matches_any("\"abc\"", "\"xyz\", \"abc\""));
        assert!(ETagGenerator::matches_any("\"abc\"", "*"));
        assert!(!ETagGenerator::matches_any("\"abc\"", "\"xyz\", \"def\""));
    }

    #[test]
    fn test_cached_response_body_is_base64() {
        let cached = CachedResponse {
            status: 200,
            headers: vec![("content-type".into(), "text/plain".into())],
            body: b"hello".to_vec(),
            etag: None,
            last_modified: None,
            created_at: Utc::now(),
        };
        let encoded = serde_json::to_value(&cached).unwrap();
        assert_eq!(encoded["body"], json!("aGVsbG8="));
        let decoded: CachedResponse = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, cached);
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let manager = Arc::new(CacheManager::in_memory());
        let calls = Arc::new(AtomicU32::new(0));
        let policy = CachePolicy::builder()
            .ttl(Duration::from_secs(60))
            .tag("products")
            .public()
            .max_age(Duration::from_secs(60))
            .build()
            .unwrap();
        let app = counting_router(calls.clone(), StatusCode::OK)
            .layer(ResponseCacheLayer::new(manager.clone(), policy));

        let first = app.clone().oneshot(get_request("/products")).await.unwrap();
        assert_eq!(first.headers()[X_CACHE], "MISS");
        assert_eq!(first.headers()[header::CACHE_CONTROL], "public, max-age=60");
        assert_eq!(body_text(first).await, "product list");

        let second = app.clone().oneshot(get_request("/products")).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(second.headers()[X_CACHE], "HIT");
        assert!(second.headers().contains_key(header::AGE));
        assert_eq!(body_text(second).await, "product list");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(manager.flush_tags(&["products".to_string()]).await, 1);
        let third = app.oneshot(get_request("/products")).await.unwrap();
        assert_eq!(third.headers()[X_CACHE], "MISS");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_if_none_match_returns_not_modified() {
        let manager = Arc::new(CacheManager::in_memory());
        let calls = Arc::new(AtomicU32::new(0));
        let policy = CachePolicy::builder().etag().build().unwrap();
        let app = counting_router(calls, StatusCode::OK)
            .layer(ResponseCacheLayer::new(manager, policy));

        let first = app.clone().oneshot(get_request("/products")).await.unwrap();
        let etag = first.headers()[header::ETAG].to_str().unwrap().to_string();
        assert_eq!(etag, ETagGenerator::strong(b"product list"));

        let request = HttpRequest::get("/products")
            .header(header::IF_NONE_MATCH, &etag)
            .body(Body::empty())
            .unwrap();
        let second = app.oneshot(request).await.unwrap();
        assert_eq!(second.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(second.headers()[header::ETAG], etag.as_str());
    }

    #[tokio::test]
    async fn test_responses_setting_cookies_are_not_stored() {
        let manager = Arc::new(CacheManager::in_memory());
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let app = Router::new()
            .route(
                "/me",
                get(move || {
                    let calls = counted.clone();
                    async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst);
                        ([(header::SET_COOKIE, format!("session=user-{}", n))], "profile")
                    }
                }),
            )
            .layer(ResponseCacheLayer::new(
                manager.clone(),
                CachePolicy::builder().public().build().unwrap(),
            ));

        let first = app.clone().oneshot(get_request("/me")).await.unwrap();
        assert_eq!(first.headers()[header::SET_COOKIE], "session=user-0");

        let second = app.oneshot(get_request("/me")).await.unwrap();
        assert_eq!(second.headers()[header::SET_COOKIE], "session=user-1");
        assert!(!second.headers().contains_key(X_CACHE));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(manager.stats().sets, 0);
    }

    #[tokio::test]
    async fn test_capture_drops_hop_by_hop_headers() {
        let response = Response::builder()
            .header(header::CONNECTION, "keep-alive")
            .header("keep-alive", "timeout=5")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from("ok"))
            .unwrap();

        let cached = CachedResponse::capture(response, false, false).await;
        assert_eq!(cached.headers, vec![("content-type".to_string(), "text/plain".to_string())]);
        assert!(!cached.sets_cookie());
    }

    #[tokio::test]
    async fn test_vary_header_lists_keyed_headers() {
        let manager = Arc::new(CacheManager::in_memory());
        let calls = Arc::new(AtomicU32::new(0));
        let policy = CachePolicy::builder()
            .vary_by_headers(["Accept-Language", "X-Tenant"])
            .build()
            .unwrap();
        let app = counting_router(calls, StatusCode::OK)
            .layer(ResponseCacheLayer::new(manager, policy));

        let response = app.clone().oneshot(get_request("/products")).await.unwrap();
        assert_eq!(response.headers()[header::VARY], "accept-language, x-tenant");

        let plain = counting_router(Arc::new(AtomicU32::new(0)), StatusCode::OK).layer(
            ResponseCacheLayer::new(
                Arc::new(CacheManager::in_memory()),
                CachePolicy::builder().build().unwrap(),
            ),
        );
        let response = plain.oneshot(get_request("/products")).await.unwrap();
        assert!(!response.headers().contains_key(header::VARY));
    }

    #[tokio::test]
    async fn test_uncacheable_status_is_not_stored() {
        let manager = Arc::new(CacheManager::in_memory());
        let calls = Arc::new(AtomicU32::new(0));
        let policy = CachePolicy::builder().build().unwrap();
        let app = counting_router(calls.clone(), StatusCode::INTERNAL_SERVER_ERROR)
            .layer(ResponseCacheLayer::new(manager, policy));

        for _ in 0..2 {
            let response = app.clone().oneshot(get_request("/products")).await.unwrap();
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            assert!(!response.headers().contains_key(X_CACHE));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_query_string_varies_key() {
        let manager = Arc::new(CacheManager::in_memory());
        let calls = Arc::new(AtomicU32::new(0));
        let policy = CachePolicy::builder().vary_by_query().build().unwrap();
        let app = counting_router(calls.clone(), StatusCode::OK)
            .layer(ResponseCacheLayer::new(manager, policy));

        app.clone().oneshot(get_request("/products?page=1")).await.unwrap();
        app.clone().oneshot(get_request("/products?page=2")).await.unwrap();
        let repeat = app.oneshot(get_request("/products?page=1")).await.unwrap();
        assert_eq!(repeat.headers()[X_CACHE], "HIT");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_guest_policy_uses_context_fn() {
        let manager = Arc::new(CacheManager::in_memory());
        let calls = Arc::new(AtomicU32::new(0));
        let policy = CachePolicy::builder().guest().build().unwrap();
        let layer = ResponseCacheLayer::new(manager, policy).with_context(|request, ctx| {
            if request.headers().contains_key(header::AUTHORIZATION) {
                ctx.set("auth.authenticated", json!(true));
            }
        });
        let app = counting_router(calls.clone(), StatusCode::OK).layer(layer);

        for _ in 0..2 {
            let request = HttpRequest::get("/products")
                .header(header::AUTHORIZATION, "Bearer token")
                .body(Body::empty())
                .unwrap();
            let response = app.clone().oneshot(request).await.unwrap();
            assert!(!response.headers().contains_key(X_CACHE));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        app.clone().oneshot(get_request("/products")).await.unwrap();
        let guest = app.oneshot(get_request("/products")).await.unwrap();
        assert_eq!(guest.headers()[X_CACHE], "HIT");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    fn writing_router(status: StatusCode) -> Router {
        Router::new().route("/products", post(move || async move { status }))
    }

    async fn seeded_manager() -> Arc<CacheManager> {
        let manager = Arc::new(CacheManager::in_memory());
        manager
            .set("products:1", &json!({"id": 1}), None, &["products".to_string()])
            .await;
        manager
    }

    #[tokio::test]
    async fn test_invalidation_after_success() {
        let manager = seeded_manager().await;
        let policy = InvalidationPolicy::tags(["products"]).unwrap();
        let app = writing_router(StatusCode::CREATED).layer(InvalidationLayer::new(manager.clone(), policy));

        let request = HttpRequest::post("/products").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(!manager.exists("products:1").await);
    }

    #[tokio::test]
    async fn test_invalidation_skipped_on_failure() {
        let manager = seeded_manager().await;
        let policy = InvalidationPolicy::tags(["products"]).unwrap();
        let app = writing_router(StatusCode::BAD_REQUEST).layer(InvalidationLayer::new(manager.clone(), policy));

        let request = HttpRequest::post("/products").body(Body::empty()).unwrap();
        app.oneshot(request).await.unwrap();
        assert!(manager.exists("products:1").await);
    }

    #[tokio::test]
    async fn test_invalidation_before_runs_regardless() {
        let manager = seeded_manager().await;
        let policy = InvalidationPolicy::tags(["products"])
            .unwrap()
            .with_timing(InvalidationTiming::Before);
        let app = writing_router(StatusCode::BAD_REQUEST).layer(InvalidationLayer::new(manager.clone(), policy));

        let request = HttpRequest::post("/products").body(Body::empty()).unwrap();
        app.oneshot(request).await.unwrap();
        assert!(!manager.exists("products:1").await);
    }
}
