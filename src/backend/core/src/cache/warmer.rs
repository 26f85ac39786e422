//! Cache warming.
//!
//! A warmer runs outside request handling and populates the cache ahead of
//! demand. Targets are either HTTP endpoints, fetched so the response layer
//! caches them exactly as it would for real traffic, or producers whose
//! value is stored directly. Each target succeeds or fails on its own.

use super::manager::CacheManager;
use crate::config::WarmerSettings;
use crate::error::Result;
use crate::telemetry::metrics::WARM_TARGETS;
use futures::future::BoxFuture;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Targets
// ═══════════════════════════════════════════════════════════════════════════════

/// An HTTP endpoint to fetch on every warm run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpWarmTarget {
    pub name: String,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl HttpWarmTarget {
    pub fn get(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            method: default_method(),
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Value-producing callback for a producer target.
pub type WarmProducer = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Something the warmer knows how to populate.
#[derive(Clone)]
pub enum WarmTarget {
    Http(HttpWarmTarget),
    Producer {
        name: String,
        key: String,
        ttl: Option<Duration>,
        tags: Vec<String>,
        producer: WarmProducer,
    },
}

impl WarmTarget {
    /// Build a producer target from an async closure.
    pub fn producer<F, Fut>(
        name: impl Into<String>,
        key: impl Into<String>,
        ttl: Option<Duration>,
        tags: Vec<String>,
        producer: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::Producer {
            name: name.into(),
            key: key.into(),
            ttl,
            tags,
            producer: Arc::new(move || Box::pin(producer())),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Http(target) => &target.name,
            Self::Producer { name, .. } => name,
        }
    }
}

impl fmt::Debug for WarmTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(target) => f.debug_tuple("Http").field(target).finish(),
            Self::Producer { name, key, ttl, tags, .. } => f
                .debug_struct("Producer")
                .field("name", name)
                .field("key", key)
                .field("ttl", ttl)
                .field("tags", tags)
                .finish_non_exhaustive(),
        }
    }
}

/// Outcome of one warm run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WarmReport {
    /// Target name to success
    pub results: BTreeMap<String, bool>,
    pub succeeded: usize,
    pub failed: usize,
    pub duration: Duration,
}

impl WarmReport {
    fn record(&mut self, name: &str, ok: bool) {
        self.results.insert(name.to_string(), ok);
        if ok {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        counter!(WARM_TARGETS, "outcome" => if ok { "success" } else { "failure" }).increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Warmer
// ═══════════════════════════════════════════════════════════════════════════════

/// Populates the cache from a fixed set of targets.
pub struct CacheWarmer {
    manager: Arc<CacheManager>,
    client: reqwest::Client,
    targets: Vec<WarmTarget>,
}

impl CacheWarmer {
    /// Create a warmer with no targets.
    pub fn new(manager: Arc<CacheManager>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("cachet-warmer/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            manager,
            client,
            targets: Vec::new(),
        })
    }

    /// Create a warmer with the HTTP targets from settings.
    pub fn from_settings(manager: Arc<CacheManager>, settings: &WarmerSettings) -> Result<Self> {
        let mut warmer = Self::new(manager, settings.request_timeout)?;
        for target in &settings.targets {
            warmer.add_target(WarmTarget::Http(target.clone()));
        }
        Ok(warmer)
    }

    pub fn with_target(mut self, target: WarmTarget) -> Self {
        self.add_target(target);
        self
    }

    pub fn add_target(&mut self, target: WarmTarget) {
        self.targets.push(target);
    }

    pub fn targets(&self) -> &[WarmTarget] {
        &self.targets
    }

    /// Compute a value and store it, replacing whatever is cached.
    #[instrument(skip(self, producer, tags))]
    pub async fn warm<T, E, F, Fut>(
        &self,
        key: &str,
        producer: F,
        ttl: Option<Duration>,
        tags: &[String],
    ) -> bool
    where
        T: Serialize,
        E: fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        match producer().await {
            Ok(value) => self.manager.set(key, &value, ttl, tags).await,
            Err(e) => {
                warn!(key, error = %e, "Warm producer failed");
                false
            }
        }
    }

    /// Fetch an HTTP target. Any 2xx counts as success.
    pub async fn warm_http(&self, target: &HttpWarmTarget) -> Result<()> {
        let method = reqwest::Method::from_bytes(target.method.to_ascii_uppercase().as_bytes())
            .unwrap_or(reqwest::Method::GET);

        let mut request = self.client.request(method, &target.url);
        for (name, value) in &target.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?.error_for_status()?;
        debug!(warm_target = %target.name, status = %response.status(), "Warmed HTTP target");
        Ok(())
    }

    async fn warm_target(&self, target: &WarmTarget) -> bool {
        match target {
            WarmTarget::Http(http) => match self.warm_http(http).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(warm_target = %http.name, url = %http.url, error = %e, "HTTP warm target failed");
                    false
                }
            },
            WarmTarget::Producer {
                key,
                ttl,
                tags,
                producer,
                ..
            } => self.warm(key, || producer(), *ttl, tags).await,
        }
    }

    /// Run every target once.
    pub async fn warm_all(&self) -> WarmReport {
        let started = Instant::now();
        let mut report = WarmReport::default();

        for target in &self.targets {
            let ok = self.warm_target(target).await;
            report.record(target.name(), ok);
        }

        report.duration = started.elapsed();
        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            duration_ms = report.duration.as_millis() as u64,
            "Cache warm run finished"
        );
        report
    }

    /// Run [`warm_all`](Self::warm_all) every `interval` until `shutdown`
    /// becomes true or its sender is dropped. The first run is immediate.
    pub fn spawn(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.warm_all().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Cache warmer stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
