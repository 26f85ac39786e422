//! Configuration management.

use crate::cache::warmer::HttpWarmTarget;
use crate::error::Result;
use crate::telemetry::LoggingConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Main cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Global switch; a disabled cache always misses and never stores
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Key prefix applied to every key, tag index and lock
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// TTL used when neither the caller nor a policy supplies one
    #[serde(default = "default_ttl", with = "humantime_serde")]
    pub default_ttl: Duration,

    /// How long a regeneration lock is held, and how long waiters poll
    #[serde(default = "default_lock_timeout", with = "humantime_serde")]
    pub lock_timeout: Duration,

    /// Interval between polls while another caller regenerates
    #[serde(default = "default_lock_poll_interval", with = "humantime_serde")]
    pub lock_poll_interval: Duration,

    /// Redis connection settings
    #[serde(default)]
    pub redis: RedisSettings,

    /// Probabilistic early refresh settings
    #[serde(default)]
    pub early_expiration: EarlyExpirationSettings,

    /// TTL overrides in seconds, keyed by table or procedure name
    #[serde(default)]
    pub ttl_overrides: HashMap<String, u64>,

    /// Domain event name to the tag/key templates it flushes
    #[serde(default)]
    pub invalidation_rules: HashMap<String, Vec<String>>,

    /// Cache warmer settings
    #[serde(default)]
    pub warmer: WarmerSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            prefix: default_prefix(),
            default_ttl: default_ttl(),
            lock_timeout: default_lock_timeout(),
            lock_poll_interval: default_lock_poll_interval(),
            redis: RedisSettings::default(),
            early_expiration: EarlyExpirationSettings::default(),
            ttl_overrides: HashMap::new(),
            invalidation_rules: HashMap::new(),
            warmer: WarmerSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisSettings {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection establishment timeout
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Per-command timeout
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            connect_timeout: default_connect_timeout(),
            command_timeout: default_command_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EarlyExpirationSettings {
    /// Refresh hot entries before they expire
    #[serde(default)]
    pub enabled: bool,

    /// Higher values refresh earlier
    #[serde(default = "default_beta")]
    pub beta: f64,
}

impl Default for EarlyExpirationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            beta: default_beta(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WarmerSettings {
    /// Interval between scheduled warm runs
    #[serde(default = "default_warm_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Timeout for each HTTP warm request
    #[serde(default = "default_warm_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// HTTP endpoints fetched on every run
    #[serde(default)]
    pub targets: Vec<HttpWarmTarget>,
}

impl Default for WarmerSettings {
    fn default() -> Self {
        Self {
            interval: default_warm_interval(),
            request_timeout: default_warm_request_timeout(),
            targets: Vec::new(),
        }
    }
}

// Default value functions
fn default_enabled() -> bool { true }
fn default_prefix() -> String { "cachet".to_string() }
fn default_ttl() -> Duration { Duration::from_secs(3600) }
fn default_lock_timeout() -> Duration { Duration::from_secs(10) }
fn default_lock_poll_interval() -> Duration { Duration::from_millis(50) }
fn default_redis_url() -> String { "redis://127.0.0.1:6379".to_string() }
fn default_connect_timeout() -> Duration { Duration::from_secs(5) }
fn default_command_timeout() -> Duration { Duration::from_secs(2) }
fn default_beta() -> f64 { 1.0 }
fn default_warm_interval() -> Duration { Duration::from_secs(300) }
fn default_warm_request_timeout() -> Duration { Duration::from_secs(30) }

impl Settings {
    /// Load configuration from the environment (`CACHET__REDIS__URL`, ...).
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("CACHET").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Load from a specific file path, with environment overrides on top.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("CACHET").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// TTL override for a named table or procedure.
    pub fn ttl_override(&self, name: &str) -> Option<Duration> {
        self.ttl_overrides.get(name).map(|secs| Duration::from_secs(*secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert!(settings.enabled);
        assert_eq!(settings.prefix, "cachet");
        assert_eq!(settings.default_ttl, Duration::from_secs(3600));
        assert_eq!(settings.lock_timeout, Duration::from_secs(10));
        assert!(!settings.early_expiration.enabled);
        assert!(settings.warmer.targets.is_empty());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
prefix = "shop"
default_ttl = "10m"
lock_timeout = "3s"

[redis]
url = "redis://cache:6379"
command_timeout = "500ms"

[early_expiration]
enabled = true
beta = 2.0

[ttl_overrides]
sp_get_users = 120

[invalidation_rules]
user_updated = ["users", "key:user:{{id}}"]

[[warmer.targets]]
name = "home"
url = "http://localhost:8080/"
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let settings = Settings::from_file(&path).unwrap();

        assert_eq!(settings.prefix, "shop");
        assert_eq!(settings.default_ttl, Duration::from_secs(600));
        assert_eq!(settings.lock_timeout, Duration::from_secs(3));
        assert_eq!(settings.redis.url, "redis://cache:6379");
        assert_eq!(settings.redis.command_timeout, Duration::from_millis(500));
        assert!(settings.early_expiration.enabled);
        assert_eq!(settings.ttl_override("sp_get_users"), Some(Duration::from_secs(120)));
        assert_eq!(settings.ttl_override("unknown"), None);
        assert_eq!(settings.invalidation_rules["user_updated"].len(), 2);
        assert_eq!(settings.warmer.targets[0].name, "home");
    }
}
