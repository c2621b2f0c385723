//! Configuration module for the purge bridge.

use crate::error::{PurgemanError, Result};
use crate::purge::CacheTarget;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default AMQP port.
pub const BROKER_PORT_DEFAULT: u16 = 5672;
/// Default port of the catalog HTTP API.
pub const CATALOG_PORT_DEFAULT: u16 = 9000;
/// Default cache front-end prefix.
pub const CACHE_URL_PREFIX_DEFAULT: &str = "http://127.0.0.1:6081/";
/// Metadata attribute holding an entity's UUID.
pub const UUID_ATTRIBUTE_DEFAULT: &str = "ipc_UUID";
const CATALOG_API_PATH_DEFAULT: &str = "/irods-http-api/0.3.0";

/// Prefix for every environment variable read by [`ServiceConfig::from_env`].
pub const ENV_PREFIX: &str = "PURGEMAN_";

/// Main configuration for the purge bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Message broker connection.
    pub broker: BrokerConfig,
    /// Catalog connection, also the identity used for purge requests.
    pub catalog: CatalogConfig,
    /// Cache front-ends to purge.
    pub cache: CacheConfig,
    /// Logging and metrics.
    pub observability: ObservabilityConfig,
    /// Pause between connection attempts.
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Stay attached to the invoking terminal.
    pub foreground: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            catalog: CatalogConfig::default(),
            cache: CacheConfig::default(),
            observability: ObservabilityConfig::default(),
            retry_interval: Duration::from_secs(60),
            foreground: false,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        if path.is_dir() {
            return Err(PurgemanError::Config(format!(
                "{} is a directory, not a config file",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            PurgemanError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        Self::from_yaml(content.as_bytes())
    }

    /// Parse configuration from YAML bytes, filling unset fields with defaults.
    pub fn from_yaml(bytes: &[u8]) -> Result<Self> {
        serde_yaml::from_slice(bytes)
            .map_err(|e| PurgemanError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Read a YAML document from a reader until EOF.
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Self::from_yaml(&bytes)
    }

    /// Serialize to the YAML form accepted by [`ServiceConfig::from_yaml`].
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Build configuration from `PURGEMAN_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    pub fn from_env_with<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.trim().is_empty())
        };

        let mut config = Self::default();

        if let Some(v) = var("BROKER_HOST") {
            config.broker.host = v;
        }
        if let Some(v) = var("BROKER_PORT") {
            config.broker.port = parse_env("BROKER_PORT", &v)?;
        }
        if let Some(v) = var("BROKER_VHOST") {
            config.broker.vhost = v;
        }
        if let Some(v) = var("BROKER_EXCHANGE") {
            config.broker.exchange = v;
        }
        if let Some(v) = var("BROKER_QUEUE") {
            config.broker.queue = v;
        }
        if let Some(v) = var("BROKER_USERNAME") {
            config.broker.username = v;
        }
        if let Some(v) = var("BROKER_PASSWORD") {
            config.broker.password = v;
        }

        if let Some(v) = var("CATALOG_HOST") {
            config.catalog.host = v;
        }
        if let Some(v) = var("CATALOG_PORT") {
            config.catalog.port = parse_env("CATALOG_PORT", &v)?;
        }
        if let Some(v) = var("CATALOG_ZONE") {
            config.catalog.zone = v;
        }
        if let Some(v) = var("CATALOG_USERNAME") {
            config.catalog.username = v;
        }
        if let Some(v) = var("CATALOG_PASSWORD") {
            config.catalog.password = v;
        }
        if let Some(v) = var("CATALOG_API_URL") {
            config.catalog.api_url = Some(v);
        }
        if let Some(v) = var("CATALOG_UUID_ATTRIBUTE") {
            config.catalog.uuid_attribute = v;
        }

        if let Some(v) = var("CACHE_URLS") {
            config.cache.url_prefixes = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = var("CACHE_HOST_OVERRIDES") {
            // Positions matter here, so empty items are kept as "no override".
            config.cache.host_overrides = v
                .split(',')
                .map(str::trim)
                .map(|s| (!s.is_empty()).then(|| s.to_string()))
                .collect();
        }
        if let Some(v) = var("CACHE_REQUEST_TIMEOUT") {
            config.cache.request_timeout = humantime_serde::parse_duration(&v)
                .map_err(|e| env_error("CACHE_REQUEST_TIMEOUT", &e))?;
        }

        if let Some(v) = var("LOG_PATH") {
            config.observability.log_path = Some(PathBuf::from(v));
        }
        if let Some(v) = var("LOG_LEVEL") {
            config.observability.log_level = v;
        }
        if let Some(v) = var("METRICS_ADDR") {
            config.observability.metrics_addr = Some(parse_env("METRICS_ADDR", &v)?);
        }
        if let Some(v) = var("RETRY_INTERVAL") {
            config.retry_interval = humantime_serde::parse_duration(&v)
                .map_err(|e| env_error("RETRY_INTERVAL", &e))?;
        }

        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        fn required(value: &str, field: &str) -> Result<()> {
            if value.trim().is_empty() {
                return Err(PurgemanError::InvalidConfig {
                    field: field.to_string(),
                    reason: "must be given".to_string(),
                });
            }
            Ok(())
        }

        required(&self.broker.host, "broker.host")?;
        if self.broker.port == 0 {
            return Err(invalid("broker.port", "must be non-zero"));
        }
        required(&self.broker.vhost, "broker.vhost")?;
        if self.broker.exchange.is_empty() && self.broker.queue.is_empty() {
            return Err(invalid(
                "broker.exchange",
                "either an exchange or a queue must be given",
            ));
        }
        required(&self.broker.username, "broker.username")?;
        required(&self.broker.password, "broker.password")?;

        required(&self.catalog.host, "catalog.host")?;
        if self.catalog.port == 0 {
            return Err(invalid("catalog.port", "must be non-zero"));
        }
        required(&self.catalog.username, "catalog.username")?;
        required(&self.catalog.password, "catalog.password")?;
        required(&self.catalog.zone, "catalog.zone")?;
        required(&self.catalog.uuid_attribute, "catalog.uuid_attribute")?;

        if self.cache.url_prefixes.is_empty() {
            return Err(invalid(
                "cache.url_prefixes",
                "at least one cache URL prefix must be given",
            ));
        }
        if self.cache.host_overrides.len() > self.cache.url_prefixes.len() {
            return Err(invalid(
                "cache.host_overrides",
                "more host overrides than cache URL prefixes",
            ));
        }

        if self.retry_interval.is_zero() {
            return Err(invalid("retry_interval", "must be non-zero"));
        }

        Ok(())
    }

    /// Cache targets, with each prefix paired to the override at its index.
    pub fn cache_targets(&self) -> Vec<CacheTarget> {
        self.cache
            .url_prefixes
            .iter()
            .enumerate()
            .map(|(idx, prefix)| {
                let host_override = self
                    .cache
                    .host_overrides
                    .get(idx)
                    .cloned()
                    .flatten()
                    .filter(|h| !h.is_empty());
                CacheTarget::new(prefix.clone(), host_override)
            })
            .collect()
    }

    /// Create a configuration pointing at local services.
    pub fn development() -> Self {
        Self {
            broker: BrokerConfig {
                host: "127.0.0.1".to_string(),
                vhost: "/".to_string(),
                exchange: "irods".to_string(),
                username: "guest".to_string(),
                password: "guest".to_string(),
                ..BrokerConfig::default()
            },
            catalog: CatalogConfig {
                host: "127.0.0.1".to_string(),
                zone: "tempZone".to_string(),
                username: "rods".to_string(),
                password: "rods".to_string(),
                ..CatalogConfig::default()
            },
            retry_interval: Duration::from_secs(5),
            foreground: true,
            ..Self::default()
        }
    }
}

fn invalid(field: &str, reason: &str) -> PurgemanError {
    PurgemanError::InvalidConfig {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn env_error(name: &str, reason: &str) -> PurgemanError {
    PurgemanError::Config(format!("{}{}: {}", ENV_PREFIX, name, reason))
}

fn parse_env<T>(name: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| env_error(name, &e.to_string()))
}

/// Message broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    /// Exchange to bind a private queue to. Used when `queue` is empty.
    pub exchange: String,
    /// Existing queue to consume from.
    pub queue: String,
    pub username: String,
    pub password: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: BROKER_PORT_DEFAULT,
            vhost: String::new(),
            exchange: String::new(),
            queue: String::new(),
            username: String::new(),
            password: String::new(),
        }
    }
}

/// Catalog configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub host: String,
    /// HTTP API port, ignored when `api_url` is set.
    pub port: u16,
    pub zone: String,
    pub username: String,
    pub password: String,
    /// Base URL of the catalog HTTP API.
    pub api_url: Option<String>,
    /// Metadata attribute carrying entity UUIDs.
    pub uuid_attribute: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: CATALOG_PORT_DEFAULT,
            zone: String::new(),
            username: String::new(),
            password: String::new(),
            api_url: None,
            uuid_attribute: UUID_ATTRIBUTE_DEFAULT.to_string(),
        }
    }
}

impl CatalogConfig {
    /// Base URL for catalog HTTP API calls, without a trailing slash.
    pub fn api_base_url(&self) -> String {
        match &self.api_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!(
                "http://{}:{}{}",
                self.host, self.port, CATALOG_API_PATH_DEFAULT
            ),
        }
    }
}

/// Cache front-end configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// URL prefixes of the cache front-ends.
    pub url_prefixes: Vec<String>,
    /// Host header overrides, index-aligned with `url_prefixes`.
    pub host_overrides: Vec<Option<String>>,
    /// Timeout for a single purge request.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url_prefixes: vec![CACHE_URL_PREFIX_DEFAULT.to_string()],
            host_overrides: Vec::new(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log file. Console only when unset.
    pub log_path: Option<PathBuf>,
    /// Log level or `EnvFilter` directive.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
    /// Prometheus listener address.
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_path: None,
            log_level: "info".to_string(),
            json_logs: false,
            metrics_addr: None,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    /// Parse `500ms`, `30s`, `1m` or a bare millisecond count.
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.trim()
                .parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}
