//! Configuration management for the rsaccum server.
//!
//! Three sources, later ones winning:
//! 1. Default values (hardcoded)
//! 2. Configuration file (YAML)
//! 3. Environment variables (`ACCUM_` prefix, `__` as the nested separator)
//!
//! On top of that the legacy deployment variables are honoured:
//! `REDIS_URI`/`REDIS_URL` (or `REDIS_ADDR`/`REDIS_PASSWORD`/`REDIS_DB`),
//! `API_EXTERNA_URL`, `API_EXTERNA_TIMEOUT` and `ALLOWED_IPS`. Any of those
//! whose value begins with `/run/secrets/` is read from that file instead.

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Server configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct ServerConfig {
    /// Network settings
    #[serde(default)]
    pub server: ServerSettings,

    /// Storage settings
    #[serde(default)]
    pub storage: StorageSettings,

    /// External-API (memoize upstream) settings
    #[serde(default)]
    pub upstream: UpstreamSettings,

    /// Memoize cache settings
    #[serde(default)]
    pub memoize: MemoizeSettings,

    /// Flow serializer settings
    #[serde(default)]
    pub flow: FlowSettings,

    /// Security settings
    #[serde(default)]
    pub security: SecuritySettings,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Server network settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ServerSettings {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request body limit for the size-capped routes, in bytes
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7511
}

fn default_body_limit() -> usize {
    10 * 1024
}

/// Storage backend selection.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StorageSettings {
    /// Backend name: `memory` or `redis`
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Redis connection string, required for the redis backend
    #[serde(default)]
    pub redis_url: Option<String>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            redis_url: None,
        }
    }
}

fn default_backend() -> String {
    "memory".to_string()
}

/// External-API settings for the memoize proxy.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct UpstreamSettings {
    /// Fallback URL used when a memoize request names no external API
    #[serde(default)]
    pub api_externa_url: Option<String>,

    /// Per-call timeout for the external API, in seconds
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            api_externa_url: None,
            timeout_secs: default_upstream_timeout(),
        }
    }
}

fn default_upstream_timeout() -> u64 {
    30
}

/// Memoize cache settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MemoizeSettings {
    /// Default TTL (and staleness horizon), in seconds
    #[serde(default = "default_memo_ttl")]
    pub default_ttl_secs: u64,
}

impl Default for MemoizeSettings {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_memo_ttl(),
        }
    }
}

fn default_memo_ttl() -> u64 {
    60
}

/// Flow serializer settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct FlowSettings {
    /// Outer wait budget: lease acquisition and each upstream call share
    /// this bound, in seconds
    #[serde(default = "default_wait_budget")]
    pub wait_budget_secs: u64,

    /// Lease TTL, in seconds
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,

    /// Interval between lease acquisition attempts, in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            wait_budget_secs: default_wait_budget(),
            lock_ttl_secs: default_lock_ttl(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

fn default_wait_budget() -> u64 {
    600
}

fn default_lock_ttl() -> u64 {
    300
}

fn default_poll_interval() -> u64 {
    10
}

/// Security settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct SecuritySettings {
    /// Require and validate the `access_token` header on /request
    #[serde(default)]
    pub require_access_token: bool,

    /// Advisory IP allow-list (logged at startup, not enforced)
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON-formatted logs
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ServerConfig {
    /// Load configuration from a YAML file with environment overrides.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let mut config: ServerConfig = Config::builder()
            .add_source(File::new(path, FileFormat::Yaml))
            .add_source(Environment::with_prefix("ACCUM").separator("__"))
            .build()?
            .try_deserialize()?;
        config.apply_legacy_env();
        Ok(config)
    }

    /// Load configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config: ServerConfig = Config::builder()
            .add_source(Environment::with_prefix("ACCUM").separator("__"))
            .build()?
            .try_deserialize()?;
        config.apply_legacy_env();
        Ok(config)
    }

    /// Applies the bare environment variables the container deployments set.
    fn apply_legacy_env(&mut self) {
        if let Some(url) = env_or_secret("REDIS_URI").or_else(|| env_or_secret("REDIS_URL")) {
            self.storage.redis_url = Some(url);
        } else if let Some(addr) = env_or_secret("REDIS_ADDR") {
            self.storage.redis_url = Some(redis_url_from_parts(
                &addr,
                env_or_secret("REDIS_PASSWORD").as_deref(),
                env_or_secret("REDIS_DB").as_deref(),
            ));
        }

        if let Some(url) = env_or_secret("API_EXTERNA_URL") {
            self.upstream.api_externa_url = Some(url);
        }
        if let Some(raw) = env_or_secret("API_EXTERNA_TIMEOUT") {
            match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => self.upstream.timeout_secs = secs,
                _ => warn!(value = %raw, "ignoring invalid API_EXTERNA_TIMEOUT"),
            }
        }

        if let Some(raw) = env_or_secret("ALLOWED_IPS") {
            self.security.allowed_ips = raw
                .split(',')
                .map(|ip| ip.trim().to_string())
                .filter(|ip| !ip.is_empty())
                .collect();
        }
    }
}

/// Builds a connection string from the `REDIS_ADDR` family of variables.
fn redis_url_from_parts(addr: &str, password: Option<&str>, db: Option<&str>) -> String {
    let auth = password
        .filter(|p| !p.is_empty())
        .map(|p| format!(":{p}@"))
        .unwrap_or_default();
    let db = db.and_then(|d| d.parse::<u32>().ok()).unwrap_or(0);
    format!("redis://{auth}{addr}/{db}")
}

/// Reads an environment variable, following the `/run/secrets/` file
/// indirection used by the container deployments.
fn env_or_secret(key: &str) -> Option<String> {
    let value = std::env::var(key).ok().filter(|v| !v.is_empty())?;
    if value.starts_with("/run/secrets/") {
        match std::fs::read_to_string(&value) {
            Ok(data) => Some(data.trim().to_string()),
            Err(err) => {
                warn!(key, error = %err, "failed to read secret file");
                None
            }
        }
    } else {
        Some(value)
    }
}
