//! Orchestrator configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Default host.
const DEFAULT_HOST: &str = "127.0.0.1";

/// Default port.
const DEFAULT_PORT: u16 = 3000;

/// Default base domain for sandbox subdomain URLs.
const DEFAULT_BASE_DOMAIN: &str = "localhost";

/// Default maximum upload size (50 MB).
const DEFAULT_UPLOAD_MAX_SIZE: usize = 50 * 1024 * 1024;

/// Default SQLite database path.
const DEFAULT_DATABASE_PATH: &str = "sandcastle.db";

/// Default runtime network joined by sandbox containers.
const DEFAULT_NETWORK: &str = "training_network";

/// Default maximum concurrent running containers per subject.
const DEFAULT_MAX_PER_USER: i64 = 3;

/// Default idle timeout before a sandbox is reaped (15 minutes).
const DEFAULT_IDLE_LIMIT_SECS: u64 = 15 * 60;

/// Default absolute sandbox lifetime (2 hours).
const DEFAULT_LIFETIME_LIMIT_SECS: u64 = 2 * 60 * 60;

/// Default watcher tick interval (60 seconds).
const DEFAULT_CHECK_INTERVAL_SECS: u64 = 60;

/// Default reconciler period (6 hours).
const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 6 * 60 * 60;

/// Default retention for terminal container records (24 hours).
const DEFAULT_STOPPED_RETENTION_SECS: u64 = 24 * 60 * 60;

/// Default proxy round-trip and idle-socket timeout (60 seconds).
const DEFAULT_PROXY_TIMEOUT_SECS: u64 = 60;

/// Orchestrator configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Server settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Container runtime settings.
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Container lifecycle settings.
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    /// Proxy settings.
    #[serde(default)]
    pub proxy: ProxyConfig,
}

/// Server-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Host to bind to (default: `127.0.0.1`).
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to (default: `3000`).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Domain suffix used when constructing sandbox URLs
    /// (default: `localhost`).
    #[serde(default = "default_base_domain")]
    pub base_domain: String,
    /// Base URL injected into sandboxes as `CALLBACK_URL`.
    ///
    /// Defaults to `http://{host}:{port}` when empty.
    #[serde(default)]
    pub public_url: String,
    /// Maximum accepted exercise bundle size in bytes (default: 50 MB).
    #[serde(default = "default_upload_max_size")]
    pub upload_max_size: usize,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file (default: `sandcastle.db`).
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

/// Container runtime configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Name of the runtime network sandboxes join
    /// (default: `training_network`).
    #[serde(default = "default_network")]
    pub network: String,
}

/// Container lifecycle configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LifecycleConfig {
    /// Maximum concurrent running containers per subject (default: `3`).
    #[serde(default = "default_max_per_user")]
    pub max_per_user: i64,
    /// Seconds of inactivity before a sandbox is reaped (default: `900`).
    #[serde(default = "default_idle_limit_secs")]
    pub idle_limit_secs: u64,
    /// Absolute sandbox lifetime in seconds (default: `7200`).
    #[serde(default = "default_lifetime_limit_secs")]
    pub lifetime_limit_secs: u64,
    /// Watcher tick interval in seconds (default: `60`).
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Reconciler period in seconds (default: `21600`).
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    /// Retention for terminal container records in seconds
    /// (default: `86400`).
    #[serde(default = "default_stopped_retention_secs")]
    pub stopped_retention_secs: u64,
}

/// Proxy configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// Round-trip and idle-socket timeout for proxied requests in seconds
    /// (default: `60`).
    #[serde(default = "default_proxy_timeout_secs")]
    pub timeout_secs: u64,
}

/// Default host function for serde.
fn default_host() -> String {
    String::from(DEFAULT_HOST)
}

/// Default port function for serde.
fn default_port() -> u16 {
    DEFAULT_PORT
}

/// Default base domain function for serde.
fn default_base_domain() -> String {
    String::from(DEFAULT_BASE_DOMAIN)
}

/// Default upload size function for serde.
fn default_upload_max_size() -> usize {
    DEFAULT_UPLOAD_MAX_SIZE
}

/// Default database path function for serde.
fn default_database_path() -> PathBuf {
    PathBuf::from(DEFAULT_DATABASE_PATH)
}

/// Default network function for serde.
fn default_network() -> String {
    String::from(DEFAULT_NETWORK)
}

/// Default per-user quota function for serde.
fn default_max_per_user() -> i64 {
    DEFAULT_MAX_PER_USER
}

/// Default idle limit function for serde.
fn default_idle_limit_secs() -> u64 {
    DEFAULT_IDLE_LIMIT_SECS
}

/// Default lifetime limit function for serde.
fn default_lifetime_limit_secs() -> u64 {
    DEFAULT_LIFETIME_LIMIT_SECS
}

/// Default check interval function for serde.
fn default_check_interval_secs() -> u64 {
    DEFAULT_CHECK_INTERVAL_SECS
}

/// Default reconcile interval function for serde.
fn default_reconcile_interval_secs() -> u64 {
    DEFAULT_RECONCILE_INTERVAL_SECS
}

/// Default stopped retention function for serde.
fn default_stopped_retention_secs() -> u64 {
    DEFAULT_STOPPED_RETENTION_SECS
}

/// Default proxy timeout function for serde.
fn default_proxy_timeout_secs() -> u64 {
    DEFAULT_PROXY_TIMEOUT_SECS
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_domain: default_base_domain(),
            public_url: String::new(),
            upload_max_size: default_upload_max_size(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_per_user: default_max_per_user(),
            idle_limit_secs: default_idle_limit_secs(),
            lifetime_limit_secs: default_lifetime_limit_secs(),
            check_interval_secs: default_check_interval_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            stopped_retention_secs: default_stopped_retention_secs(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_proxy_timeout_secs(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// configuration is invalid.
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.base_domain.is_empty() {
            anyhow::bail!("`server.base_domain` cannot be empty");
        }

        if self.runtime.network.is_empty() {
            anyhow::bail!("`runtime.network` cannot be empty");
        }

        if self.lifecycle.max_per_user < 1 {
            anyhow::bail!("`lifecycle.max_per_user` must be at least 1");
        }

        if self.lifecycle.check_interval_secs == 0 {
            anyhow::bail!("`lifecycle.check_interval_secs` must be non-zero");
        }

        Ok(())
    }

    /// The base URL sandboxes use to reach the orchestrator.
    pub fn public_url(&self) -> String {
        if self.server.public_url.is_empty() {
            format!("http://{}:{}", self.server.host, self.server.port)
        } else {
            self.server.public_url.trim_end_matches('/').to_string()
        }
    }
}

impl LifecycleConfig {
    /// The idle limit as a duration.
    pub fn idle_limit(&self) -> Duration {
        Duration::from_secs(self.idle_limit_secs)
    }

    /// The lifetime limit as a duration.
    pub fn lifetime_limit(&self) -> Duration {
        Duration::from_secs(self.lifetime_limit_secs)
    }

    /// The watcher tick interval as a duration.
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// The reconciler period as a duration.
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

impl ProxyConfig {
    /// The proxy timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
