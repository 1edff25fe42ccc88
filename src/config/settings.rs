use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Identity of the deployment, stamped into rendered messages and
/// operator alerts.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    #[serde(default = "default_site_name")]
    pub name: String,
    #[serde(default = "default_site_domain")]
    pub domain: String,
    /// Scheme used when building absolute links in rendered notices.
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    /// Backend names (or aliases) to activate, in delivery order.
    #[serde(default = "default_backends")]
    pub backends: Vec<String>,
    /// When true, every send is queued instead of dispatched inline.
    #[serde(default)]
    pub queue_all: bool,
    /// Seen notices older than this many days are removed by the sweep.
    #[serde(default = "default_obsolete_days")]
    pub obsolete_days: i64,
    /// Locale used when per-user lookup yields nothing.
    #[serde(default = "default_locale")]
    pub default_locale: String,
    /// Directory holding the drain lock file.
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
    /// Name of the drain lock; drains sharing a name exclude each other.
    #[serde(default = "default_lock_name")]
    pub lock_name: String,
    /// How long a drain waits for the lock. Negative means do not wait:
    /// a held lock skips the run entirely.
    #[serde(default = "default_lock_wait_timeout")]
    pub lock_wait_timeout_secs: i64,
    /// Interval between periodic drain runs in seconds.
    #[serde(default = "default_drain_interval")]
    pub drain_interval_secs: u64,
    /// Interval between obsolescence sweeps in seconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Datastore implementation: "postgres" or "memory".
    #[serde(default = "default_store_backend")]
    pub backend: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// OpenTelemetry export settings, read from the standard `OTEL_*`
/// environment variables rather than the `HERALD__` namespace.
#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub service_name: String,
    pub sampling_ratio: f64,
}

impl OtelConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env::var("OTEL_ENABLED")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.enabled),
            endpoint: env::var("OTEL_ENDPOINT").unwrap_or(defaults.endpoint),
            service_name: env::var("OTEL_SERVICE_NAME").unwrap_or(defaults.service_name),
            sampling_ratio: env::var("OTEL_SAMPLING_RATIO")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.sampling_ratio),
        }
    }
}

fn default_site_name() -> String {
    "Herald".to_string()
}

fn default_site_domain() -> String {
    "localhost".to_string()
}

fn default_protocol() -> String {
    "http".to_string()
}

fn default_backends() -> Vec<String> {
    vec!["email".to_string(), "web".to_string()]
}

fn default_obsolete_days() -> i64 {
    30
}

fn default_locale() -> String {
    "en".to_string()
}

fn default_lock_dir() -> PathBuf {
    env::temp_dir()
}

fn default_lock_name() -> String {
    "send_notices".to_string()
}

fn default_lock_wait_timeout() -> i64 {
    -1 // never wait for a held lock
}

fn default_drain_interval() -> u64 {
    60 // 1 minute
}

fn default_sweep_interval() -> u64 {
    86_400 // daily
}

fn default_store_backend() -> String {
    "memory".to_string()
}

fn default_database_url() -> String {
    "postgres://localhost:5432/herald".to_string()
}

fn default_max_connections() -> u32 {
    5
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Start with default values
            .set_default("site.name", default_site_name())?
            .set_default("site.domain", default_site_domain())?
            .set_default("site.protocol", default_protocol())?
            .set_default("notification.backends", default_backends())?
            .set_default("notification.queue_all", false)?
            .set_default("notification.obsolete_days", default_obsolete_days())?
            .set_default("store.backend", default_store_backend())?
            .set_default("database.url", default_database_url())?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables
            // HERALD__SITE__NAME, HERALD__NOTIFICATION__QUEUE_ALL, etc.
            .add_source(
                Environment::with_prefix("HERALD")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(","),
            );

        builder.build()?.try_deserialize()
    }

    /// Absolute root URL of the site, e.g. `http://localhost`.
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.site.protocol, self.site.domain)
    }
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            name: default_site_name(),
            domain: default_site_domain(),
            protocol: default_protocol(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            backends: default_backends(),
            queue_all: false,
            obsolete_days: default_obsolete_days(),
            default_locale: default_locale(),
            lock_dir: default_lock_dir(),
            lock_name: default_lock_name(),
            lock_wait_timeout_secs: default_lock_wait_timeout(),
            drain_interval_secs: default_drain_interval(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "http://localhost:4317".to_string(),
            service_name: "herald".to_string(),
            sampling_ratio: 1.0,
        }
    }
}
