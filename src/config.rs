//! Configuration loading and constants.
//!
//! Loads the process configuration from a TOML file and defines the constants for
//! certificate file names, renewal timing and logging defaults. `AppConfig` is the
//! root configuration struct. The per-site list lives in a separate JSON document
//! owned by the site registry (see [`crate::sites`]); both share [`ConfigError`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use const_format::formatcp;
use serde::Deserialize;

// =============================================================================
// Certificate Material
// =============================================================================

/// File name of the PEM private key inside a certificate directory
pub const CERT_KEY_FILE: &str = "cert.key";

/// File name of the PEM certificate chain inside a certificate directory
pub const CERT_CHAIN_FILE: &str = "cert.crt";

/// Directory (relative to the base dir) holding the default certificate pair
pub const DEFAULT_CERT_DIR: &str = "certs";

/// Directory (relative to the base dir) where automated certificates are written
/// for sites that do not name their own certificate directory
pub const MANAGED_CERT_DIR: &str = "certificates";

/// Directory (relative to the base dir) for new site document roots
pub const WEBSITES_DIR: &str = "websites";

/// Directory (relative to the base dir) served for HTTP-01 challenge tokens
pub const CHALLENGE_DIR: &str = ".acme-challenges";

/// Maximum number of hostnames kept in the SNI context cache
pub const TLS_CACHE_CAPACITY: u64 = 10_000;

// =============================================================================
// Renewal Timing
// =============================================================================

/// Period of the renewal timer (5 minutes)
pub const RENEWAL_CHECK_INTERVAL_SECS: u64 = 300;

/// Delay before retrying a failed issuance (5 minutes)
pub const RENEWAL_RETRY_DELAY_SECS: u64 = 300;

/// Consecutive failures before backing off to the cooldown
pub const RENEWAL_MAX_ATTEMPTS: u32 = 5;

/// Cooldown after exhausting the retry budget (1 hour)
pub const RENEWAL_COOLDOWN_SECS: u64 = 3600;

/// Days until the next renewal after a successful issuance
pub const RENEWAL_RENEW_AFTER_DAYS: i64 = 60;

/// Outer bound around a single issuer call (10 minutes)
pub const RENEWAL_ISSUE_TIMEOUT_SECS: u64 = 600;

/// Default request timeout for the webhook issuer
pub const ISSUER_TIMEOUT_SECS: u64 = 120;

/// User-Agent sent to the issuer webhook
pub const ISSUER_USER_AGENT: &str = formatcp!(
    "{}/{} (certificate renewal)",
    env!("CARGO_PKG_NAME"),
    env!("CARGO_PKG_VERSION")
);

// =============================================================================
// Default Paths and Strings
// =============================================================================

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Default site document file name (relative to the base dir)
pub const DEFAULT_SITES_FILE: &str = "websites.json";

/// Default index file for new sites
pub const DEFAULT_INDEX_FILE: &str = "index.html";

/// Default log filter when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = "sitehost=info,tower_http=info";

/// Default log format (text or json)
pub const DEFAULT_LOG_FORMAT: &str = "text";

/// Cache-Control for challenge tokens and health checks
pub const CACHE_CONTROL_NO_STORE: &str = "no-store";

/// Seconds between site reload attempts after a failed initial load
pub const DEFAULT_RELOAD_RETRY_SECS: u64 = 30;

/// Seconds granted to open connections on shutdown
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Base directory and site document location
    #[serde(default)]
    pub server: ServerConfig,
    /// Plain HTTP listener
    #[serde(default)]
    pub http: HttpListenerConfig,
    /// HTTPS listener and certificate selection
    #[serde(default)]
    pub https: HttpsConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Certificate renewal scheduler
    #[serde(default)]
    pub renewal: RenewalConfig,
    /// External certificate issuer; absent means automation cannot issue
    pub issuer: Option<IssuerConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Directory against which every relative path is resolved
    #[serde(default = "ServerConfig::default_base_dir")]
    pub base_dir: PathBuf,
    /// Site document, relative to `base_dir`
    #[serde(default = "ServerConfig::default_sites_file")]
    pub sites_file: PathBuf,
    /// Retry period after the initial site load fails
    #[serde(default = "ServerConfig::default_reload_retry")]
    pub reload_retry_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_dir: Self::default_base_dir(),
            sites_file: Self::default_sites_file(),
            reload_retry_seconds: Self::default_reload_retry(),
        }
    }
}

impl ServerConfig {
    fn default_base_dir() -> PathBuf {
        PathBuf::from(".")
    }

    fn default_sites_file() -> PathBuf {
        PathBuf::from(DEFAULT_SITES_FILE)
    }

    fn default_reload_retry() -> u64 {
        DEFAULT_RELOAD_RETRY_SECS
    }
}

/// Plain HTTP listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpListenerConfig {
    #[serde(default = "HttpListenerConfig::default_host")]
    pub host: String,
    #[serde(default = "HttpListenerConfig::default_port")]
    pub port: u16,
}

impl Default for HttpListenerConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
        }
    }
}

impl HttpListenerConfig {
    fn default_host() -> String {
        "0.0.0.0".to_string()
    }

    fn default_port() -> u16 {
        80
    }
}

/// HTTPS listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpsConfig {
    #[serde(default = "HttpsConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "HttpListenerConfig::default_host")]
    pub host: String,
    #[serde(default = "HttpsConfig::default_port")]
    pub port: u16,
    /// Directory holding the default `cert.key`/`cert.crt` pair
    #[serde(default = "HttpsConfig::default_cert_dir")]
    pub default_cert_dir: PathBuf,
    /// Upper bound on cached SNI contexts
    #[serde(default = "HttpsConfig::default_cache_capacity")]
    pub cache_capacity: u64,
    /// Seconds to drain connections on shutdown
    #[serde(default = "HttpsConfig::default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
}

impl Default for HttpsConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            host: HttpListenerConfig::default_host(),
            port: Self::default_port(),
            default_cert_dir: Self::default_cert_dir(),
            cache_capacity: Self::default_cache_capacity(),
            shutdown_grace_seconds: Self::default_shutdown_grace(),
        }
    }
}

impl HttpsConfig {
    fn default_enabled() -> bool {
        true
    }

    fn default_port() -> u16 {
        443
    }

    fn default_cert_dir() -> PathBuf {
        PathBuf::from(DEFAULT_CERT_DIR)
    }

    fn default_cache_capacity() -> u64 {
        TLS_CACHE_CAPACITY
    }

    fn default_shutdown_grace() -> u64 {
        DEFAULT_SHUTDOWN_GRACE_SECS
    }
}

/// Host routing behaviour shared by both listeners
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    /// Allow `http://<ip or localhost>/<site>/...` access to development sites
    #[serde(default = "RoutingConfig::default_development_fallback")]
    pub development_fallback: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            development_fallback: Self::default_development_fallback(),
        }
    }
}

impl RoutingConfig {
    fn default_development_fallback() -> bool {
        true
    }
}

/// Renewal scheduler timing and retry budget
#[derive(Debug, Clone, Deserialize)]
pub struct RenewalConfig {
    #[serde(default = "RenewalConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "RenewalConfig::default_check_interval")]
    pub check_interval_seconds: u64,
    #[serde(default = "RenewalConfig::default_retry_delay")]
    pub retry_delay_seconds: u64,
    #[serde(default = "RenewalConfig::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "RenewalConfig::default_cooldown")]
    pub cooldown_seconds: u64,
    #[serde(default = "RenewalConfig::default_renew_after_days")]
    pub renew_after_days: i64,
    #[serde(default = "RenewalConfig::default_issue_timeout")]
    pub issue_timeout_seconds: u64,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            check_interval_seconds: Self::default_check_interval(),
            retry_delay_seconds: Self::default_retry_delay(),
            max_attempts: Self::default_max_attempts(),
            cooldown_seconds: Self::default_cooldown(),
            renew_after_days: Self::default_renew_after_days(),
            issue_timeout_seconds: Self::default_issue_timeout(),
        }
    }
}

impl RenewalConfig {
    fn default_enabled() -> bool {
        true
    }
    fn default_check_interval() -> u64 {
        RENEWAL_CHECK_INTERVAL_SECS
    }
    fn default_retry_delay() -> u64 {
        RENEWAL_RETRY_DELAY_SECS
    }
    fn default_max_attempts() -> u32 {
        RENEWAL_MAX_ATTEMPTS
    }
    fn default_cooldown() -> u64 {
        RENEWAL_COOLDOWN_SECS
    }
    fn default_renew_after_days() -> i64 {
        RENEWAL_RENEW_AFTER_DAYS
    }
    fn default_issue_timeout() -> u64 {
        RENEWAL_ISSUE_TIMEOUT_SECS
    }
}

/// External issuer reached over an HTTP webhook
#[derive(Debug, Clone, Deserialize)]
pub struct IssuerConfig {
    /// URL receiving issuance requests
    pub endpoint: String,
    /// Account contact forwarded to the issuer
    pub contact_email: Option<String>,
    #[serde(default = "IssuerConfig::default_timeout")]
    pub timeout_seconds: u64,
    /// Extra request headers (e.g. Authorization)
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl IssuerConfig {
    fn default_timeout() -> u64 {
        ISSUER_TIMEOUT_SECS
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "text" (human-readable, default) or "json" (structured)
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: DEFAULT_LOG_FORMAT.to_string(),
        }
    }
}

impl LoggingConfig {
    fn default_format() -> String {
        DEFAULT_LOG_FORMAT.to_string()
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&contents)?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.renewal.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "renewal.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.renewal.check_interval_seconds == 0 {
            return Err(ConfigError::Validation(
                "renewal.check_interval_seconds must be positive".to_string(),
            ));
        }
        if let Some(issuer) = &self.issuer {
            if issuer.endpoint.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "issuer.endpoint must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Resolve a configured path against `server.base_dir`
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.server.base_dir.join(path)
        }
    }

    /// Absolute location of the site document
    pub fn sites_path(&self) -> PathBuf {
        self.resolve_path(&self.server.sites_file)
    }

    /// Absolute location of the default certificate directory
    pub fn default_cert_dir(&self) -> PathBuf {
        self.resolve_path(&self.https.default_cert_dir)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to parse site document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Validation(String),
}
