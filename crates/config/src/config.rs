//! Configuration structures and parsing for acme-proxy

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// Listen addresses
    #[serde(default)]
    pub server: ServerConfig,

    /// ACME account and CA
    #[serde(default)]
    pub acme: AcmeConfig,

    /// Certificate storage and matching
    #[serde(default)]
    pub certs: CertsConfig,

    /// Automatic refresh
    #[serde(default)]
    pub refresh: RefreshConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.acme.email.trim().is_empty() {
            return Err(ConfigError::Validation(
                "acme.email is required".to_string(),
            ));
        }

        let counts = [
            ("refresh.batch_size", self.refresh.batch_size as u64),
            ("refresh.failure_threshold", u64::from(self.refresh.failure_threshold)),
            ("refresh.list_limit", self.refresh.list_limit as u64),
        ];
        let durations = [
            ("certs.local_refresh_period", self.certs.local_refresh_period),
            ("certs.cache_ttl", self.certs.cache_ttl),
            ("certs.fetch_timeout", self.certs.fetch_timeout),
            ("refresh.period", self.refresh.period),
            ("refresh.timeout", self.refresh.timeout),
            ("refresh.verify_timeout", self.refresh.verify_timeout),
        ];
        for (name, value) in counts.iter().chain(durations.iter()) {
            if *value == 0 {
                return Err(ConfigError::Validation(format!("{} must be greater than 0", name)));
            }
        }

        if self.server.http_listen.is_empty() || self.server.https_listen.is_empty() {
            return Err(ConfigError::Validation(
                "server listen addresses must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

/// Global configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Plain HTTP listener answering echo and HTTP-01 challenges
    #[serde(default = "default_http_listen")]
    pub http_listen: String,

    /// TLS listener
    #[serde(default = "default_https_listen")]
    pub https_listen: String,
}

fn default_http_listen() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_https_listen() -> String {
    "0.0.0.0:8010".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_listen: default_http_listen(),
            https_listen: default_https_listen(),
        }
    }
}

/// ACME configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeConfig {
    /// ACME account email
    #[serde(default)]
    pub email: String,

    /// CA directory URL or provider name ("letsencrypt", "zerossl", ...)
    #[serde(default = "default_acme_ca")]
    pub ca: String,
}

fn default_acme_ca() -> String {
    "letsencrypt-staging".to_string()
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            email: String::new(),
            ca: default_acme_ca(),
        }
    }
}

/// Certificate storage and SNI matching
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertsConfig {
    /// Certificate inventory path
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,

    /// Serve certificates from a local directory
    #[serde(default = "default_true")]
    pub local_enabled: bool,

    /// Local certificate directory
    #[serde(default = "default_local_path")]
    pub local_path: PathBuf,

    /// Seconds between reloads of the local directory
    #[serde(default = "default_local_refresh_period")]
    pub local_refresh_period: u64,

    /// Domain whose certificate is served when nothing matches
    #[serde(default)]
    pub default_domain: Option<String>,

    /// Match cache TTL in seconds
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: u64,

    /// Seconds allowed for one handshake's certificate lookup
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout: u64,
}

impl CertsConfig {
    pub fn local_refresh_period(&self) -> Duration {
        Duration::from_secs(self.local_refresh_period)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout)
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("./data")
}

fn default_true() -> bool {
    true
}

fn default_local_path() -> PathBuf {
    PathBuf::from("./certs")
}

fn default_local_refresh_period() -> u64 {
    12 * 3600
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_fetch_timeout() -> u64 {
    10
}

impl Default for CertsConfig {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            local_enabled: default_true(),
            local_path: default_local_path(),
            local_refresh_period: default_local_refresh_period(),
            default_domain: None,
            cache_ttl: default_cache_ttl(),
            fetch_timeout: default_fetch_timeout(),
        }
    }
}

/// Automatic refresh tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// Certificates refreshed per run
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Consecutive failures after which a certificate is left alone
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds a certificate must go unmodified before it is refreshed again
    #[serde(default = "default_cooldown")]
    pub cooldown: u64,

    /// Seconds between scheduled runs
    #[serde(default = "default_period")]
    pub period: u64,

    /// Time budget in seconds for one scheduled run, checked between records
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Seconds allowed for verifying one domain
    #[serde(default = "default_verify_timeout")]
    pub verify_timeout: u64,

    /// Maximum rows for list and manual refresh
    #[serde(default = "default_list_limit")]
    pub list_limit: usize,
}

impl RefreshConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown)
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout)
    }
}

fn default_batch_size() -> usize {
    10
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown() -> u64 {
    300
}

fn default_period() -> u64 {
    6 * 3600
}

fn default_timeout() -> u64 {
    30
}

fn default_verify_timeout() -> u64 {
    5
}

fn default_list_limit() -> usize {
    100
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            failure_threshold: default_failure_threshold(),
            cooldown: default_cooldown(),
            period: default_period(),
            timeout: default_timeout(),
            verify_timeout: default_verify_timeout(),
            list_limit: default_list_limit(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.global.log_level, "info");
        assert_eq!(config.server.http_listen, "0.0.0.0:8000");
        assert_eq!(config.server.https_listen, "0.0.0.0:8010");
        assert_eq!(config.acme.ca, "letsencrypt-staging");
        assert_eq!(config.certs.storage_path, PathBuf::from("./data"));
        assert!(config.certs.local_enabled);
        assert_eq!(config.certs.cache_ttl(), Duration::from_secs(3600));
        assert_eq!(config.refresh.batch_size, 10);
        assert_eq!(config.refresh.failure_threshold, 3);
        assert_eq!(config.refresh.cooldown(), Duration::from_secs(300));
        assert_eq!(config.refresh.period(), Duration::from_secs(21600));
        assert_eq!(config.refresh.verify_timeout(), Duration::from_secs(5));
        assert_eq!(config.refresh.list_limit, 100);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[global]
log_level = "debug"

[server]
http_listen = "127.0.0.1:80"

[acme]
email = "admin@example.com"
ca = "zerossl"

[certs]
storage_path = "/var/lib/acme-proxy"
local_enabled = false
default_domain = "example.com"

[refresh]
batch_size = 5
"#;

        let config = Config::parse(toml).unwrap();
        assert_eq!(config.global.log_level, "debug");
        assert_eq!(config.server.http_listen, "127.0.0.1:80");
        assert_eq!(config.server.https_listen, "0.0.0.0:8010");
        assert_eq!(config.acme.ca, "zerossl");
        assert!(!config.certs.local_enabled);
        assert_eq!(config.certs.default_domain.as_deref(), Some("example.com"));
        assert_eq!(config.refresh.batch_size, 5);
        assert_eq!(config.refresh.failure_threshold, 3);
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            Config::parse(""),
            Err(ConfigError::Validation(_))
        ));

        let zero_batch = r#"
[acme]
email = "admin@example.com"

[refresh]
batch_size = 0
"#;
        let err = Config::parse(zero_batch).unwrap_err();
        assert!(err.to_string().contains("refresh.batch_size"));

        let zero_timeout = r#"
[acme]
email = "admin@example.com"

[certs]
fetch_timeout = 0
"#;
        assert!(Config::parse(zero_timeout).is_err());
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            Config::parse("[acme\nemail = 1"),
            Err(ConfigError::TomlParse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[acme]\nemail = \"admin@example.com\"").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.acme.email, "admin@example.com");

        assert!(matches!(
            Config::load("/nonexistent/acme-proxy.toml"),
            Err(ConfigError::Io(_))
        ));
    }
}
