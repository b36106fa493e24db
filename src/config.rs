//! Configuration management with serde serialization/deserialization
//!
//! Configuration is read once at startup from three layers, later layers
//! overriding earlier ones:
//!
//! 1. built-in defaults,
//! 2. a YAML file (by default `config/config.yml`),
//! 3. environment variables prefixed with `FANOUT_`, using `__` to separate
//!    nested keys (`FANOUT_LIMITS__GLOBAL_LIMIT=50` sets `limits.global_limit`).
//!
//! # Examples
//!
//! ```yaml
//! server:
//!   network: tcp
//!   address: "0.0.0.0:8080"
//! limits:
//!   global_limit: 100
//!   batch_limit: 4
//!   max_targets: 20
//!   call_timeout: 1s
//! ```

use crate::error::ConfigError;
use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Path probed when no configuration file is given on the command line.
pub const DEFAULT_CONFIG_PATH: &str = "config/config.yml";

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "FANOUT";

/// Main configuration structure for the service
///
/// # Examples
///
/// ```rust
/// use url_fanout::Config;
///
/// let config = Config::default();
/// assert_eq!(config.limits.global_limit, 100);
/// assert_eq!(config.limits.max_targets, 20);
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct Config {
    /// Listener settings
    #[serde(default)]
    pub server: ServerSettings,

    /// Concurrency ceilings and per-call bounds
    #[serde(default)]
    pub limits: LimitsSettings,

    /// Log output settings
    #[serde(default)]
    pub logging: LoggingSettings,

    /// Prometheus exporter settings
    #[serde(default)]
    pub metrics: MetricsSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ServerSettings {
    /// Network family: `tcp`, `tcp4` or `tcp6` (default: tcp)
    #[serde(default = "default_network")]
    pub network: String,

    /// Listen address as `host:port` (default: 0.0.0.0:8080)
    #[serde(default = "default_address")]
    pub address: String,

    /// Upper bound on a whole inbound request, including every fetch (default: 30s)
    ///
    /// When it fires the request is dropped, which cancels the in-flight
    /// fetches of that batch.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Time granted to in-flight requests after a shutdown signal (default: 10s)
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            network: default_network(),
            address: default_address(),
            request_timeout: default_request_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

fn default_network() -> String {
    "tcp".to_string()
}

fn default_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Concurrency ceilings for admission and fan-out.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use url_fanout::LimitsSettings;
///
/// let limits = LimitsSettings {
///     batch_limit: 8,
///     call_timeout: Duration::from_millis(500),
///     ..Default::default()
/// };
/// assert_eq!(limits.global_limit, 100);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LimitsSettings {
    /// Batches admitted concurrently across the whole process (default: 100)
    #[serde(default = "default_global_limit")]
    pub global_limit: usize,

    /// Outbound fetches in flight at once within one batch (default: 4)
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,

    /// Largest accepted batch (default: 20)
    #[serde(default = "default_max_targets")]
    pub max_targets: usize,

    /// Hard bound on a single outbound fetch (default: 1s)
    #[serde(default = "default_call_timeout", with = "humantime_serde")]
    pub call_timeout: Duration,
}

impl Default for LimitsSettings {
    fn default() -> Self {
        Self {
            global_limit: default_global_limit(),
            batch_limit: default_batch_limit(),
            max_targets: default_max_targets(),
            call_timeout: default_call_timeout(),
        }
    }
}

fn default_global_limit() -> usize {
    100
}

fn default_batch_limit() -> usize {
    4
}

fn default_max_targets() -> usize {
    20
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(1)
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LoggingSettings {
    /// Default level when `RUST_LOG` is unset (default: info)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output (default: false)
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

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct MetricsSettings {
    /// Install the Prometheus recorder and serve its text format on `/metrics`
    #[serde(default)]
    pub enabled: bool,
}

impl Config {
    /// Load configuration from a YAML file with environment overrides.
    ///
    /// The file must exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::Invalid(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }

        Self::build(Some(path))
    }

    /// Like [`Config::load`], but falls back to defaults plus environment
    /// overrides when the file is absent.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::build(Some(path))
        } else {
            Self::build(None)
        }
    }

    fn build(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }

        let loaded = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = loaded.try_deserialize()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.global_limit == 0 {
            return Err(ConfigError::Invalid(
                "global_limit must be greater than 0".to_string(),
            ));
        }

        if self.limits.batch_limit == 0 {
            return Err(ConfigError::Invalid(
                "batch_limit must be greater than 0".to_string(),
            ));
        }

        if self.limits.max_targets == 0 {
            return Err(ConfigError::Invalid(
                "max_targets must be greater than 0".to_string(),
            ));
        }

        if self.limits.call_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "call_timeout must be greater than 0".to_string(),
            ));
        }

        if self.server.request_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "request_timeout must be greater than 0".to_string(),
            ));
        }

        if self.server.address.trim().is_empty() {
            return Err(ConfigError::Invalid("address must not be empty".to_string()));
        }

        NetworkFamily::parse(&self.server.network)?;

        Ok(())
    }
}

/// Address family accepted by the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkFamily {
    /// Either family; the first resolved address wins
    Any,
    V4,
    V6,
}

impl NetworkFamily {
    pub fn parse(network: &str) -> Result<Self, ConfigError> {
        match network {
            "tcp" => Ok(NetworkFamily::Any),
            "tcp4" => Ok(NetworkFamily::V4),
            "tcp6" => Ok(NetworkFamily::V6),
            other => Err(ConfigError::Invalid(format!(
                "unsupported network {other:?}, expected tcp, tcp4 or tcp6"
            ))),
        }
    }

    pub fn accepts(&self, addr: &std::net::SocketAddr) -> bool {
        match self {
            NetworkFamily::Any => true,
            NetworkFamily::V4 => addr.is_ipv4(),
            NetworkFamily::V6 => addr.is_ipv6(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_limits() {
        let config = Config::default();
        assert_eq!(config.limits.global_limit, 100);
        assert_eq!(config.limits.batch_limit, 4);
        assert_eq!(config.limits.max_targets, 20);
        assert_eq!(config.limits.call_timeout, Duration::from_secs(1));
        assert_eq!(config.server.shutdown_timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        writeln!(
            file,
            "server:\n  network: tcp4\n  address: \"127.0.0.1:9090\"\nlimits:\n  global_limit: 7\n  call_timeout: 250ms\n"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.network, "tcp4");
        assert_eq!(config.server.address, "127.0.0.1:9090");
        assert_eq!(config.limits.global_limit, 7);
        assert_eq!(config.limits.call_timeout, Duration::from_millis(250));
        // untouched keys keep their defaults
        assert_eq!(config.limits.batch_limit, 4);
        assert_eq!(config.limits.max_targets, 20);
    }

    #[test]
    fn test_load_missing_file_is_an_error() {
        let result = Config::load("/nonexistent/fanout.yml");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_or_default_without_file() {
        let config = Config::load_or_default("/nonexistent/fanout.yml").unwrap();
        assert_eq!(config.limits.max_targets, 20);
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = Config::default();
        config.limits.batch_limit = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.limits.global_limit = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.limits.call_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_network() {
        let mut config = Config::default();
        config.server.network = "unix".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_network_family_filter() {
        let v4: std::net::SocketAddr = "127.0.0.1:80".parse().unwrap();
        let v6: std::net::SocketAddr = "[::1]:80".parse().unwrap();

        assert!(NetworkFamily::Any.accepts(&v4));
        assert!(NetworkFamily::Any.accepts(&v6));
        assert!(NetworkFamily::V4.accepts(&v4));
        assert!(!NetworkFamily::V4.accepts(&v6));
        assert!(NetworkFamily::V6.accepts(&v6));
    }
}
