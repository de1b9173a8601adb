//! Connection and runtime configuration for the SFTP client.
//!
//! Shaped after the teacher's server-side `Config`: one struct, one
//! `#[serde(default = "...")]` per field, a matching `default_*()` free
//! function, and a `from_file`/TOML load path — generalized here to the
//! client's own recognized options (spec.md §6).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::transport::Signer;

/// How this client authenticates to the SSH server.
#[derive(Clone)]
pub enum AuthMethod {
    /// Password authentication.
    Password(String),
    /// Public-key authentication; the passphrase (if any) is handled
    /// upstream, during the signer's own construction.
    PrivateKey(Arc<dyn Signer>),
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::Password(_) => f.write_str("AuthMethod::Password(..)"),
            AuthMethod::PrivateKey(_) => f.write_str("AuthMethod::PrivateKey(..)"),
        }
    }
}

/// Per-phase timeouts. `chunk` seeds the adaptive controller's starting
/// point; it does not cap the controller's own computed timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Time allowed for TCP connect + SSH handshake + SFTP INIT/VERSION.
    pub connect: Duration,
    /// Default ceiling for a single control operation (stat, mkdir, ...).
    pub operation: Duration,
    /// Default ceiling for a single data chunk (read/write).
    pub chunk: Duration,
    /// How long `end()` waits for in-flight operations before disconnecting
    /// unconditionally.
    pub graceful_disconnect: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(15),
            operation: Duration::from_secs(30),
            chunk: Duration::from_secs(30),
            graceful_disconnect: Duration::from_secs(10),
        }
    }
}

/// Keepalive probe configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// Whether the keepalive timer runs at all.
    pub enabled: bool,
    /// Interval between probes. Must be at least 1000 ms.
    pub interval: Duration,
    /// Consecutive missed probes before the connection is forced closed.
    pub max_missed: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            max_missed: 3,
        }
    }
}

/// Health-check probe method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckMethod {
    /// Use the transport's `ping`.
    Ping,
    /// Use `REALPATH(".")`.
    Realpath,
}

/// Health-check configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Whether the health-check timer runs at all.
    pub enabled: bool,
    /// Probe method.
    pub method: HealthCheckMethod,
    /// Interval between probes. Must be at least 1000 ms.
    pub interval: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            method: HealthCheckMethod::Ping,
            interval: Duration::from_secs(60),
        }
    }
}

/// Exponential-backoff auto-reconnect configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoReconnectConfig {
    /// Whether an unplanned close triggers automatic reconnection.
    pub enabled: bool,
    /// Maximum reconnect attempts before giving up.
    pub max_attempts: u32,
    /// Delay before the first attempt. Must be at least 100 ms.
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_multiplier: f64,
}

impl Default for AutoReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
        }
    }
}

/// SSH algorithm preference lists, passed through to the concrete
/// transport. An empty list means "use the transport's own default".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlgorithmPreferences {
    /// Key-exchange algorithm names, most preferred first.
    pub kex: Vec<String>,
    /// Host-key algorithm names, most preferred first.
    pub host_key: Vec<String>,
    /// Cipher names, most preferred first.
    pub cipher: Vec<String>,
    /// MAC names, most preferred first.
    pub mac: Vec<String>,
    /// Compression algorithm names, most preferred first.
    pub compress: Vec<String>,
}

/// Log format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability.
    Text,
    /// JSON structured logging for log aggregators.
    Json,
}

/// Logging configuration, in the client-appropriate shape (no audit file,
/// no SIEM framing — this is a library, not a hosting product).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,
    /// Log format.
    pub format: LogFormat,
    /// Optional log file path; logs to stderr if unset.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

/// How operations behave once `max_concurrent_ops` permits are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaturationPolicy {
    /// New operations wait for a permit to free up.
    Queue,
    /// New operations fail immediately with a retryable error.
    FailFast,
}

impl Default for SaturationPolicy {
    fn default() -> Self {
        SaturationPolicy::Queue
    }
}

/// Client-side connection and runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// SSH server hostname or address.
    pub host: String,

    /// SSH server port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username to authenticate as.
    pub username: String,

    /// How to authenticate. Not serializable (carries either a plaintext
    /// password or a live `Signer`); constructed programmatically, or
    /// attached via `with_auth` after a TOML load.
    #[serde(skip)]
    pub auth: Option<AuthMethod>,

    /// Per-phase timeouts.
    #[serde(default)]
    pub timeouts: Timeouts,

    /// Keepalive probe configuration.
    #[serde(default)]
    pub keepalive: KeepaliveConfig,

    /// Health-check configuration.
    #[serde(default)]
    pub health_check: HealthCheckConfig,

    /// Auto-reconnect configuration.
    #[serde(default)]
    pub auto_reconnect: AutoReconnectConfig,

    /// SSH algorithm preference lists.
    #[serde(default)]
    pub algorithms: AlgorithmPreferences,

    /// Maximum operations allowed to run concurrently through the public
    /// facade.
    #[serde(default = "default_max_concurrent_ops")]
    pub max_concurrent_ops: usize,

    /// What happens to a new operation when `max_concurrent_ops` is
    /// already saturated.
    #[serde(default)]
    pub saturation_policy: SaturationPolicy,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Where this config was loaded from, if it was loaded from a file.
    #[serde(skip)]
    pub config_file_path: Option<PathBuf>,
}

fn default_port() -> u16 {
    22
}

fn default_max_concurrent_ops() -> usize {
    10
}

impl ClientConfig {
    /// Construct a minimal configuration; callers typically follow this
    /// with `.with_auth(...)` and any timeout/policy overrides.
    #[must_use]
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: username.into(),
            auth: None,
            timeouts: Timeouts::default(),
            keepalive: KeepaliveConfig::default(),
            health_check: HealthCheckConfig::default(),
            auto_reconnect: AutoReconnectConfig::default(),
            algorithms: AlgorithmPreferences::default(),
            max_concurrent_ops: default_max_concurrent_ops(),
            saturation_policy: SaturationPolicy::default(),
            logging: LoggingConfig::default(),
            config_file_path: None,
        }
    }

    /// Attach the authentication method.
    #[must_use]
    pub fn with_auth(mut self, auth: AuthMethod) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Load configuration from a TOML file. `auth` is always `None` after
    /// loading — credentials are never stored on disk by this crate — the
    /// caller must attach one via `with_auth` before connecting.
    ///
    /// # Errors
    /// Returns `Error::Config` if the file cannot be read or does not parse
    /// as valid TOML matching this shape.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("failed to read config file: {e}")))?;
        let mut config: Self =
            toml::from_str(&content).map_err(|e| crate::Error::Config(format!("failed to parse config: {e}")))?;
        config.config_file_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Validate recognized-option constraints (spec.md §6): keepalive and
    /// health-check intervals at least 1000 ms, reconnect delay at least
    /// 100 ms, `max_attempts`/`backoff_multiplier` at least 1.
    ///
    /// # Errors
    /// Returns `Error::Config` describing the first constraint violated.
    pub fn validate(&self) -> crate::Result<()> {
        if self.keepalive.enabled && self.keepalive.interval < Duration::from_millis(1000) {
            return Err(crate::Error::Config("keepalive.interval must be at least 1000ms".into()));
        }
        if self.health_check.enabled && self.health_check.interval < Duration::from_millis(1000) {
            return Err(crate::Error::Config("health_check.interval must be at least 1000ms".into()));
        }
        if self.auto_reconnect.enabled {
            if self.auto_reconnect.initial_delay < Duration::from_millis(100) {
                return Err(crate::Error::Config("auto_reconnect.initial_delay must be at least 100ms".into()));
            }
            if self.auto_reconnect.max_attempts < 1 {
                return Err(crate::Error::Config("auto_reconnect.max_attempts must be at least 1".into()));
            }
            if self.auto_reconnect.backoff_multiplier < 1.0 {
                return Err(crate::Error::Config("auto_reconnect.backoff_multiplier must be at least 1.0".into()));
            }
        }
        if self.max_concurrent_ops == 0 {
            return Err(crate::Error::Config("max_concurrent_ops must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_is_22() {
        let config = ClientConfig::new("example.com", "alice");
        assert_eq!(config.port, 22);
    }

    #[test]
    fn validate_rejects_sub_second_keepalive_interval() {
        let mut config = ClientConfig::new("example.com", "alice");
        config.keepalive.interval = Duration::from_millis(10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_accepts_defaults() {
        let config = ClientConfig::new("example.com", "alice");
        assert!(config.validate().is_ok());
    }
}
