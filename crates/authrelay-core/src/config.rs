//! Configuration types for the authentication relay.
//!
//! Configuration is loaded from YAML files and validated before use. Every
//! section has defaults, so an empty document is a valid configuration for a
//! primary server on port 5555.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

/// Default port of the primary server.
pub const DEFAULT_PRIMARY_PORT: u16 = 5555;

/// Offset of the delegated server's port from the primary's, by convention.
pub const DELEGATED_PORT_OFFSET: u16 = 100;

/// Default port of the delegated server.
pub const DEFAULT_DELEGATED_PORT: u16 = DEFAULT_PRIMARY_PORT + DELEGATED_PORT_OFFSET;

/// Lowest PBKDF2 iteration count accepted (RFC 7677).
pub const MIN_ITERATIONS: u32 = 4096;

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RelayConfig {
    /// TCP listener configuration.
    #[serde(default)]
    pub listen: ListenConfig,

    /// Security provider and credential configuration.
    #[serde(default)]
    pub security: SecurityConfig,

    /// Timeouts and limits applied to every connection.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Prometheus metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// TCP listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    /// Address to bind to, e.g., "0.0.0.0:5555".
    #[serde(default = "default_listen_address")]
    pub address: String,

    /// Listen backlog passed to the socket.
    #[serde(default = "default_backlog")]
    pub backlog: u32,
}

/// Mechanism backing the security provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum Mechanism {
    #[default]
    #[serde(rename = "SCRAM-SHA-256")]
    ScramSha256,
    #[serde(rename = "SCRAM-SHA-512")]
    ScramSha512,
}

impl Mechanism {
    /// Package name reported by the provider.
    #[must_use]
    pub fn mechanism_name(&self) -> &'static str {
        match self {
            Self::ScramSha256 => "SCRAM-SHA-256",
            Self::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

/// Security provider configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecurityConfig {
    /// Mechanism used for every handshake on this process.
    #[serde(default)]
    pub mechanism: Mechanism,

    /// PBKDF2 iterations used when deriving stored keys.
    #[serde(default = "default_iterations")]
    pub iterations: u32,

    /// Identity this process authenticates as when it initiates a handshake
    /// on its own behalf or on behalf of a caller.
    #[serde(default)]
    pub service: Option<UserCredential>,

    /// Users accepted by this process.
    #[serde(default)]
    pub credentials: CredentialConfig,

    /// Principals allowed to assert another identity during a handshake.
    #[serde(default)]
    pub trusted_delegates: Vec<String>,
}

/// Where accepted users come from.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CredentialConfig {
    /// Users listed directly in the configuration.
    Inline { users: Vec<UserCredential> },
    /// Users loaded from a `username:password` file.
    File { file: PathBuf },
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self::Inline { users: Vec::new() }
    }
}

/// A username/password pair with an optional domain.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserCredential {
    /// Username. Supports environment variable expansion: "${RELAY_USER}"
    pub username: String,

    /// Password. Supports environment variable expansion: "${RELAY_PASSWORD}"
    pub password: String,

    /// Optional domain appended to the principal name.
    #[serde(default)]
    pub domain: Option<String>,
}

impl UserCredential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            domain: None,
        }
    }

    #[must_use]
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Get the username with environment variables expanded.
    #[must_use]
    pub fn username(&self) -> String {
        expand_env_vars(&self.username)
    }

    /// Get the password with environment variables expanded.
    #[must_use]
    pub fn password(&self) -> String {
        expand_env_vars(&self.password)
    }

    /// Principal name: `user@domain` when a domain is set, else `user`.
    #[must_use]
    pub fn principal_name(&self) -> String {
        principal_name(&self.username(), self.domain.as_deref())
    }
}

/// Build a principal name from a username and an optional domain.
#[must_use]
pub fn principal_name(username: &str, domain: Option<&str>) -> String {
    match domain {
        Some(domain) if !domain.is_empty() => format!("{username}@{domain}"),
        _ => username.to_string(),
    }
}

/// Expand environment variables in a string.
///
/// Replaces `${VAR_NAME}` with the value of the environment variable `VAR_NAME`.
/// If the variable is not set, replaces with an empty string.
fn expand_env_vars(s: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex");
    re.replace_all(s, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .to_string()
}

/// Timeouts and limits for connections.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// TCP connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// How long a send waits for authentication to complete.
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,

    /// Bound on every socket write.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// How long a request waits for its reply.
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,

    /// How long a stop waits for in-flight work before tearing down.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Largest accepted frame payload in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

impl ConnectionConfig {
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    #[must_use]
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    #[must_use]
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Prometheus metrics configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether to enable the metrics endpoint.
    #[serde(default)]
    pub enabled: bool,

    /// Address for the metrics HTTP server.
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output logs in JSON format (for production).
    #[serde(default)]
    pub json: bool,
}

// Default value functions

fn default_listen_address() -> String {
    format!("0.0.0.0:{DEFAULT_PRIMARY_PORT}")
}

fn default_backlog() -> u32 {
    128
}

fn default_iterations() -> u32 {
    MIN_ITERATIONS
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_ready_timeout_ms() -> u64 {
    10_000
}

fn default_write_timeout_ms() -> u64 {
    10_000
}

fn default_reply_timeout_ms() -> u64 {
    30_000
}

fn default_stop_timeout_ms() -> u64 {
    1_000
}

fn default_max_frame_size() -> usize {
    crate::protocol::DEFAULT_MAX_FRAME_SIZE
}

fn default_metrics_address() -> String {
    "0.0.0.0:9095".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: default_listen_address(),
            backlog: default_backlog(),
        }
    }
}

impl ListenConfig {
    /// Parse the listen address.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is not a valid `ip:port`.
    pub fn socket_addr(&self) -> ConfigResult<SocketAddr> {
        self.address
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.address.clone()))
    }

    /// Replace the port, keeping the bind host.
    ///
    /// # Errors
    ///
    /// Returns an error if the current address cannot be parsed.
    pub fn set_port(&mut self, port: u16) -> ConfigResult<()> {
        let mut addr = self.socket_addr()?;
        addr.set_port(port);
        self.address = addr.to_string();
        Ok(())
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            mechanism: Mechanism::default(),
            iterations: default_iterations(),
            service: None,
            credentials: CredentialConfig::default(),
            trusted_delegates: Vec::new(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            ready_timeout_ms: default_ready_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            reply_timeout_ms: default_reply_timeout_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Configuration loading and validation

impl RelayConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::from_str(&content)
    }

    /// Load configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - the listen address is not `ip:port`
    /// - `iterations` is below 4096
    /// - any timeout is zero
    /// - `max_frame_size` does not fit the 4-byte length prefix
    pub fn validate(&self) -> ConfigResult<()> {
        self.listen.socket_addr()?;

        if self.security.iterations < MIN_ITERATIONS {
            return Err(ConfigError::InvalidValue {
                field: "security.iterations",
                message: format!(
                    "{} is below the minimum of {MIN_ITERATIONS}",
                    self.security.iterations
                ),
            });
        }

        let conn = &self.connection;
        for (field, value) in [
            ("connection.connect_timeout_ms", conn.connect_timeout_ms),
            ("connection.ready_timeout_ms", conn.ready_timeout_ms),
            ("connection.write_timeout_ms", conn.write_timeout_ms),
            ("connection.reply_timeout_ms", conn.reply_timeout_ms),
            ("connection.stop_timeout_ms", conn.stop_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    message: "must be greater than zero".to_string(),
                });
            }
        }

        if conn.max_frame_size == 0 || conn.max_frame_size > u32::MAX as usize {
            return Err(ConfigError::InvalidValue {
                field: "connection.max_frame_size",
                message: format!("{} is outside 1..={}", conn.max_frame_size, u32::MAX),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_valid() {
        let config = RelayConfig::from_str("{}").unwrap();
        assert_eq!(config.listen.address, "0.0.0.0:5555");
        assert_eq!(config.connection.ready_timeout_ms, 10_000);
        assert_eq!(config.connection.max_frame_size, 1024 * 1024);
        assert_eq!(config.security.mechanism, Mechanism::ScramSha256);
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(DEFAULT_PRIMARY_PORT, 5555);
        assert_eq!(DEFAULT_DELEGATED_PORT, 5655);
    }

    #[test]
    fn test_from_yaml_string() {
        let yaml = r"
listen:
  address: '127.0.0.1:6000'
security:
  mechanism: SCRAM-SHA-512
  iterations: 8192
  service:
    username: relay-svc
    password: secret
    domain: EXAMPLE
  credentials:
    users:
      - username: alice
        password: wonderland
  trusted_delegates:
    - relay-svc@EXAMPLE
connection:
  ready_timeout_ms: 2500
";
        let config = RelayConfig::from_str(yaml).unwrap();
        assert_eq!(config.listen.socket_addr().unwrap().port(), 6000);
        assert_eq!(config.security.mechanism, Mechanism::ScramSha512);
        assert_eq!(config.security.iterations, 8192);
        assert_eq!(
            config.security.service.as_ref().unwrap().principal_name(),
            "relay-svc@EXAMPLE"
        );
        assert!(matches!(
            config.security.credentials,
            CredentialConfig::Inline { ref users } if users.len() == 1
        ));
        assert_eq!(config.connection.ready_timeout(), Duration::from_millis(2500));
        assert_eq!(config.connection.write_timeout_ms, 10_000);
    }

    #[test]
    fn test_file_credentials_parsing() {
        let yaml = r"
security:
  credentials:
    file: /etc/authrelay/users
";
        let config = RelayConfig::from_str(yaml).unwrap();
        assert!(matches!(
            config.security.credentials,
            CredentialConfig::File { ref file } if file == Path::new("/etc/authrelay/users")
        ));
    }

    #[test]
    fn test_invalid_listen_address() {
        let result = RelayConfig::from_str("listen:\n  address: 'nowhere'\n");
        assert!(matches!(result, Err(ConfigError::InvalidAddress(_))));
    }

    #[test]
    fn test_iterations_too_low() {
        let mut config = RelayConfig::default();
        config.security.iterations = 1000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "security.iterations",
                ..
            })
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = RelayConfig::default();
        config.connection.ready_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_set_port() {
        let mut listen = ListenConfig::default();
        listen.set_port(5655).unwrap();
        assert_eq!(listen.address, "0.0.0.0:5655");
    }

    #[test]
    fn test_principal_name() {
        assert_eq!(principal_name("alice", None), "alice");
        assert_eq!(principal_name("alice", Some("")), "alice");
        assert_eq!(principal_name("alice", Some("CORP")), "alice@CORP");
    }

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("TEST_RELAY_USER", "svc-user");
        std::env::set_var("TEST_RELAY_PASS", "svc-password");

        let cred = UserCredential::new("${TEST_RELAY_USER}", "${TEST_RELAY_PASS}");
        assert_eq!(cred.username(), "svc-user");
        assert_eq!(cred.password(), "svc-password");

        std::env::remove_var("TEST_RELAY_USER");
        std::env::remove_var("TEST_RELAY_PASS");
    }

    #[test]
    fn test_env_var_expansion_missing_var() {
        let cred = UserCredential::new("${NONEXISTENT_RELAY_VAR}", "literal");
        assert_eq!(cred.username(), "");
        assert_eq!(cred.password(), "literal");
    }
}
