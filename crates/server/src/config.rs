use std::{net::SocketAddr, str::FromStr, time::Duration};

use huddle_core::identity::Role;
use huddle_crypto::SigningSecret;
use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid bind address: {0}")]
    InvalidBindAddr(String),
    #[error("invalid setting {key}: {reason}")]
    InvalidSetting { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind_addr: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Base64url shared secret used to sign and verify bearer credentials.
    pub secret: Option<String>,
    pub token_ttl_hours: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            secret: None,
            token_ttl_hours: 12,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct GatewayConfig {
    pub history_limit: usize,
    pub heartbeat_interval_secs: u64,
    pub max_missed_heartbeats: u32,
    pub max_connections: usize,
    pub outbound_buffer: usize,
    pub max_message_length: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            history_limit: 200,
            heartbeat_interval_secs: 25,
            max_missed_heartbeats: 2,
            max_connections: 1024,
            outbound_buffer: 256,
            max_message_length: 4000,
        }
    }
}

impl GatewayConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

/// A user entry seeded into the in-memory directory.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SeedUser {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    #[serde(default = "default_role")]
    pub role: Role,
    #[serde(default)]
    pub team_id: Option<Uuid>,
}

fn default_role() -> Role {
    Role::Member
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct DirectoryConfig {
    pub users: Vec<SeedUser>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: Option<String>,
    pub host: String,
    pub port: u16,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub session: SessionConfig,
    pub gateway: GatewayConfig,
    pub metrics: MetricsConfig,
    pub directory: DirectoryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: None,
            host: "0.0.0.0".to_string(),
            port: 8080,
            log_format: LogFormat::Compact,
            database_url: None,
            database_max_connections: 5,
            session: SessionConfig::default(),
            gateway: GatewayConfig::default(),
            metrics: MetricsConfig::default(),
            directory: DirectoryConfig::default(),
        }
    }
}

/// Values supplied on the command line; they win over files and environment.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind_addr: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_format: Option<LogFormat>,
    pub database_url: Option<String>,
    pub session_secret: Option<String>,
    pub metrics_enabled: Option<bool>,
    pub metrics_bind_addr: Option<String>,
}

impl ServerConfig {
    const ENV_PREFIX: &'static str = "HUDDLE_SERVER";

    pub fn load() -> Result<Self, ConfigError> {
        let defaults = ServerConfig::default();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/server").required(false))
            .add_source(config::File::with_name("config/server.local").required(false))
            .add_source(
                config::Environment::with_prefix(Self::ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .set_default("host", defaults.host.clone())?
            .set_default("port", defaults.port as i64)?
            .set_default("log_format", defaults.log_format.as_str())?
            .set_default(
                "gateway.history_limit",
                defaults.gateway.history_limit as i64,
            )?
            .set_default(
                "gateway.heartbeat_interval_secs",
                defaults.gateway.heartbeat_interval_secs as i64,
            )?
            .set_default("metrics.enabled", defaults.metrics.enabled)?;

        let settings: ServerConfig = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Names of the `HUDDLE_SERVER__*` variables present in the environment.
    pub fn environment_override_keys() -> Vec<String> {
        let prefix = format!("{}__", Self::ENV_PREFIX);
        let mut keys: Vec<String> = std::env::vars()
            .map(|(key, _)| key)
            .filter(|key| key.starts_with(&prefix))
            .collect();
        keys.sort();
        keys
    }

    pub fn apply_overrides(&mut self, overrides: &CliOverrides) -> Result<(), ConfigError> {
        if let Some(bind_addr) = &overrides.bind_addr {
            self.bind_addr = Some(bind_addr.clone());
        }
        if let Some(host) = &overrides.host {
            self.host = host.clone();
        }
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(format) = overrides.log_format {
            self.log_format = format;
        }
        if let Some(url) = &overrides.database_url {
            self.database_url = Some(url.clone());
        }
        if let Some(secret) = &overrides.session_secret {
            self.session.secret = Some(secret.clone());
        }
        if let Some(enabled) = overrides.metrics_enabled {
            self.metrics.enabled = enabled;
        }
        if let Some(addr) = &overrides.metrics_bind_addr {
            self.metrics.bind_addr = Some(addr.clone());
        }
        self.validate()
    }

    pub fn listener_addr(&self) -> Result<SocketAddr, ConfigError> {
        if let Some(addr) = &self.bind_addr {
            return addr
                .parse()
                .map_err(|_| ConfigError::InvalidBindAddr(addr.clone()));
        }

        let addr = format!("{}:{}", self.host, self.port);
        addr.parse().map_err(|_| ConfigError::InvalidBindAddr(addr))
    }

    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// The configured secret, or `None` when an ephemeral one must be generated.
    pub fn signing_secret(&self) -> Result<Option<SigningSecret>, ConfigError> {
        self.session
            .secret
            .as_deref()
            .map(|raw| {
                SigningSecret::from_base64(raw).map_err(|err| ConfigError::InvalidSetting {
                    key: "session.secret",
                    reason: err.to_string(),
                })
            })
            .transpose()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidBindAddr("port cannot be zero".into()));
        }
        if let Some(addr) = &self.bind_addr {
            addr.parse::<SocketAddr>()
                .map_err(|_| ConfigError::InvalidBindAddr(addr.clone()))?;
        }
        if let Some(addr) = &self.metrics.bind_addr {
            addr.parse::<SocketAddr>()
                .map_err(|_| ConfigError::InvalidBindAddr(addr.clone()))?;
        }
        if self.gateway.history_limit == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "gateway.history_limit",
                reason: "must be greater than zero".into(),
            });
        }
        if self.gateway.heartbeat_interval_secs == 0 || self.gateway.max_missed_heartbeats == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "gateway.heartbeat_interval_secs",
                reason: "heartbeat interval and missed limit must be positive".into(),
            });
        }
        if self.gateway.max_connections == 0 || self.gateway.outbound_buffer == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "gateway.max_connections",
                reason: "connection limit and outbound buffer must be positive".into(),
            });
        }
        if self.session.token_ttl_hours <= 0 {
            return Err(ConfigError::InvalidSetting {
                key: "session.token_ttl_hours",
                reason: "must be positive".into(),
            });
        }
        self.signing_secret()?;
        Ok(())
    }
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Compact => "compact",
            LogFormat::Json => "json",
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            other => Err(format!("unsupported log format '{other}'")),
        }
    }
}

impl<'de> Deserialize<'de> for LogFormat {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        LogFormat::from_str(&value).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    #[test]
    fn defaults_match_expectations() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.log_format, LogFormat::Compact);
        assert_eq!(config.gateway.history_limit, 200);
        assert_eq!(config.gateway.heartbeat_interval(), Duration::from_secs(25));
        assert_eq!(config.session.token_ttl_hours, 12);
        assert!(config.session.secret.is_none());
        assert!(!config.metrics.enabled);
    }

    #[test]
    #[serial]
    fn environment_overrides_take_effect() {
        env::set_var("HUDDLE_SERVER__HOST", "127.0.0.1");
        env::set_var("HUDDLE_SERVER__PORT", "9090");
        env::set_var("HUDDLE_SERVER__LOG_FORMAT", "json");
        env::set_var("HUDDLE_SERVER__GATEWAY__HISTORY_LIMIT", "50");

        let config = ServerConfig::load().expect("config loads");
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9090);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.gateway.history_limit, 50);
        assert!(ServerConfig::environment_override_keys()
            .contains(&"HUDDLE_SERVER__GATEWAY__HISTORY_LIMIT".to_string()));

        env::remove_var("HUDDLE_SERVER__HOST");
        env::remove_var("HUDDLE_SERVER__PORT");
        env::remove_var("HUDDLE_SERVER__LOG_FORMAT");
        env::remove_var("HUDDLE_SERVER__GATEWAY__HISTORY_LIMIT");
    }

    #[test]
    #[serial]
    fn listener_addr_prefers_bind_addr() {
        env::set_var("HUDDLE_SERVER__BIND_ADDR", "192.168.1.20:5555");

        let config = ServerConfig::load().expect("config loads");
        let addr = config.listener_addr().expect("valid addr");
        assert_eq!(addr.to_string(), "192.168.1.20:5555");

        env::remove_var("HUDDLE_SERVER__BIND_ADDR");
    }

    #[test]
    fn listener_addr_composes_host_and_port() {
        let config = ServerConfig {
            host: "10.0.0.2".into(),
            port: 7000,
            ..ServerConfig::default()
        };

        let addr = config.listener_addr().expect("valid addr");
        assert_eq!(addr.to_string(), "10.0.0.2:7000");
    }

    #[test]
    #[serial]
    fn invalid_bind_addr_is_rejected_on_load() {
        env::set_var("HUDDLE_SERVER__BIND_ADDR", "::invalid::");

        let err = ServerConfig::load().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBindAddr(_)));

        env::remove_var("HUDDLE_SERVER__BIND_ADDR");
    }

    #[test]
    #[serial]
    fn zero_history_limit_is_rejected() {
        env::set_var("HUDDLE_SERVER__GATEWAY__HISTORY_LIMIT", "0");

        let err = ServerConfig::load().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidSetting {
                key: "gateway.history_limit",
                ..
            }
        ));

        env::remove_var("HUDDLE_SERVER__GATEWAY__HISTORY_LIMIT");
    }

    #[test]
    fn undecodable_secret_is_rejected() {
        let mut config = ServerConfig::default();
        let overrides = CliOverrides {
            session_secret: Some("not base64!".into()),
            ..CliOverrides::default()
        };
        let err = config.apply_overrides(&overrides).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidSetting {
                key: "session.secret",
                ..
            }
        ));
    }

    #[test]
    fn configured_secret_decodes() {
        let secret = SigningSecret::generate();
        let mut config = ServerConfig::default();
        config.session.secret = Some(secret.to_base64());
        assert!(config.signing_secret().expect("valid secret").is_some());
        assert!(ServerConfig::default().signing_secret().unwrap().is_none());
    }
}
