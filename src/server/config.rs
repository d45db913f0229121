//! Trigger server configuration

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};

fn default_bind_address() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080))
}

/// Listener and access settings for the trigger server
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: SocketAddr,

    /// Allow browser callers from any origin
    pub enable_cors: bool,

    /// Wrap routes in `TraceLayer`
    pub enable_request_logging: bool,

    /// Shared secret for trigger endpoints; without one every trigger is refused
    pub cron_secret: Option<String>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_address", &self.bind_address)
            .field("enable_cors", &self.enable_cors)
            .field("enable_request_logging", &self.enable_request_logging)
            .field("cron_secret", &self.cron_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            enable_cors: false,
            enable_request_logging: true,
            cron_secret: None,
        }
    }
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Reject a configured but blank secret
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(secret) = &self.cron_secret {
            if secret.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "cron_secret".to_string(),
                    reason: "Secret must not be blank".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Whether trigger endpoints can ever be authorized
    pub fn has_secret(&self) -> bool {
        self.cron_secret.is_some()
    }
}

/// Builder for ServerConfig
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    bind_address: Option<SocketAddr>,
    enable_cors: Option<bool>,
    enable_request_logging: Option<bool>,
    cron_secret: Option<String>,
}

impl ServerConfigBuilder {
    pub fn bind_address(mut self, addr: SocketAddr) -> Self {
        self.bind_address = Some(addr);
        self
    }

    /// Parse and set the bind address
    pub fn bind_address_str(mut self, addr: &str) -> Result<Self, ConfigError> {
        self.bind_address = Some(addr.parse().map_err(|_| ConfigError::InvalidValue {
            field: "bind_address".to_string(),
            reason: format!("Invalid address: {}", addr),
        })?);
        Ok(self)
    }

    pub fn enable_cors(mut self, enable: bool) -> Self {
        self.enable_cors = Some(enable);
        self
    }

    pub fn enable_request_logging(mut self, enable: bool) -> Self {
        self.enable_request_logging = Some(enable);
        self
    }

    /// Set the shared trigger secret
    pub fn cron_secret(mut self, secret: impl Into<String>) -> Self {
        self.cron_secret = Some(secret.into());
        self
    }

    /// Fill unset fields with defaults and validate
    pub fn build(self) -> Result<ServerConfig, ConfigError> {
        let config = ServerConfig {
            bind_address: self.bind_address.unwrap_or_else(default_bind_address),
            enable_cors: self.enable_cors.unwrap_or(false),
            enable_request_logging: self.enable_request_logging.unwrap_or(true),
            cron_secret: self.cron_secret,
        };

        config.validate()?;
        Ok(config)
    }
}

/// Invalid server configuration
#[derive(Debug, Clone)]
pub enum ConfigError {
    InvalidValue { field: String, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { field, reason } => {
                write!(f, "{}: {}", field, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_address.port(), 8080);
        assert!(!config.has_secret());
    }

    #[test]
    fn test_config_builder() {
        let config = ServerConfig::builder()
            .bind_address_str("127.0.0.1:9000")
            .unwrap()
            .enable_cors(true)
            .cron_secret("s3cret")
            .build()
            .unwrap();

        assert_eq!(config.bind_address.port(), 9000);
        assert!(config.enable_cors);
        assert!(config.has_secret());
    }

    #[test]
    fn test_invalid_bind_address() {
        let result = ServerConfig::builder().bind_address_str("not-an-address");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_blank_secret_rejected() {
        let result = ServerConfig::builder().cron_secret("   ").build();
        assert!(result.is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config = ServerConfig::builder().cron_secret("s3cret").build().unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("<redacted>"));
    }
}
