//! Configuration management for the thumbwheel scheduler
//!
//! This module handles loading and validating configuration from environment variables
//! and TOML files. Every section has defaults, so a file only needs the keys it changes.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::platform::PlatformConfig;
use crate::scheduler::driver::DriverConfig;
use crate::scheduler::executor::{ExecutorConfig, ValidatorConfig};
use crate::scheduler::finalizer::FinalizerConfig;
use crate::server::ServerConfig;
use crate::utils::retry::RetryConfig;

/// Prefix for all crate-specific environment variables
pub const ENV_PREFIX: &str = "THUMBWHEEL_";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Campaign store configuration
    pub store: StoreConfig,

    /// Tick loop configuration
    pub driver: DriverSettings,

    /// Publish pipeline configuration
    pub executor: ExecutorSettings,

    /// Analytics finalizer configuration
    pub finalizer: FinalizerSettings,

    /// Platform endpoints and credentials
    pub platform: PlatformConfig,

    /// Trigger server configuration
    pub server: ServerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Campaign store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database path
    pub sqlite_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("data/thumbwheel.db"),
        }
    }
}

/// Tick loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverSettings {
    pub tick_interval_secs: u64,
    pub finalizer_interval_secs: u64,

    /// Delay between dispatches within one tick
    pub pacing_ms: u64,

    pub max_concurrent: usize,
    pub max_campaigns_per_tick: Option<usize>,
    pub store_timeout_secs: u64,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            finalizer_interval_secs: 3600,
            pacing_ms: 500,
            max_concurrent: 4,
            max_campaigns_per_tick: None,
            store_timeout_secs: 10,
        }
    }
}

/// Publish pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Publish attempts per rotation, including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,

    /// Bound on each fetch and publish call
    pub call_timeout_secs: u64,

    pub validator: ValidatorConfig,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        let retry = RetryConfig::default();
        Self {
            max_attempts: retry.max_attempts,
            base_delay_ms: retry.base_delay_ms,
            max_delay_ms: retry.max_delay_ms,
            backoff_multiplier: retry.backoff_multiplier,
            call_timeout_secs: 30,
            validator: ValidatorConfig::default(),
        }
    }
}

/// Analytics finalizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalizerSettings {
    /// Run the finalizer from the timer loop
    pub enabled: bool,

    /// Pause after a quota signal
    pub cooldown_secs: u64,

    /// Delay between analytics calls
    pub pacing_ms: u64,

    pub max_per_run: Option<usize>,

    /// Accept an empty analytics report this many hours after the window
    /// closes. Unset keeps retrying.
    pub max_empty_age_hours: Option<u64>,
}

impl Default for FinalizerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown_secs: 600,
            pacing_ms: 3000,
            max_per_run: None,
            max_empty_age_hours: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

/// Read `THUMBWHEEL_<key>`, falling back to `default` when unset
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let name = format!("{ENV_PREFIX}{key}");
    match std::env::var(&name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("Invalid value for {name} ({raw:?}): {e}")),
        Err(_) => Ok(default),
    }
}

/// Read an optional `THUMBWHEEL_<key>`
fn env_opt<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let name = format!("{ENV_PREFIX}{key}");
    match std::env::var(&name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow!("Invalid value for {name} ({raw:?}): {e}")),
        _ => Ok(None),
    }
}

/// First set, non-empty variable among `names`
fn first_var(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|value| !value.trim().is_empty())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load from a file when given, otherwise from defaults; then apply the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = base.with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variables on top of the current values
    pub fn with_env_overrides(mut self) -> Result<Self> {
        self.store.sqlite_path = env_or("SQLITE_PATH", self.store.sqlite_path)?;

        let d = &mut self.driver;
        d.tick_interval_secs = env_or("TICK_INTERVAL_SECS", d.tick_interval_secs)?;
        d.finalizer_interval_secs = env_or("FINALIZER_INTERVAL_SECS", d.finalizer_interval_secs)?;
        d.pacing_ms = env_or("PACING_MS", d.pacing_ms)?;
        d.max_concurrent = env_or("MAX_CONCURRENT", d.max_concurrent)?;
        if let Some(max) = env_opt("MAX_CAMPAIGNS_PER_TICK")? {
            d.max_campaigns_per_tick = Some(max);
        }
        d.store_timeout_secs = env_or("STORE_TIMEOUT_SECS", d.store_timeout_secs)?;

        let e = &mut self.executor;
        e.max_attempts = env_or("MAX_ATTEMPTS", e.max_attempts)?;
        e.base_delay_ms = env_or("BASE_DELAY_MS", e.base_delay_ms)?;
        e.max_delay_ms = env_or("MAX_DELAY_MS", e.max_delay_ms)?;
        e.call_timeout_secs = env_or("CALL_TIMEOUT_SECS", e.call_timeout_secs)?;
        e.validator.min_width = env_or("MIN_WIDTH", e.validator.min_width)?;
        e.validator.max_bytes = env_or("MAX_BYTES", e.validator.max_bytes)?;

        let f = &mut self.finalizer;
        f.enabled = env_or("FINALIZER_ENABLED", f.enabled)?;
        f.cooldown_secs = env_or("FINALIZER_COOLDOWN_SECS", f.cooldown_secs)?;
        f.pacing_ms = env_or("FINALIZER_PACING_MS", f.pacing_ms)?;
        if let Some(hours) = env_opt("FINALIZER_MAX_EMPTY_AGE_HOURS")? {
            f.max_empty_age_hours = Some(hours);
        }

        let p = &mut self.platform;
        p.upload_base = env_or("UPLOAD_BASE", p.upload_base.clone())?;
        p.analytics_base = env_or("ANALYTICS_BASE", p.analytics_base.clone())?;
        p.token_url = env_or("TOKEN_URL", p.token_url.clone())?;
        p.http_timeout_secs = env_or("HTTP_TIMEOUT_SECS", p.http_timeout_secs)?;
        p.publish_requests_per_second =
            env_or("PUBLISH_REQUESTS_PER_SECOND", p.publish_requests_per_second)?;
        if let Some(id) = first_var(&["THUMBWHEEL_GOOGLE_CLIENT_ID", "GOOGLE_CLIENT_ID"]) {
            p.client_id = Some(id);
        }
        if let Some(secret) = first_var(&["THUMBWHEEL_GOOGLE_CLIENT_SECRET", "GOOGLE_CLIENT_SECRET"]) {
            p.client_secret = Some(secret);
        }

        let s = &mut self.server;
        s.bind_address = env_or("BIND_ADDRESS", s.bind_address)?;
        s.enable_cors = env_or("ENABLE_CORS", s.enable_cors)?;
        if let Some(secret) = first_var(&["THUMBWHEEL_CRON_SECRET", "CRON_SECRET"]) {
            s.cron_secret = Some(secret);
        }

        self.logging.level = env_or("LOG_LEVEL", self.logging.level)?;
        self.logging.format = env_or("LOG_FORMAT", self.logging.format)?;

        Ok(self)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.driver_config()
            .validate()
            .map_err(|e| anyhow!("driver: {e}"))?;

        self.executor_config()
            .retry
            .validate()
            .map_err(|e| anyhow!("executor: {e}"))?;

        if self.executor.call_timeout_secs == 0 {
            anyhow::bail!("executor: call_timeout_secs must be greater than 0");
        }

        if self.executor.validator.allowed_mime_types.is_empty() {
            anyhow::bail!("executor: validator.allowed_mime_types must not be empty");
        }

        if self.platform.http_timeout_secs == 0 {
            anyhow::bail!("platform: http_timeout_secs must be greater than 0");
        }

        self.server
            .validate()
            .map_err(|e| anyhow!("server: {e}"))?;

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            anyhow::bail!("logging: format must be 'text' or 'json'");
        }

        Ok(())
    }

    /// Tick loop settings as the driver consumes them
    #[must_use]
    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            tick_interval: Duration::from_secs(self.driver.tick_interval_secs),
            finalizer_interval: Duration::from_secs(self.driver.finalizer_interval_secs),
            pacing: Duration::from_millis(self.driver.pacing_ms),
            max_concurrent: self.driver.max_concurrent,
            max_campaigns_per_tick: self.driver.max_campaigns_per_tick,
            store_timeout: Duration::from_secs(self.driver.store_timeout_secs),
        }
    }

    /// Publish pipeline settings as the executor consumes them
    #[must_use]
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            retry: RetryConfig {
                max_attempts: self.executor.max_attempts,
                base_delay_ms: self.executor.base_delay_ms,
                max_delay_ms: self.executor.max_delay_ms,
                backoff_multiplier: self.executor.backoff_multiplier,
            },
            call_timeout: Duration::from_secs(self.executor.call_timeout_secs),
            validator: self.executor.validator.clone(),
        }
    }

    /// Finalizer settings as the finalizer consumes them
    #[must_use]
    pub fn finalizer_config(&self) -> FinalizerConfig {
        FinalizerConfig {
            cooldown: Duration::from_secs(self.finalizer.cooldown_secs),
            pacing: Duration::from_millis(self.finalizer.pacing_ms),
            max_per_run: self.finalizer.max_per_run,
            max_empty_age: self
                .finalizer
                .max_empty_age_hours
                .map(|hours| Duration::from_secs(hours.saturating_mul(3600))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_max_concurrent() {
        let mut config = Config::default();
        config.driver.max_concurrent = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_flat_backoff_rejected() {
        let mut config = Config::default();
        config.executor.base_delay_ms = 2000;
        config.executor.max_delay_ms = 2000;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("max_delay_ms"), "{err}");

        config.executor.max_attempts = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_log_format() {
        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_driver_config_conversion() {
        let config = Config::default();
        let driver = config.driver_config();
        assert_eq!(driver.tick_interval, Duration::from_secs(60));
        assert_eq!(driver.pacing, Duration::from_millis(500));
        assert_eq!(driver, DriverConfig::default());
    }

    #[test]
    fn test_finalizer_defaults() {
        let config = Config::default().finalizer_config();
        assert_eq!(config.cooldown, Duration::from_secs(600));
        assert_eq!(config.pacing, Duration::from_secs(3));
        assert!(config.max_empty_age.is_none());

        let mut settings = Config::default();
        settings.finalizer.max_empty_age_hours = Some(48);
        assert_eq!(
            settings.finalizer_config().max_empty_age,
            Some(Duration::from_secs(48 * 3600))
        );
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [driver]
            tick_interval_secs = 15

            [server]
            cron_secret = "abc"
            "#,
        )
        .unwrap();

        assert_eq!(config.driver.tick_interval_secs, 15);
        assert_eq!(config.driver.max_concurrent, 4);
        assert_eq!(config.server.cron_secret.as_deref(), Some("abc"));
        assert!(config.validate().is_ok());
    }
}
