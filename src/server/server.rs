//! Trigger server implementation
//!
//! Serves the cron trigger and operator endpoints on top of a shared
//! [`SchedulerDriver`]. The timer loop, when enabled, is started
//! separately; both paths share the driver's run state.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::http::Method;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::scheduler::driver::SchedulerDriver;
use crate::storage::SharedCampaignStore;

use super::api::create_router;
use super::config::ServerConfig;

// ============================================================================
// App State
// ============================================================================

/// State handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub driver: SchedulerDriver,

    /// Campaign store, for existence checks
    pub store: SharedCampaignStore,

    /// Shared trigger secret
    pub cron_secret: Option<Arc<str>>,

    /// For the uptime field of health and status
    pub start_time: Instant,
}

impl AppState {
    pub fn new(driver: SchedulerDriver, store: SharedCampaignStore, cron_secret: Option<&str>) -> Self {
        Self {
            driver,
            store,
            cron_secret: cron_secret.map(Arc::from),
            start_time: Instant::now(),
        }
    }

    pub fn cron_secret(&self) -> Option<&str> {
        self.cron_secret.as_deref()
    }
}

// ============================================================================
// Trigger Server
// ============================================================================

/// HTTP front end for external cron and operators
pub struct TriggerServer {
    config: ServerConfig,
    state: AppState,
}

impl TriggerServer {
    /// Validate the configuration and capture the shared state
    pub fn new(
        config: ServerConfig,
        driver: SchedulerDriver,
        store: SharedCampaignStore,
    ) -> Result<Self, ServerError> {
        config
            .validate()
            .map_err(|e| ServerError::ConfigError(e.to_string()))?;

        if !config.has_secret() {
            tracing::warn!("No cron secret configured; trigger endpoints will refuse every request");
        }

        let state = AppState::new(driver, store, config.cron_secret.as_deref());
        Ok(Self { config, state })
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Routes plus the optional CORS and request-trace layers
    pub fn build_router(&self) -> Router {
        let mut router = create_router(self.state.clone());

        if self.config.enable_cors {
            router = router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods([Method::GET, Method::POST])
                    .allow_headers(Any),
            );
        }

        if self.config.enable_request_logging {
            router = router.layer(TraceLayer::new_for_http());
        }

        router
    }

    /// Serve until `shutdown_signal` resolves
    pub async fn start_with_shutdown(
        &self,
        shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let router = self.build_router();
        let addr = self.config.bind_address;

        tracing::info!(bind_address = %addr, "Starting trigger server");

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindError(e.to_string()))?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ServerError::ServeError(e.to_string()))?;

        tracing::info!("Trigger server stopped");
        Ok(())
    }

    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            bind_address: self.config.bind_address,
            cors_enabled: self.config.enable_cors,
            request_logging_enabled: self.config.enable_request_logging,
            secret_configured: self.config.has_secret(),
        }
    }
}

/// Startup banner contents
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub bind_address: SocketAddr,
    pub cors_enabled: bool,
    pub request_logging_enabled: bool,
    pub secret_configured: bool,
}

impl ServerInfo {
    pub fn display(&self) -> String {
        format!(
            "Trigger Server\n\
             {:-<40}\n\
             Bind Address: {}\n\
             CORS: {}\n\
             Request Logging: {}\n\
             Cron Secret: {}",
            "",
            self.bind_address,
            if self.cors_enabled { "enabled" } else { "disabled" },
            if self.request_logging_enabled { "enabled" } else { "disabled" },
            if self.secret_configured { "configured" } else { "missing" }
        )
    }
}

// ============================================================================
// Server Errors
// ============================================================================

/// Failures starting or running the trigger server
#[derive(Debug, Clone)]
pub enum ServerError {
    /// Rejected `ServerConfig`
    ConfigError(String),

    BindError(String),

    /// `axum::serve` returned an error
    ServeError(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfigError(msg) => write!(f, "Invalid server configuration: {}", msg),
            Self::BindError(msg) => write!(f, "Failed to bind trigger server: {}", msg),
            Self::ServeError(msg) => write!(f, "Trigger server failed: {}", msg),
        }
    }
}

impl std::error::Error for ServerError {}

// ============================================================================
// Tests
// ============================================================================
