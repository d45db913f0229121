//! Application wiring
//!
//! Builds the store, platform clients, executor, finalizer and driver from
//! a [`Config`]. The binary and the integration tests both go through here.

use std::sync::Arc;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::platform::{HttpMetricsClient, HttpPublishClient, HttpVariantFetcher};
use crate::scheduler::driver::SchedulerDriver;
use crate::scheduler::executor::RotationExecutor;
use crate::scheduler::finalizer::AnalyticsFinalizer;
use crate::server::TriggerServer;
use crate::storage::{
    CampaignStore, PerformanceStore, RefreshTokenSource, SharedCampaignStore,
    SharedPerformanceStore, SqliteCampaignStore,
};

/// Fully wired scheduler
pub struct App {
    pub config: Config,
    pub campaigns: SharedCampaignStore,
    pub performance: SharedPerformanceStore,
    pub tokens: Arc<dyn RefreshTokenSource>,
    pub driver: SchedulerDriver,
}

impl App {
    /// Open the SQLite store named in the configuration and wire everything to it
    pub fn from_config(config: Config) -> Result<Self> {
        let store = Arc::new(SqliteCampaignStore::open(&config.store.sqlite_path)?);
        Self::with_store(config, store)
    }

    /// Wire everything to an already opened store
    pub fn with_store<S>(config: Config, store: Arc<S>) -> Result<Self>
    where
        S: CampaignStore + PerformanceStore + RefreshTokenSource + 'static,
    {
        config
            .validate()
            .map_err(|e| Error::config(format!("{e:#}")))?;

        let campaigns: SharedCampaignStore = store.clone();
        let performance: SharedPerformanceStore = store.clone();
        let tokens: Arc<dyn RefreshTokenSource> = store;

        let client = config.platform.http_client()?;
        let credentials = config
            .platform
            .credential_provider(client.clone(), Arc::clone(&tokens));

        let executor = RotationExecutor::new(
            Arc::new(HttpVariantFetcher::new(client.clone())),
            Arc::new(HttpPublishClient::new(
                client.clone(),
                &config.platform.upload_base,
                Arc::clone(&credentials),
                config.platform.publish_requests_per_second,
            )),
            config.executor_config(),
        );

        let driver = if config.finalizer.enabled {
            let finalizer = Arc::new(AnalyticsFinalizer::new(
                Arc::clone(&campaigns),
                Arc::clone(&performance),
                Arc::new(HttpMetricsClient::new(
                    client,
                    &config.platform.analytics_base,
                    credentials,
                )),
                config.finalizer_config(),
            ));
            SchedulerDriver::with_finalizer(
                Arc::clone(&campaigns),
                executor,
                finalizer,
                config.driver_config(),
            )?
        } else {
            SchedulerDriver::new(Arc::clone(&campaigns), executor, config.driver_config())?
        };

        tracing::info!(
            oauth = config.platform.oauth_enabled(),
            finalizer = config.finalizer.enabled,
            "Scheduler wired"
        );

        Ok(Self {
            config,
            campaigns,
            performance,
            tokens,
            driver,
        })
    }

    /// Trigger server sharing this app's driver
    pub fn trigger_server(&self) -> Result<TriggerServer> {
        Ok(TriggerServer::new(
            self.config.server.clone(),
            self.driver.clone(),
            Arc::clone(&self.campaigns),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryCampaignStore;

    #[test]
    fn test_wires_with_memory_store() {
        let app = App::with_store(Config::default(), Arc::new(MemoryCampaignStore::new())).unwrap();
        assert!(app.driver.has_finalizer());
        assert!(app.trigger_server().is_ok());
    }

    #[test]
    fn test_finalizer_can_be_disabled() {
        let mut config = Config::default();
        config.finalizer.enabled = false;
        let app = App::with_store(config, Arc::new(MemoryCampaignStore::new())).unwrap();
        assert!(!app.driver.has_finalizer());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = Config::default();
        config.driver.max_concurrent = 0;
        let result = App::with_store(config, Arc::new(MemoryCampaignStore::new()));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_opens_sqlite_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.store.sqlite_path = dir.path().join("nested").join("app.db");

        let app = App::from_config(config).unwrap();
        assert!(!app.driver.status().loop_running);
    }
}
