//! thumbwheel - Thumbnail rotation scheduler
//!
//! Cycles a video's thumbnail through a campaign's candidate images on a
//! fixed cadence, then collects per-variant analytics once the campaign
//! window has closed.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and settings
//! - [`models`] - Campaigns, rotation commits and performance records
//! - [`storage`] - Campaign persistence (SQLite, in-memory)
//! - [`scheduler`] - Due-set selection, rotation, commit, driver, finalizer
//! - [`platform`] - HTTP clients for the video platform
//! - [`server`] - Cron trigger HTTP endpoints
//! - [`metrics`] - Prometheus metrics
//! - [`utils`] - Retry and error helpers
//!
//! # Example
//!
//! ```no_run
//! use thumbwheel::app::App;
//! use thumbwheel::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let app = App::from_config(config)?;
//!     let report = app.driver.tick(chrono::Utc::now()).await?;
//!     println!("{} campaigns rotated", report.succeeded);
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod platform;
pub mod scheduler;
pub mod server;
pub mod storage;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::app::App;
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::models::{Campaign, NewCampaign, PerformanceRecord};
    pub use crate::scheduler::{Cadence, CadenceUnit, SchedulerDriver, TickReport};
    pub use crate::storage::{CampaignStore, MemoryCampaignStore, SqliteCampaignStore};
}

// Direct re-exports for convenience
pub use models::{Campaign, NewCampaign};
