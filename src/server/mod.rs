//! HTTP trigger for the scheduler
//!
//! Lets an external cron service drive rotations instead of, or in addition
//! to, the in-process timer loop.
//!
//! # Routes
//!
//! ```text
//! GET  /api/health                  open
//! GET  /metrics                     open, Prometheus text
//! POST /api/cron/rotate             run one tick, optional {"limit": n}
//! POST /api/cron/finalize           run the analytics finalizer once
//! GET  /api/status                  running and cancelled campaigns
//! POST /api/campaigns/{id}/cancel   suppress future ticks for a campaign
//! POST /api/campaigns/{id}/resume   re-enable a cancelled campaign
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use thumbwheel::server::{ServerConfig, TriggerServer};
//!
//! let config = ServerConfig::builder().cron_secret("s3cret").build()?;
//! let server = TriggerServer::new(config, driver, store)?;
//! server.start_with_shutdown(shutdown_signal()).await?;
//! ```

pub mod api;
pub mod config;
pub mod server;

// Re-export main types
pub use api::{create_router, CRON_SECRET_HEADER};
pub use config::{ConfigError, ServerConfig};
pub use server::{AppState, ServerError, TriggerServer};
