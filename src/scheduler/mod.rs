//! Campaign rotation scheduling
//!
//! This module cycles a target's thumbnail through a campaign's variants on
//! a fixed cadence and finalizes analytics once the campaign window closes.
//!
//! # Overview
//!
//! Each tick runs the same pipeline for every campaign that is due:
//!
//! ```text
//!   ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//!   │   Due-Set    │───▶│   Rotation   │───▶│    State     │
//!   │   Selector   │    │   Executor   │    │  Committer   │
//!   └──────────────┘    └──────────────┘    └──────┬───────┘
//!          ▲                   │                   │
//!          │            fetch, validate,     conditional write
//!          │            publish (retry)            │
//!          │                                       ▼
//!   ┌──────┴───────┐                        ┌──────────────┐
//!   │  Scheduler   │                        │   Campaign   │
//!   │    Driver    │───── finalizer ───────▶│    Store     │
//!   └──────────────┘                        └──────────────┘
//! ```
//!
//! The executor never writes to the store. The committer advances the
//! pointer only if the campaign row is unchanged since it was read, so a
//! rotation is applied at most once even with several processes ticking.
//!
//! # Modules
//!
//! - [`cadence`] - Rotation period and next-due arithmetic
//! - [`selector`] - Due-set selection
//! - [`executor`] - Fetch, validate and publish with bounded retry
//! - [`committer`] - Conditional pointer advance and rotation metadata
//! - [`driver`] - Tick loop, pacing, per-campaign exclusion and cancellation
//! - [`finalizer`] - One-shot analytics collection for ended campaigns
//!
//! # Example
//!
//! ```ignore
//! use thumbwheel::scheduler::{DriverConfig, SchedulerDriver};
//!
//! let driver = SchedulerDriver::new(store, executor, DriverConfig::default())?;
//! let report = driver.tick(chrono::Utc::now()).await?;
//! println!("{} rotated, {} failed", report.succeeded, report.failed);
//! ```

pub mod cadence;
pub mod committer;
pub mod driver;
pub mod error;
pub mod executor;
pub mod finalizer;
pub mod selector;

// Re-export main types
pub use cadence::{next_due_after, Cadence, CadenceUnit};
pub use committer::{CommitOutcome, StateCommitter};
pub use driver::{
    CampaignOutcome, CampaignResult, DriverConfig, DriverHandle, DriverStatus, RunningGuard,
    SchedulerDriver, SchedulerState, TickReport,
};
pub use error::{SchedulerError, SchedulerResult};
pub use executor::{
    ExecutorConfig, FailureKind, PublishClient, PublishRequest, PublishedVariant,
    RotationExecutor, RotationFailure, ValidationError, ValidatorConfig, VariantFetcher,
    VariantPayload, VariantValidator,
};
pub use finalizer::{
    AnalyticsFinalizer, FinalizeFailure, FinalizeReport, FinalizerConfig, MetricsClient,
};
pub use selector::{is_due, DueSetSelector};
