//! Scheduler driver
//!
//! Owns the tick loop and the in-process run state. One tick selects the due
//! campaigns, dispatches each to its own task (paced, bounded by a
//! semaphore) and waits for all of them before returning a report.
//!
//! Mutual exclusion per campaign comes from [`SchedulerState`]: a campaign
//! with an execution in flight is skipped by any overlapping tick, whether
//! that tick came from the timer loop or the HTTP trigger. Across processes
//! the store's conditional write is the only guard.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::committer::{CommitOutcome, StateCommitter};
use super::error::{SchedulerError, SchedulerResult};
use super::executor::RotationExecutor;
use super::finalizer::{AnalyticsFinalizer, FinalizeReport};
use super::selector::{is_due, DueSetSelector};
use crate::metrics;
use crate::models::Campaign;
use crate::storage::{SharedCampaignStore, StoreResult};

// ============================================================================
// Driver Configuration
// ============================================================================

/// Settings for the tick loop
#[derive(Debug, Clone, PartialEq)]
pub struct DriverConfig {
    /// Interval between rotation ticks
    pub tick_interval: Duration,

    /// Interval between finalizer runs
    pub finalizer_interval: Duration,

    /// Delay between consecutive dispatches within one tick
    pub pacing: Duration,

    /// Maximum campaigns executing at once
    pub max_concurrent: usize,

    /// Upper bound on campaigns dispatched per tick
    pub max_campaigns_per_tick: Option<usize>,

    /// Bound on each store call made by the driver
    pub store_timeout: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            finalizer_interval: Duration::from_secs(3600),
            pacing: Duration::from_millis(500),
            max_concurrent: 4,
            max_campaigns_per_tick: None,
            store_timeout: Duration::from_secs(10),
        }
    }
}

impl DriverConfig {
    /// Validate the configuration
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.tick_interval.is_zero() {
            return Err(SchedulerError::config(
                "tick_interval",
                "must be greater than 0",
            ));
        }
        if self.finalizer_interval.is_zero() {
            return Err(SchedulerError::config(
                "finalizer_interval",
                "must be greater than 0",
            ));
        }
        if self.max_concurrent == 0 {
            return Err(SchedulerError::config(
                "max_concurrent",
                "must be at least 1",
            ));
        }
        if self.store_timeout.is_zero() {
            return Err(SchedulerError::config(
                "store_timeout",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Scheduler State
// ============================================================================

#[derive(Debug, Default)]
struct StateInner {
    running: HashMap<Uuid, DateTime<Utc>>,
    cancelled: HashSet<Uuid>,
}

/// Per-campaign run state owned by the driver
///
/// A campaign is Running while a [`RunningGuard`] for it is alive and Idle
/// otherwise. Cancelled campaigns are skipped by every tick until resumed.
#[derive(Debug, Default)]
pub struct SchedulerState {
    inner: Mutex<StateInner>,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StateInner> {
        // Entries stay consistent even if a holder panicked
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark a campaign Running; `None` if it already is
    pub fn try_acquire(self: &Arc<Self>, id: Uuid, now: DateTime<Utc>) -> Option<RunningGuard> {
        let mut inner = self.lock();
        if inner.running.contains_key(&id) {
            return None;
        }
        inner.running.insert(id, now);
        Some(RunningGuard {
            state: Arc::clone(self),
            id,
        })
    }

    pub fn is_running(&self, id: Uuid) -> bool {
        self.lock().running.contains_key(&id)
    }

    /// Running campaigns with the instant their execution started
    pub fn running(&self) -> Vec<(Uuid, DateTime<Utc>)> {
        let mut running: Vec<_> = self.lock().running.iter().map(|(k, v)| (*k, *v)).collect();
        running.sort_by_key(|(id, since)| (*since, *id));
        running
    }

    pub fn running_count(&self) -> usize {
        self.lock().running.len()
    }

    /// Suppress future ticks for one campaign; returns `false` if it already was
    pub fn cancel(&self, id: Uuid) -> bool {
        self.lock().cancelled.insert(id)
    }

    /// Re-enable a cancelled campaign; returns `false` if it was not cancelled
    pub fn resume(&self, id: Uuid) -> bool {
        self.lock().cancelled.remove(&id)
    }

    pub fn is_cancelled(&self, id: Uuid) -> bool {
        self.lock().cancelled.contains(&id)
    }

    pub fn cancelled(&self) -> Vec<Uuid> {
        let mut ids: Vec<_> = self.lock().cancelled.iter().copied().collect();
        ids.sort();
        ids
    }

    /// Drop every entry for a campaign that will never run again
    pub fn forget(&self, id: Uuid) {
        let mut inner = self.lock();
        inner.cancelled.remove(&id);
    }

    fn release(&self, id: Uuid) {
        self.lock().running.remove(&id);
    }
}

/// Marks a campaign Idle again when dropped
#[derive(Debug)]
pub struct RunningGuard {
    state: Arc<SchedulerState>,
    id: Uuid,
}

impl RunningGuard {
    pub fn campaign_id(&self) -> Uuid {
        self.id
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.state.release(self.id);
    }
}

// ============================================================================
// Tick Report
// ============================================================================

/// What happened to one campaign during a tick
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CampaignOutcome {
    /// Published and committed
    Rotated {
        variant_index: usize,
        attempts: u32,
        next_due_at: DateTime<Utc>,
        metadata_recorded: bool,
    },

    /// Soft failure; the campaign stays due for the next tick
    Failed {
        kind: String,
        reason: String,
        attempts: u32,
        backoff_ms: Vec<u64>,
    },

    /// Changed since selection, either before execution or at commit
    Stale,

    /// Another execution for this campaign is in flight
    SkippedRunning,

    /// Suppressed by a cancel request
    Cancelled,

    /// Over the per-tick dispatch limit; picked up by a later tick
    Deferred,
}

/// Result for one campaign
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignResult {
    pub campaign_id: Uuid,
    #[serde(flatten)]
    pub outcome: CampaignOutcome,
}

/// Aggregate outcome of one tick
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub due: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub stale: usize,
    pub skipped_running: usize,
    pub cancelled: usize,
    pub deferred: usize,
    pub results: Vec<CampaignResult>,
}

impl TickReport {
    fn push(&mut self, campaign_id: Uuid, outcome: CampaignOutcome) {
        let label = match &outcome {
            CampaignOutcome::Rotated { .. } => {
                self.succeeded += 1;
                "rotated"
            }
            CampaignOutcome::Failed { .. } => {
                self.failed += 1;
                "failed"
            }
            CampaignOutcome::Stale => {
                self.stale += 1;
                "stale"
            }
            CampaignOutcome::SkippedRunning => {
                self.skipped_running += 1;
                "skipped_running"
            }
            CampaignOutcome::Cancelled => {
                self.cancelled += 1;
                "cancelled"
            }
            CampaignOutcome::Deferred => {
                self.deferred += 1;
                "deferred"
            }
        };
        metrics::record_rotation(label);
        self.results.push(CampaignResult {
            campaign_id,
            outcome,
        });
    }

    /// Outcome recorded for one campaign
    pub fn outcome_for(&self, campaign_id: Uuid) -> Option<&CampaignOutcome> {
        self.results
            .iter()
            .find(|r| r.campaign_id == campaign_id)
            .map(|r| &r.outcome)
    }
}

/// Snapshot of the driver for status endpoints
#[derive(Debug, Clone, Serialize)]
pub struct DriverStatus {
    pub loop_running: bool,
    pub running: Vec<RunningEntry>,
    pub cancelled: Vec<Uuid>,
    pub finalizer_cooldown_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunningEntry {
    pub campaign_id: Uuid,
    pub since: DateTime<Utc>,
}

// ============================================================================
// Scheduler Driver
// ============================================================================

struct DriverInner {
    store: SharedCampaignStore,
    selector: DueSetSelector,
    executor: RotationExecutor,
    committer: StateCommitter,
    finalizer: Option<Arc<AnalyticsFinalizer>>,
    state: Arc<SchedulerState>,
    semaphore: Arc<Semaphore>,
    config: DriverConfig,
    loop_running: AtomicBool,
}

/// Runs rotation ticks and finalizer passes
///
/// Cheap to clone; clones share the same run state.
#[derive(Clone)]
pub struct SchedulerDriver {
    inner: Arc<DriverInner>,
}

impl SchedulerDriver {
    pub fn new(
        store: SharedCampaignStore,
        executor: RotationExecutor,
        config: DriverConfig,
    ) -> SchedulerResult<Self> {
        Self::build(store, executor, None, config)
    }

    /// Create a driver that also runs the finalizer on its own interval
    pub fn with_finalizer(
        store: SharedCampaignStore,
        executor: RotationExecutor,
        finalizer: Arc<AnalyticsFinalizer>,
        config: DriverConfig,
    ) -> SchedulerResult<Self> {
        Self::build(store, executor, Some(finalizer), config)
    }

    fn build(
        store: SharedCampaignStore,
        executor: RotationExecutor,
        finalizer: Option<Arc<AnalyticsFinalizer>>,
        config: DriverConfig,
    ) -> SchedulerResult<Self> {
        config.validate()?;

        Ok(Self {
            inner: Arc::new(DriverInner {
                selector: DueSetSelector::new(Arc::clone(&store)),
                committer: StateCommitter::new(Arc::clone(&store)),
                store,
                executor,
                finalizer,
                state: Arc::new(SchedulerState::new()),
                semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
                config,
                loop_running: AtomicBool::new(false),
            }),
        })
    }

    pub fn state(&self) -> &Arc<SchedulerState> {
        &self.inner.state
    }

    pub fn config(&self) -> &DriverConfig {
        &self.inner.config
    }

    pub fn has_finalizer(&self) -> bool {
        self.inner.finalizer.is_some()
    }

    /// Suppress future ticks for one campaign
    pub fn cancel(&self, id: Uuid) -> bool {
        let changed = self.inner.state.cancel(id);
        if changed {
            info!(campaign_id = %id, "Campaign cancelled");
        }
        changed
    }

    /// Re-enable a cancelled campaign
    pub fn resume(&self, id: Uuid) -> bool {
        let changed = self.inner.state.resume(id);
        if changed {
            info!(campaign_id = %id, "Campaign resumed");
        }
        changed
    }

    pub fn status(&self) -> DriverStatus {
        DriverStatus {
            loop_running: self.inner.loop_running.load(Ordering::SeqCst),
            running: self
                .inner
                .state
                .running()
                .into_iter()
                .map(|(campaign_id, since)| RunningEntry { campaign_id, since })
                .collect(),
            cancelled: self.inner.state.cancelled(),
            finalizer_cooldown_until: self
                .inner
                .finalizer
                .as_ref()
                .and_then(|f| f.cooldown_until()),
        }
    }

    /// Run one rotation tick
    pub async fn tick(&self, now: DateTime<Utc>) -> SchedulerResult<TickReport> {
        self.tick_with_limit(now, None).await
    }

    /// Run one rotation tick, dispatching at most `limit` campaigns
    ///
    /// `limit` overrides the configured per-tick maximum. Fails only when
    /// the due set cannot be read; per-campaign failures are in the report.
    pub async fn tick_with_limit(
        &self,
        now: DateTime<Utc>,
        limit: Option<usize>,
    ) -> SchedulerResult<TickReport> {
        let started = tokio::time::Instant::now();
        let inner = &self.inner;

        let due = within(
            inner.config.store_timeout,
            "list_due",
            inner.selector.select(now),
        )
        .await?;

        let mut report = TickReport {
            due: due.len(),
            ..Default::default()
        };
        let cap = limit.or(inner.config.max_campaigns_per_tick);
        let mut tasks = JoinSet::new();
        let mut dispatched = 0usize;

        for campaign in due {
            let id = campaign.id;

            if inner.state.is_cancelled(id) {
                debug!(campaign_id = %id, "Skipping cancelled campaign");
                report.push(id, CampaignOutcome::Cancelled);
                continue;
            }

            if cap.is_some_and(|max| dispatched >= max) {
                report.push(id, CampaignOutcome::Deferred);
                continue;
            }

            let Some(guard) = inner.state.try_acquire(id, now) else {
                warn!(campaign_id = %id, "Campaign still running from an earlier tick, skipping");
                report.push(id, CampaignOutcome::SkippedRunning);
                continue;
            };

            if dispatched > 0 && !inner.config.pacing.is_zero() {
                tokio::time::sleep(inner.config.pacing).await;
            }

            let permit = Arc::clone(&inner.semaphore)
                .acquire_owned()
                .await
                .map_err(|_| SchedulerError::driver_failed("concurrency semaphore closed"))?;

            dispatched += 1;
            metrics::set_running_campaigns(inner.state.running_count());

            let driver = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let _guard = guard;
                let outcome = driver.run_one(campaign, now).await;
                (id, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, outcome)) => report.push(id, outcome),
                Err(e) => {
                    // The guard was dropped during unwinding, so the
                    // campaign is Idle again and stays due
                    error!(error = %e, "Campaign execution task failed");
                    report.failed += 1;
                }
            }
        }
        metrics::set_running_campaigns(inner.state.running_count());

        let elapsed = started.elapsed();
        metrics::observe_tick_duration(elapsed.as_secs_f64());
        info!(
            due = report.due,
            succeeded = report.succeeded,
            failed = report.failed,
            stale = report.stale,
            skipped_running = report.skipped_running,
            cancelled = report.cancelled,
            deferred = report.deferred,
            elapsed_ms = elapsed.as_millis() as u64,
            "Tick complete"
        );

        Ok(report)
    }

    /// Re-validate, execute and commit one campaign
    async fn run_one(&self, selected: Campaign, now: DateTime<Utc>) -> CampaignOutcome {
        let inner = &self.inner;
        let id = selected.id;

        let fresh = match within(
            inner.config.store_timeout,
            "get_campaign",
            inner.store.get_campaign(id),
        )
        .await
        {
            Ok(Some(campaign)) => campaign,
            Ok(None) => return CampaignOutcome::Stale,
            Err(e) => return store_failure(id, e),
        };

        if !is_due(&fresh, now)
            || fresh.current_index != selected.current_index
            || fresh.next_due_at != selected.next_due_at
        {
            debug!(campaign_id = %id, "Campaign changed since selection, skipping");
            return CampaignOutcome::Stale;
        }

        let published = match inner.executor.execute(&fresh).await {
            Ok(published) => published,
            Err(failure) => {
                return CampaignOutcome::Failed {
                    kind: failure.kind.label().to_string(),
                    reason: failure.kind.to_string(),
                    attempts: failure.attempts,
                    backoff_ms: failure
                        .backoff
                        .iter()
                        .map(|d| d.as_millis() as u64)
                        .collect(),
                };
            }
        };

        let commit = tokio::time::timeout(
            inner.config.store_timeout,
            inner.committer.commit(&fresh, &published, now),
        )
        .await;

        match commit {
            Ok(Ok(CommitOutcome::Committed {
                new_index,
                next_due_at,
                metadata_recorded,
            })) => CampaignOutcome::Rotated {
                variant_index: new_index,
                attempts: published.attempts,
                next_due_at,
                metadata_recorded,
            },
            Ok(Ok(CommitOutcome::Stale)) => CampaignOutcome::Stale,
            Ok(Err(e)) => store_failure(id, e),
            Err(_) => store_failure(
                id,
                SchedulerError::timeout("commit_rotation", inner.config.store_timeout.as_secs()),
            ),
        }
    }

    /// Run the finalizer once and drop run state for finalized campaigns
    pub async fn run_finalizer(&self, now: DateTime<Utc>) -> SchedulerResult<FinalizeReport> {
        let Some(finalizer) = &self.inner.finalizer else {
            return Err(SchedulerError::config(
                "finalizer",
                "no analytics finalizer configured",
            ));
        };

        let report = finalizer.run(now).await?;
        for id in &report.finalized {
            self.inner.state.forget(*id);
        }
        Ok(report)
    }

    /// Spawn the timer loop
    ///
    /// Both intervals fire immediately once, then at their configured
    /// period. A tick in progress when `stop` is called runs to completion.
    pub fn start(&self) -> SchedulerResult<DriverHandle> {
        if self.inner.loop_running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let driver = self.clone();

        let join = tokio::spawn(async move {
            let config = driver.inner.config.clone();
            let has_finalizer = driver.inner.finalizer.is_some();

            let mut rotation = tokio::time::interval(config.tick_interval);
            rotation.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut finalize = tokio::time::interval(config.finalizer_interval);
            finalize.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                tick_interval_secs = config.tick_interval.as_secs(),
                finalizer = has_finalizer,
                "Scheduler driver started"
            );

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = rotation.tick() => {
                        if let Err(e) = driver.tick(Utc::now()).await {
                            error!(error = %e, recoverable = e.is_recoverable(), "Rotation tick failed");
                        }
                    }
                    _ = finalize.tick(), if has_finalizer => {
                        match driver.run_finalizer(Utc::now()).await {
                            Ok(report) => debug!(
                                finalized = report.finalized.len(),
                                suspended = report.suspended,
                                "Finalizer pass complete"
                            ),
                            Err(e) => error!(error = %e, "Finalizer pass failed"),
                        }
                    }
                }
            }

            driver.inner.loop_running.store(false, Ordering::SeqCst);
            info!("Scheduler driver stopped");
        });

        Ok(DriverHandle {
            shutdown: shutdown_tx,
            join,
        })
    }
}

/// Handle to a running driver loop
pub struct DriverHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl DriverHandle {
    /// Signal shutdown and wait for the loop to exit
    pub async fn stop(self) -> SchedulerResult<()> {
        let _ = self.shutdown.send(true);
        self.join
            .await
            .map_err(|e| SchedulerError::driver_failed(e.to_string()))
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Await a store call with a timeout
async fn within<T>(
    limit: Duration,
    operation: &str,
    fut: impl Future<Output = StoreResult<T>>,
) -> SchedulerResult<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(SchedulerError::store(operation, e)),
        Err(_) => Err(SchedulerError::timeout(operation, limit.as_secs())),
    }
}

fn store_failure(id: Uuid, err: SchedulerError) -> CampaignOutcome {
    warn!(campaign_id = %id, error = %err, "Store call failed during execution");
    CampaignOutcome::Failed {
        kind: "store".to_string(),
        reason: err.to_string(),
        attempts: 0,
        backoff_ms: Vec::new(),
    }
}
