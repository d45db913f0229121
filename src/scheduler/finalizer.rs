//! Analytics finalization
//!
//! Runs on its own cadence, separate from rotation ticks. For every campaign
//! whose window has closed it collects metrics once, writes one performance
//! record per variant and flips the terminal `finalized` flag. The flag is
//! the idempotency gate: a finalized campaign is never listed again.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{SchedulerError, SchedulerResult};
use crate::metrics;
use crate::models::{Campaign, MetricsRow, PerformanceRecord};
use crate::storage::{SharedCampaignStore, SharedPerformanceStore, StoreResult};
use crate::utils::error::MetricsError;

/// Source of per-video analytics
#[async_trait]
pub trait MetricsClient: Send + Sync {
    /// Report rows for a resource over the campaign window
    async fn collect(
        &self,
        owner: &str,
        target_resource: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<MetricsRow>, MetricsError>;
}

/// Finalizer settings
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizerConfig {
    /// Pause after a quota signal before any further work
    pub cooldown: Duration,

    /// Delay between consecutive metrics calls
    pub pacing: Duration,

    /// Upper bound on campaigns handled per run
    pub max_per_run: Option<usize>,

    /// How long after `window_end` an empty report is accepted as final.
    /// `None` keeps retrying until the platform returns rows.
    pub max_empty_age: Option<Duration>,
}

impl Default for FinalizerConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(600),
            pacing: Duration::from_secs(3),
            max_per_run: None,
            max_empty_age: None,
        }
    }
}

/// Campaign that stays unfinalized until the next run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalizeFailure {
    pub campaign_id: Uuid,
    pub reason: String,
}

/// Summary of one finalizer run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FinalizeReport {
    /// Campaigns past their window and not yet finalized
    pub candidates: usize,

    /// Campaigns this run finalized
    pub finalized: Vec<Uuid>,

    /// Campaigns another worker finalized first
    pub already_finalized: usize,

    pub records_written: usize,

    pub failed: Vec<FinalizeFailure>,

    /// Stopped by a quota signal, or still cooling down from one
    pub suspended: bool,

    pub cooldown_until: Option<DateTime<Utc>>,

    /// Another run was in progress; this one did nothing
    pub busy: bool,
}

/// Writes performance records for ended campaigns and marks them finalized
pub struct AnalyticsFinalizer {
    store: SharedCampaignStore,
    performance: SharedPerformanceStore,
    metrics_client: Arc<dyn MetricsClient>,
    config: FinalizerConfig,
    cooldown_until: Mutex<Option<DateTime<Utc>>>,
    run_lock: tokio::sync::Mutex<()>,
}

impl AnalyticsFinalizer {
    pub fn new(
        store: SharedCampaignStore,
        performance: SharedPerformanceStore,
        metrics_client: Arc<dyn MetricsClient>,
        config: FinalizerConfig,
    ) -> Self {
        Self {
            store,
            performance,
            metrics_client,
            config,
            cooldown_until: Mutex::new(None),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// End of the current quota cooldown, if any
    pub fn cooldown_until(&self) -> Option<DateTime<Utc>> {
        *self
            .cooldown_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_cooldown(&self, until: Option<DateTime<Utc>>) {
        *self
            .cooldown_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = until;
    }

    /// Finalize every campaign whose window closed at or before `now`
    pub async fn run(&self, now: DateTime<Utc>) -> SchedulerResult<FinalizeReport> {
        let mut report = FinalizeReport::default();

        if let Some(until) = self.cooldown_until() {
            if now < until {
                debug!(cooldown_until = %until, "Finalizer cooling down after quota signal");
                report.suspended = true;
                report.cooldown_until = Some(until);
                return Ok(report);
            }
            self.set_cooldown(None);
        }

        let Ok(_guard) = self.run_lock.try_lock() else {
            debug!("Finalizer run already in progress");
            report.busy = true;
            return Ok(report);
        };

        let mut ended = self
            .store
            .list_ended_unfinalized(now)
            .await
            .map_err(|e| SchedulerError::store("list_ended_unfinalized", e))?;
        report.candidates = ended.len();
        if let Some(max) = self.config.max_per_run {
            ended.truncate(max);
        }

        for (i, campaign) in ended.iter().enumerate() {
            if i > 0 && !self.config.pacing.is_zero() {
                tokio::time::sleep(self.config.pacing).await;
            }

            let rows = match self
                .metrics_client
                .collect(
                    &campaign.owner,
                    &campaign.target_resource,
                    campaign.window_start,
                    campaign.window_end,
                )
                .await
            {
                Ok(rows) => rows,
                Err(MetricsError::QuotaExceeded) => {
                    let until = now
                        + TimeDelta::from_std(self.config.cooldown)
                            .unwrap_or_else(|_| TimeDelta::minutes(10));
                    self.set_cooldown(Some(until));
                    metrics::record_finalizer_suspension();
                    warn!(
                        campaign_id = %campaign.id,
                        cooldown_until = %until,
                        "Analytics quota exceeded, suspending finalizer"
                    );
                    report.suspended = true;
                    report.cooldown_until = Some(until);
                    break;
                }
                Err(e) => {
                    warn!(campaign_id = %campaign.id, error = %e, "Metrics collection failed");
                    report.failed.push(FinalizeFailure {
                        campaign_id: campaign.id,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            if rows.is_empty() {
                if !self.empty_report_is_final(campaign, now) {
                    info!(
                        campaign_id = %campaign.id,
                        target = %campaign.target_resource,
                        "No analytics rows yet, retrying on the next run"
                    );
                    report.failed.push(FinalizeFailure {
                        campaign_id: campaign.id,
                        reason: "analytics report has no rows yet".to_string(),
                    });
                    continue;
                }
                warn!(
                    campaign_id = %campaign.id,
                    target = %campaign.target_resource,
                    "Analytics still empty past max_empty_age, finalizing without performance records"
                );
            }

            match self.write_records(campaign, &rows, now).await {
                Ok(written) => report.records_written += written,
                Err(e) => {
                    warn!(campaign_id = %campaign.id, error = %e, "Performance write failed");
                    report.failed.push(FinalizeFailure {
                        campaign_id: campaign.id,
                        reason: e.to_string(),
                    });
                    continue;
                }
            }

            match self.store.mark_finalized(campaign.id).await {
                Ok(true) => {
                    metrics::record_finalized();
                    info!(
                        campaign_id = %campaign.id,
                        variants = campaign.variants.len(),
                        "Campaign finalized"
                    );
                    report.finalized.push(campaign.id);
                }
                Ok(false) => {
                    debug!(campaign_id = %campaign.id, "Campaign already finalized");
                    report.already_finalized += 1;
                }
                Err(e) => {
                    warn!(campaign_id = %campaign.id, error = %e, "Failed to mark campaign finalized");
                    report.failed.push(FinalizeFailure {
                        campaign_id: campaign.id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    fn empty_report_is_final(&self, campaign: &Campaign, now: DateTime<Utc>) -> bool {
        let Some(max_age) = self.config.max_empty_age else {
            return false;
        };
        match TimeDelta::from_std(max_age) {
            Ok(max_age) => now - campaign.window_end >= max_age,
            Err(_) => false,
        }
    }

    /// Insert one record per variant that has none yet
    async fn write_records(
        &self,
        campaign: &Campaign,
        rows: &[MetricsRow],
        now: DateTime<Utc>,
    ) -> StoreResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let total = MetricsRow::sum(rows);
        let mut written = 0;

        for locator in &campaign.variants {
            if self.performance.has_performance(campaign.id, locator).await? {
                continue;
            }
            let record = PerformanceRecord::for_variant(campaign, locator, total, now);
            if self.performance.insert_performance(&record).await? {
                written += 1;
            }
        }

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewCampaign;
    use crate::scheduler::cadence::{Cadence, CadenceUnit};
    use crate::storage::{CampaignStore, MemoryCampaignStore, PerformanceStore};
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedMetrics {
        script: Mutex<VecDeque<Result<Vec<MetricsRow>, MetricsError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedMetrics {
        fn new(script: Vec<Result<Vec<MetricsRow>, MetricsError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl MetricsClient for ScriptedMetrics {
        async fn collect(
            &self,
            _owner: &str,
            _target: &str,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<Vec<MetricsRow>, MetricsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(vec![row()]))
        }
    }

    fn row() -> MetricsRow {
        MetricsRow {
            views: 120,
            estimated_minutes_watched: 60.0,
            average_view_duration: 30.0,
            likes: 4,
            comments: 1,
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap()
    }

    fn ended_campaign() -> Campaign {
        NewCampaign {
            owner: "o".to_string(),
            target_resource: "v".to_string(),
            variants: vec![
                "https://cdn.test/a.png".to_string(),
                "https://cdn.test/b.png".to_string(),
            ],
            window_start: start(),
            window_end: start() + TimeDelta::days(1),
            cadence: Cadence::new(1, CadenceUnit::Hours),
        }
        .into_campaign()
        .unwrap()
    }

    fn finalizer(
        store: Arc<MemoryCampaignStore>,
        metrics: Arc<ScriptedMetrics>,
    ) -> AnalyticsFinalizer {
        AnalyticsFinalizer::new(
            store.clone(),
            store,
            metrics,
            FinalizerConfig {
                pacing: Duration::ZERO,
                ..Default::default()
            },
        )
    }

    fn after_end() -> DateTime<Utc> {
        start() + TimeDelta::days(2)
    }

    #[tokio::test]
    async fn test_finalizes_once_with_one_record_per_variant() {
        let store = Arc::new(MemoryCampaignStore::new());
        let c = ended_campaign();
        store.insert_campaign(&c).await.unwrap();
        let metrics = Arc::new(ScriptedMetrics::new(vec![]));
        let finalizer = finalizer(store.clone(), metrics.clone());

        let report = finalizer.run(after_end()).await.unwrap();
        assert_eq!(report.finalized, vec![c.id]);
        assert_eq!(report.records_written, 2);
        assert_eq!(store.performance_for(c.id).await.unwrap().len(), 2);

        // Second run finds nothing to do
        let report = finalizer.run(after_end()).await.unwrap();
        assert_eq!(report.candidates, 0);
        assert_eq!(metrics.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.performance_for(c.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_active_campaign_untouched() {
        let store = Arc::new(MemoryCampaignStore::new());
        let c = ended_campaign();
        store.insert_campaign(&c).await.unwrap();
        let finalizer = finalizer(store.clone(), Arc::new(ScriptedMetrics::new(vec![])));

        let report = finalizer.run(start() + TimeDelta::hours(1)).await.unwrap();
        assert_eq!(report.candidates, 0);
        assert!(!store.get_campaign(c.id).await.unwrap().unwrap().finalized);
    }

    #[tokio::test]
    async fn test_quota_sets_cooldown() {
        let store = Arc::new(MemoryCampaignStore::new());
        let a = ended_campaign();
        let b = ended_campaign();
        store.insert_campaign(&a).await.unwrap();
        store.insert_campaign(&b).await.unwrap();
        let metrics = Arc::new(ScriptedMetrics::new(vec![Err(MetricsError::QuotaExceeded)]));
        let finalizer = finalizer(store.clone(), metrics.clone());

        let now = after_end();
        let report = finalizer.run(now).await.unwrap();
        assert!(report.suspended);
        assert!(report.finalized.is_empty());
        assert_eq!(report.cooldown_until, Some(now + TimeDelta::minutes(10)));
        assert_eq!(metrics.calls.load(Ordering::SeqCst), 1);

        // Still cooling down: no metrics calls at all
        let report = finalizer.run(now + TimeDelta::minutes(5)).await.unwrap();
        assert!(report.suspended);
        assert_eq!(metrics.calls.load(Ordering::SeqCst), 1);

        // Cooldown over: both campaigns finalize
        let report = finalizer.run(now + TimeDelta::minutes(11)).await.unwrap();
        assert!(!report.suspended);
        assert_eq!(report.finalized.len(), 2);
        assert!(finalizer.cooldown_until().is_none());
    }

    #[tokio::test]
    async fn test_empty_report_retried_until_rows_arrive() {
        let store = Arc::new(MemoryCampaignStore::new());
        let c = ended_campaign();
        store.insert_campaign(&c).await.unwrap();
        let metrics = Arc::new(ScriptedMetrics::new(vec![Ok(vec![]), Ok(vec![row()])]));
        let finalizer = finalizer(store.clone(), metrics.clone());

        let first = finalizer.run(after_end()).await.unwrap();
        assert!(first.finalized.is_empty());
        assert_eq!(first.failed.len(), 1);
        assert_eq!(first.failed[0].campaign_id, c.id);
        assert!(!store.get_campaign(c.id).await.unwrap().unwrap().finalized);

        // Analytics lag: rows show up a day later
        let second = finalizer.run(after_end() + TimeDelta::days(1)).await.unwrap();
        assert_eq!(second.candidates, 1);
        assert_eq!(second.finalized, vec![c.id]);
        assert_eq!(second.records_written, 2);
        assert_eq!(metrics.calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.performance_for(c.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_report_final_after_max_empty_age() {
        let store = Arc::new(MemoryCampaignStore::new());
        let c = ended_campaign();
        store.insert_campaign(&c).await.unwrap();
        let finalizer = AnalyticsFinalizer::new(
            store.clone(),
            store.clone(),
            Arc::new(ScriptedMetrics::new(vec![Ok(vec![]), Ok(vec![])])),
            FinalizerConfig {
                pacing: Duration::ZERO,
                max_empty_age: Some(Duration::from_secs(3 * 24 * 3600)),
                ..Default::default()
            },
        );

        // window_end + 1 day: still inside the grace period
        let report = finalizer.run(after_end()).await.unwrap();
        assert!(report.finalized.is_empty());

        let report = finalizer.run(after_end() + TimeDelta::days(3)).await.unwrap();
        assert_eq!(report.finalized, vec![c.id]);
        assert_eq!(report.records_written, 0);
        assert!(store.performance_for(c.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_other_errors_leave_campaign_for_next_run() {
        let store = Arc::new(MemoryCampaignStore::new());
        let c = ended_campaign();
        store.insert_campaign(&c).await.unwrap();
        let metrics = Arc::new(ScriptedMetrics::new(vec![Err(MetricsError::Status {
            status: 500,
            body: "backend error".to_string(),
        })]));
        let finalizer = finalizer(store.clone(), metrics);

        let report = finalizer.run(after_end()).await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(!store.get_campaign(c.id).await.unwrap().unwrap().finalized);

        let report = finalizer.run(after_end()).await.unwrap();
        assert_eq!(report.finalized, vec![c.id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_between_calls() {
        let store = Arc::new(MemoryCampaignStore::new());
        for _ in 0..3 {
            store.insert_campaign(&ended_campaign()).await.unwrap();
        }
        let finalizer = AnalyticsFinalizer::new(
            store.clone(),
            store.clone(),
            Arc::new(ScriptedMetrics::new(vec![])),
            FinalizerConfig::default(),
        );

        let started = tokio::time::Instant::now();
        let report = finalizer.run(after_end()).await.unwrap();
        assert_eq!(report.finalized.len(), 3);
        assert!(started.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_store_outage_is_driver_error() {
        let store = Arc::new(MemoryCampaignStore::new());
        store.set_unavailable(true);
        let finalizer = finalizer(store, Arc::new(ScriptedMetrics::new(vec![])));

        let err = finalizer.run(after_end()).await.unwrap_err();
        assert!(err.is_recoverable());
    }
}
