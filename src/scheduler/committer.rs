//! State transition commit
//!
//! The only place that advances a campaign's pointer. The write is
//! conditional on the state the campaign was read in, so two schedulers
//! racing on the same row produce exactly one advance.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::cadence::next_due_after;
use super::error::{SchedulerError, SchedulerResult};
use super::executor::PublishedVariant;
use crate::models::{truncate_to_millis, Campaign, RotationCommit, RotationMeta};
use crate::storage::{SharedCampaignStore, StoreResult};

/// Result of submitting a rotation to the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Pointer advanced; `metadata_recorded` is false when the rotation
    /// log write failed afterwards
    Committed {
        new_index: usize,
        next_due_at: DateTime<Utc>,
        metadata_recorded: bool,
    },

    /// The row changed since it was read; nothing was written
    Stale,
}

/// Applies successful publishes to the store
#[derive(Clone)]
pub struct StateCommitter {
    store: SharedCampaignStore,
}

impl StateCommitter {
    pub fn new(store: SharedCampaignStore) -> Self {
        Self { store }
    }

    /// Build the conditional write for advancing to `next_index`
    ///
    /// The new due instant is anchored to the previous one, not to `now`.
    pub fn plan(
        campaign: &Campaign,
        next_index: usize,
        now: DateTime<Utc>,
    ) -> SchedulerResult<RotationCommit> {
        Ok(RotationCommit {
            id: campaign.id,
            expected_index: campaign.current_index,
            expected_next_due_at: campaign.next_due_at,
            new_index: next_index,
            rotated_at: truncate_to_millis(now),
            new_next_due_at: next_due_after(campaign.next_due_at, campaign.cadence)?,
        })
    }

    /// Commit a published variant, then record its metadata
    ///
    /// A failed metadata write is reported in the outcome but never undoes
    /// the pointer advance.
    pub async fn commit(
        &self,
        campaign: &Campaign,
        published: &PublishedVariant,
        now: DateTime<Utc>,
    ) -> SchedulerResult<CommitOutcome> {
        let commit = Self::plan(campaign, published.variant_index, now)?;

        let applied = self
            .store
            .commit_rotation(&commit)
            .await
            .map_err(|e| SchedulerError::store("commit_rotation", e))?;

        if !applied {
            debug!(
                campaign_id = %campaign.id,
                expected_index = commit.expected_index,
                "Stale commit rejected, campaign changed since it was read"
            );
            return Ok(CommitOutcome::Stale);
        }

        let metadata_recorded = match self.record_meta(published, commit.rotated_at).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    campaign_id = %campaign.id,
                    error = %e,
                    "Rotation committed but metadata write failed"
                );
                false
            }
        };

        info!(
            campaign_id = %campaign.id,
            new_index = commit.new_index,
            next_due_at = %commit.new_next_due_at,
            "Rotation committed"
        );

        Ok(CommitOutcome::Committed {
            new_index: commit.new_index,
            next_due_at: commit.new_next_due_at,
            metadata_recorded,
        })
    }

    async fn record_meta(
        &self,
        published: &PublishedVariant,
        published_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let meta = RotationMeta {
            campaign_id: published.campaign_id,
            variant_index: published.variant_index,
            variant_locator: published.locator.clone(),
            mime_type: published.mime_type.clone(),
            byte_len: published.byte_len,
            digest: published.digest.clone(),
            published_at,
        };
        self.store.record_rotation_meta(&meta).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewCampaign;
    use crate::scheduler::cadence::{Cadence, CadenceUnit};
    use crate::storage::{CampaignStore, MemoryCampaignStore};
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 1, 8, 0, 0).unwrap()
    }

    fn campaign() -> Campaign {
        NewCampaign {
            owner: "o".to_string(),
            target_resource: "v".to_string(),
            variants: vec![
                "https://cdn.test/a.png".to_string(),
                "https://cdn.test/b.png".to_string(),
            ],
            window_start: start(),
            window_end: start() + Duration::days(2),
            cadence: Cadence::new(30, CadenceUnit::Minutes),
        }
        .into_campaign()
        .unwrap()
    }

    fn published(c: &Campaign) -> PublishedVariant {
        PublishedVariant {
            campaign_id: c.id,
            variant_index: c.next_index(),
            locator: c.variants[c.next_index()].clone(),
            mime_type: "image/png".to_string(),
            byte_len: 10,
            digest: "ab".repeat(32),
            width: 1280,
            height: 720,
            attempts: 1,
        }
    }

    #[test]
    fn test_plan_is_anchored_to_previous_due() {
        let c = campaign();
        let late = start() + Duration::minutes(7);
        let plan = StateCommitter::plan(&c, 1, late).unwrap();

        assert_eq!(plan.expected_index, 0);
        assert_eq!(plan.expected_next_due_at, start());
        assert_eq!(plan.new_index, 1);
        assert_eq!(plan.rotated_at, late);
        assert_eq!(plan.new_next_due_at, start() + Duration::minutes(30));
    }

    #[tokio::test]
    async fn test_commit_then_stale() {
        let store = Arc::new(MemoryCampaignStore::new());
        let c = campaign();
        store.insert_campaign(&c).await.unwrap();
        let committer = StateCommitter::new(store.clone());

        let outcome = committer.commit(&c, &published(&c), start()).await.unwrap();
        assert_eq!(
            outcome,
            CommitOutcome::Committed {
                new_index: 1,
                next_due_at: start() + Duration::minutes(30),
                metadata_recorded: true,
            }
        );
        assert_eq!(store.rotation_log(c.id).await.unwrap().len(), 1);

        // Same snapshot again loses the race
        let again = committer.commit(&c, &published(&c), start()).await.unwrap();
        assert_eq!(again, CommitOutcome::Stale);
        assert_eq!(store.rotation_log(c.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_metadata_failure_keeps_commit() {
        let store = Arc::new(MemoryCampaignStore::new());
        let c = campaign();
        store.insert_campaign(&c).await.unwrap();
        store.set_fail_rotation_meta(true);

        let outcome = StateCommitter::new(store.clone())
            .commit(&c, &published(&c), start())
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            CommitOutcome::Committed {
                metadata_recorded: false,
                ..
            }
        ));
        let stored = store.get_campaign(c.id).await.unwrap().unwrap();
        assert_eq!(stored.current_index, 1);
    }

    #[tokio::test]
    async fn test_finalized_campaign_is_stale() {
        let store = Arc::new(MemoryCampaignStore::new());
        let c = campaign();
        store.insert_campaign(&c).await.unwrap();
        store.mark_finalized(c.id).await.unwrap();

        let outcome = StateCommitter::new(store.clone())
            .commit(&c, &published(&c), start())
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Stale);
    }
}
