//! Due-set selection
//!
//! Read-only: the selector never mutates campaign state.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::models::Campaign;
use crate::storage::{SharedCampaignStore, StoreResult};

/// Whether a campaign should rotate at `now`
///
/// Not finalized, its next scheduled instant has passed, and its window has
/// not closed. Campaigns past `window_end` belong to the finalizer.
pub fn is_due(campaign: &Campaign, now: DateTime<Utc>) -> bool {
    !campaign.finalized && campaign.next_due_at <= now && campaign.window_end >= now
}

/// Picks the campaigns that must rotate on this tick
#[derive(Clone)]
pub struct DueSetSelector {
    store: SharedCampaignStore,
}

impl DueSetSelector {
    /// Create a selector over a campaign store
    pub fn new(store: SharedCampaignStore) -> Self {
        Self { store }
    }

    /// Due campaigns at `now`, oldest `next_due_at` first
    ///
    /// The store query does the filtering; every row is checked again here
    /// so an ineligible campaign never reaches the executor.
    pub async fn select(&self, now: DateTime<Utc>) -> StoreResult<Vec<Campaign>> {
        let rows = self.store.list_due(now).await?;
        let fetched = rows.len();

        let mut due: Vec<Campaign> = rows.into_iter().filter(|c| is_due(c, now)).collect();
        if due.len() != fetched {
            warn!(
                fetched = fetched,
                kept = due.len(),
                "Store returned campaigns that are not due"
            );
        }

        due.sort_by(|a, b| (a.next_due_at, a.id).cmp(&(b.next_due_at, b.id)));
        Ok(due)
    }
}
