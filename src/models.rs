// Core data structures for thumbwheel campaigns

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::scheduler::cadence::Cadence;

/// Maximum number of variants a campaign may rotate through (platform cap)
pub const MAX_VARIANTS: usize = 10;

/// A scheduled thumbnail rotation for one external video
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub owner: String,           // Account the campaign belongs to
    pub target_resource: String, // External asset id (e.g. a video id)
    pub variants: Vec<String>,   // Ordered image locators
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub cadence: Cadence,
    pub current_index: usize,
    pub last_rotated_at: Option<DateTime<Utc>>,
    pub next_due_at: DateTime<Utc>,
    pub finalized: bool,
}

impl Campaign {
    /// Index of the variant that the next rotation publishes
    pub fn next_index(&self) -> usize {
        if self.variants.is_empty() {
            return 0;
        }
        (self.current_index + 1) % self.variants.len()
    }

    /// Locator of the variant that the next rotation publishes
    pub fn next_variant(&self) -> Option<&str> {
        self.variants.get(self.next_index()).map(String::as_str)
    }

    /// Locator currently live on the target resource
    pub fn current_variant(&self) -> Option<&str> {
        self.variants.get(self.current_index).map(String::as_str)
    }

    /// Whether the rotation window has closed at `now`
    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        self.window_end <= now
    }

    /// Re-check the structural invariants of a stored campaign
    pub fn check_invariants(&self) -> Result<(), CampaignError> {
        check_variants(&self.variants)?;
        check_window(self.window_start, self.window_end)?;
        self.cadence.validate().map_err(CampaignError::InvalidCadence)?;
        if self.current_index >= self.variants.len() {
            return Err(CampaignError::IndexOutOfRange {
                index: self.current_index,
                len: self.variants.len(),
            });
        }
        Ok(())
    }
}

/// Input used to create a campaign
///
/// Every field has exactly one canonical name; request-level aliasing is
/// the caller's concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewCampaign {
    pub owner: String,
    pub target_resource: String,
    pub variants: Vec<String>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub cadence: Cadence,
}

impl NewCampaign {
    /// Validate all creation-time invariants
    pub fn validate(&self) -> Result<(), CampaignError> {
        if self.owner.trim().is_empty() {
            return Err(CampaignError::MissingField("owner"));
        }
        if self.target_resource.trim().is_empty() {
            return Err(CampaignError::MissingField("target_resource"));
        }
        check_variants(&self.variants)?;
        check_window(self.window_start, self.window_end)?;
        self.cadence.validate().map_err(CampaignError::InvalidCadence)?;
        Ok(())
    }

    /// Build a campaign with a fresh id
    pub fn into_campaign(self) -> Result<Campaign, CampaignError> {
        self.into_campaign_with_id(Uuid::new_v4())
    }

    /// Build a campaign with lifecycle defaults
    ///
    /// Window instants are truncated to milliseconds, the precision the
    /// store persists, so conditional writes compare equal values.
    pub fn into_campaign_with_id(self, id: Uuid) -> Result<Campaign, CampaignError> {
        self.validate()?;
        let window_start = truncate_to_millis(self.window_start);
        let window_end = truncate_to_millis(self.window_end);
        check_window(window_start, window_end)?;

        Ok(Campaign {
            id,
            owner: self.owner,
            target_resource: self.target_resource,
            variants: self.variants,
            window_start,
            window_end,
            cadence: self.cadence,
            current_index: 0,
            last_rotated_at: None,
            next_due_at: window_start,
            finalized: false,
        })
    }
}

/// Metrics returned by the analytics platform for one report row
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsRow {
    pub views: u64,
    pub estimated_minutes_watched: f64,
    pub average_view_duration: f64,
    pub likes: u64,
    pub comments: u64,
}

impl MetricsRow {
    /// Aggregate several report rows into one
    ///
    /// Counters are summed; the average view duration is weighted by views.
    pub fn sum(rows: &[MetricsRow]) -> MetricsRow {
        let views: u64 = rows.iter().map(|r| r.views).sum();
        let weighted: f64 = rows
            .iter()
            .map(|r| r.average_view_duration * r.views as f64)
            .sum();

        MetricsRow {
            views,
            estimated_minutes_watched: rows.iter().map(|r| r.estimated_minutes_watched).sum(),
            average_view_duration: if views == 0 {
                0.0
            } else {
                weighted / views as f64
            },
            likes: rows.iter().map(|r| r.likes).sum(),
            comments: rows.iter().map(|r| r.comments).sum(),
        }
    }
}

/// Performance of one variant, written once after a campaign ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub campaign_id: Uuid,
    pub owner: String,
    pub target_resource: String,
    pub variant_locator: String,
    pub metrics: MetricsRow,
    pub collected_at: DateTime<Utc>,
}

impl PerformanceRecord {
    /// Build the record for one variant of a finalized campaign
    pub fn for_variant(
        campaign: &Campaign,
        locator: &str,
        metrics: MetricsRow,
        collected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            campaign_id: campaign.id,
            owner: campaign.owner.clone(),
            target_resource: campaign.target_resource.clone(),
            variant_locator: locator.to_string(),
            metrics,
            collected_at,
        }
    }
}

/// Audit entry for one successful publish
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationMeta {
    pub campaign_id: Uuid,
    pub variant_index: usize,
    pub variant_locator: String,
    pub mime_type: String,
    pub byte_len: usize,
    pub digest: String, // SHA256 of the published bytes
    pub published_at: DateTime<Utc>,
}

/// Conditional pointer advance submitted to the store
///
/// Applied only if the stored row still has `expected_index`,
/// `expected_next_due_at` and is not finalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationCommit {
    pub id: Uuid,
    pub expected_index: usize,
    pub expected_next_due_at: DateTime<Utc>,
    pub new_index: usize,
    pub rotated_at: DateTime<Utc>,
    pub new_next_due_at: DateTime<Utc>,
}

/// Hex-encoded SHA256 of a payload
pub fn content_digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Drop sub-millisecond precision from an instant
pub fn truncate_to_millis(instant: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(instant.timestamp_millis())
        .single()
        .unwrap_or(instant)
}

/// Campaign validation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CampaignError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Campaign needs at least one variant")]
    NoVariants,

    #[error("Too many variants: {count} (max {max})")]
    TooManyVariants { count: usize, max: usize },

    #[error("Invalid variant locator '{locator}': {reason}")]
    InvalidLocator { locator: String, reason: String },

    #[error("Window end {end} must be after window start {start}")]
    InvalidWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("Invalid cadence: {0}")]
    InvalidCadence(String),

    #[error("Current index {index} out of range for {len} variants")]
    IndexOutOfRange { index: usize, len: usize },
}

fn check_variants(variants: &[String]) -> Result<(), CampaignError> {
    if variants.is_empty() {
        return Err(CampaignError::NoVariants);
    }
    if variants.len() > MAX_VARIANTS {
        return Err(CampaignError::TooManyVariants {
            count: variants.len(),
            max: MAX_VARIANTS,
        });
    }

    for locator in variants {
        let parsed = Url::parse(locator).map_err(|e| CampaignError::InvalidLocator {
            locator: locator.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(CampaignError::InvalidLocator {
                locator: locator.clone(),
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }
    }

    Ok(())
}

fn check_window(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), CampaignError> {
    if end <= start {
        return Err(CampaignError::InvalidWindow { start, end });
    }
    Ok(())
}
