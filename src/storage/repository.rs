//! Repository Pattern for Campaign Storage
//!
//! Trait-based store abstractions that keep the scheduler independent of
//! the storage backend:
//! - `CampaignStore`: campaign rows, the conditional pointer advance and the
//!   terminal `finalized` flag
//! - `PerformanceStore`: per-variant performance records written once a
//!   campaign ends
//! - `RefreshTokenSource`: stored OAuth refresh tokens per owner
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Scheduler                             │
//! │        (selector, committer, driver, finalizer)             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Repository Traits                         │
//! │   CampaignStore, PerformanceStore, RefreshTokenSource       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                ┌─────────────┴─────────────┐
//!                ▼                           ▼
//!       ┌─────────────────┐         ┌─────────────────┐
//!       │     SQLite      │         │    In-Memory    │
//!       │  Implementation │         │ Implementation  │
//!       └─────────────────┘         └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use thumbwheel::storage::{CampaignStore, SqliteCampaignStore};
//!
//! let store = SqliteCampaignStore::open("thumbwheel.db")?;
//! let due = store.list_due(chrono::Utc::now()).await?;
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{StoreError, StoreResult};
use crate::models::{Campaign, MetricsRow, PerformanceRecord, RotationCommit, RotationMeta};
use crate::scheduler::cadence::{Cadence, CadenceUnit};

// ============================================================================
// Repository Traits
// ============================================================================

/// Campaign query and mutation contract
///
/// The only mutations are the conditional pointer advance
/// (`commit_rotation`) and the terminal flag (`mark_finalized`). Campaigns
/// are never deleted.
#[async_trait]
pub trait CampaignStore: Send + Sync {
    /// Insert a new campaign
    async fn insert_campaign(&self, campaign: &Campaign) -> StoreResult<()>;

    /// Get campaign by ID
    async fn get_campaign(&self, id: Uuid) -> StoreResult<Option<Campaign>>;

    /// List all campaigns, oldest window first
    async fn list_campaigns(&self) -> StoreResult<Vec<Campaign>>;

    /// Campaigns with `finalized = false`, `next_due_at <= now` and
    /// `window_end >= now`, ordered by `next_due_at`
    async fn list_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<Campaign>>;

    /// Campaigns with `finalized = false` and `window_end <= now`
    async fn list_ended_unfinalized(&self, now: DateTime<Utc>) -> StoreResult<Vec<Campaign>>;

    /// Apply a rotation if the row still matches the expected state
    ///
    /// Returns `false` when the row changed since it was read, or is
    /// finalized, or does not exist.
    async fn commit_rotation(&self, commit: &RotationCommit) -> StoreResult<bool>;

    /// Set the terminal flag; returns `false` when it was already set
    async fn mark_finalized(&self, id: Uuid) -> StoreResult<bool>;

    /// Append a publish record to the rotation log
    async fn record_rotation_meta(&self, meta: &RotationMeta) -> StoreResult<()>;

    /// Rotation log of one campaign, oldest first
    async fn rotation_log(&self, id: Uuid) -> StoreResult<Vec<RotationMeta>>;
}

/// Performance records written by the finalizer
#[async_trait]
pub trait PerformanceStore: Send + Sync {
    /// Whether a record exists for this (campaign, variant) pair
    async fn has_performance(&self, campaign_id: Uuid, locator: &str) -> StoreResult<bool>;

    /// Insert a record; returns `false` if the pair already has one
    async fn insert_performance(&self, record: &PerformanceRecord) -> StoreResult<bool>;

    /// All records of one campaign
    async fn performance_for(&self, campaign_id: Uuid) -> StoreResult<Vec<PerformanceRecord>>;
}

/// Stored OAuth refresh tokens
#[async_trait]
pub trait RefreshTokenSource: Send + Sync {
    /// Refresh token for an owner, if one is stored
    async fn refresh_token(&self, owner: &str) -> StoreResult<Option<String>>;

    /// Store or replace an owner's refresh token
    async fn set_refresh_token(&self, owner: &str, token: &str) -> StoreResult<()>;
}

/// Thread-safe shared store handles
pub type SharedCampaignStore = Arc<dyn CampaignStore>;
pub type SharedPerformanceStore = Arc<dyn PerformanceStore>;

// ============================================================================
// SQLite Implementation
// ============================================================================

/// SQLite implementation of all store traits
///
/// Uses `Mutex` to ensure thread-safety for the SQLite connection.
pub struct SqliteCampaignStore {
    conn: Mutex<Connection>,
}

impl SqliteCampaignStore {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        // WAL lets the trigger endpoint and CLI read while the driver writes
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;",
        )?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;

        tracing::info!(path = %path.display(), "SQLite campaign store initialized");
        Ok(store)
    }

    /// Create in-memory store (for testing)
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;
        Ok(store)
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Create database schema
    fn create_schema(&self) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
                CREATE TABLE IF NOT EXISTS campaigns (
                    id TEXT PRIMARY KEY,
                    owner TEXT NOT NULL,
                    target_resource TEXT NOT NULL,
                    variants TEXT NOT NULL,
                    window_start INTEGER NOT NULL,
                    window_end INTEGER NOT NULL,
                    cadence_value INTEGER NOT NULL,
                    cadence_unit TEXT NOT NULL,
                    current_index INTEGER NOT NULL DEFAULT 0,
                    last_rotated_at INTEGER,
                    next_due_at INTEGER NOT NULL,
                    finalized INTEGER NOT NULL DEFAULT 0
                );

                CREATE INDEX IF NOT EXISTS idx_campaigns_due
                    ON campaigns(finalized, next_due_at);

                CREATE INDEX IF NOT EXISTS idx_campaigns_window_end
                    ON campaigns(finalized, window_end);

                CREATE TABLE IF NOT EXISTS rotation_log (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    campaign_id TEXT NOT NULL,
                    variant_index INTEGER NOT NULL,
                    variant_locator TEXT NOT NULL,
                    mime_type TEXT NOT NULL,
                    byte_len INTEGER NOT NULL,
                    digest TEXT NOT NULL,
                    published_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_rotation_log_campaign
                    ON rotation_log(campaign_id);

                CREATE TABLE IF NOT EXISTS performance (
                    campaign_id TEXT NOT NULL,
                    variant_locator TEXT NOT NULL,
                    owner TEXT NOT NULL,
                    target_resource TEXT NOT NULL,
                    views INTEGER NOT NULL,
                    estimated_minutes_watched REAL NOT NULL,
                    average_view_duration REAL NOT NULL,
                    likes INTEGER NOT NULL,
                    comments INTEGER NOT NULL,
                    collected_at INTEGER NOT NULL,
                    UNIQUE(campaign_id, variant_locator)
                );

                CREATE TABLE IF NOT EXISTS owner_credentials (
                    owner TEXT PRIMARY KEY,
                    refresh_token TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                "#,
        )?;

        Ok(())
    }

    fn query_campaigns(
        conn: &Connection,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> StoreResult<Vec<Campaign>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, CampaignRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(CampaignRow::into_campaign).collect()
    }
}

const CAMPAIGN_COLUMNS: &str = "id, owner, target_resource, variants, window_start, window_end, \
     cadence_value, cadence_unit, current_index, last_rotated_at, next_due_at, finalized";

/// Raw campaign row before column decoding
struct CampaignRow {
    id: String,
    owner: String,
    target_resource: String,
    variants: String,
    window_start: i64,
    window_end: i64,
    cadence_value: i64,
    cadence_unit: String,
    current_index: i64,
    last_rotated_at: Option<i64>,
    next_due_at: i64,
    finalized: bool,
}

impl CampaignRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner: row.get(1)?,
            target_resource: row.get(2)?,
            variants: row.get(3)?,
            window_start: row.get(4)?,
            window_end: row.get(5)?,
            cadence_value: row.get(6)?,
            cadence_unit: row.get(7)?,
            current_index: row.get(8)?,
            last_rotated_at: row.get(9)?,
            next_due_at: row.get(10)?,
            finalized: row.get(11)?,
        })
    }

    fn into_campaign(self) -> StoreResult<Campaign> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| StoreError::Corrupt(format!("campaign id '{}': {e}", self.id)))?;
        let unit: CadenceUnit = self
            .cadence_unit
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("campaign {id}: {e}")))?;
        let value = u32::try_from(self.cadence_value)
            .map_err(|_| StoreError::Corrupt(format!("campaign {id}: negative cadence")))?;
        let current_index = usize::try_from(self.current_index)
            .map_err(|_| StoreError::Corrupt(format!("campaign {id}: negative index")))?;

        let campaign = Campaign {
            id,
            owner: self.owner,
            target_resource: self.target_resource,
            variants: serde_json::from_str(&self.variants)?,
            window_start: from_millis(self.window_start)?,
            window_end: from_millis(self.window_end)?,
            cadence: Cadence::new(value, unit),
            current_index,
            last_rotated_at: self.last_rotated_at.map(from_millis).transpose()?,
            next_due_at: from_millis(self.next_due_at)?,
            finalized: self.finalized,
        };
        campaign
            .check_invariants()
            .map_err(|e| StoreError::Corrupt(format!("campaign {id}: {e}")))?;
        Ok(campaign)
    }
}

fn from_millis(ms: i64) -> StoreResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}

#[async_trait]
impl CampaignStore for SqliteCampaignStore {
    async fn insert_campaign(&self, campaign: &Campaign) -> StoreResult<()> {
        let conn = self.lock()?;
        let variants = serde_json::to_string(&campaign.variants)?;

        let result = conn.execute(
            r#"
                INSERT INTO campaigns (id, owner, target_resource, variants, window_start,
                    window_end, cadence_value, cadence_unit, current_index, last_rotated_at,
                    next_due_at, finalized)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
            params![
                campaign.id.to_string(),
                campaign.owner,
                campaign.target_resource,
                variants,
                campaign.window_start.timestamp_millis(),
                campaign.window_end.timestamp_millis(),
                campaign.cadence.value,
                campaign.cadence.unit.id(),
                campaign.current_index as i64,
                campaign.last_rotated_at.map(|t| t.timestamp_millis()),
                campaign.next_due_at.timestamp_millis(),
                campaign.finalized,
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::Duplicate(campaign.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_campaign(&self, id: Uuid) -> StoreResult<Option<Campaign>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?1"),
                params![id.to_string()],
                CampaignRow::from_row,
            )
            .optional()?;

        row.map(CampaignRow::into_campaign).transpose()
    }

    async fn list_campaigns(&self) -> StoreResult<Vec<Campaign>> {
        let conn = self.lock()?;
        Self::query_campaigns(
            &conn,
            &format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns ORDER BY window_start, id"),
            &[],
        )
    }

    async fn list_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<Campaign>> {
        let conn = self.lock()?;
        let now = now.timestamp_millis();
        Self::query_campaigns(
            &conn,
            &format!(
                "SELECT {CAMPAIGN_COLUMNS} FROM campaigns \
                 WHERE finalized = 0 AND next_due_at <= ?1 AND window_end >= ?1 \
                 ORDER BY next_due_at, id"
            ),
            &[&now],
        )
    }

    async fn list_ended_unfinalized(&self, now: DateTime<Utc>) -> StoreResult<Vec<Campaign>> {
        let conn = self.lock()?;
        let now = now.timestamp_millis();
        Self::query_campaigns(
            &conn,
            &format!(
                "SELECT {CAMPAIGN_COLUMNS} FROM campaigns \
                 WHERE finalized = 0 AND window_end <= ?1 \
                 ORDER BY window_end, id"
            ),
            &[&now],
        )
    }

    async fn commit_rotation(&self, commit: &RotationCommit) -> StoreResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            r#"
                UPDATE campaigns
                SET current_index = ?1, last_rotated_at = ?2, next_due_at = ?3
                WHERE id = ?4 AND current_index = ?5 AND next_due_at = ?6 AND finalized = 0
                "#,
            params![
                commit.new_index as i64,
                commit.rotated_at.timestamp_millis(),
                commit.new_next_due_at.timestamp_millis(),
                commit.id.to_string(),
                commit.expected_index as i64,
                commit.expected_next_due_at.timestamp_millis(),
            ],
        )?;

        Ok(changed == 1)
    }

    async fn mark_finalized(&self, id: Uuid) -> StoreResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE campaigns SET finalized = 1 WHERE id = ?1 AND finalized = 0",
            params![id.to_string()],
        )?;

        Ok(changed == 1)
    }

    async fn record_rotation_meta(&self, meta: &RotationMeta) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
                INSERT INTO rotation_log (campaign_id, variant_index, variant_locator,
                    mime_type, byte_len, digest, published_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            params![
                meta.campaign_id.to_string(),
                meta.variant_index as i64,
                meta.variant_locator,
                meta.mime_type,
                meta.byte_len as i64,
                meta.digest,
                meta.published_at.timestamp_millis(),
            ],
        )?;

        Ok(())
    }

    async fn rotation_log(&self, id: Uuid) -> StoreResult<Vec<RotationMeta>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT variant_index, variant_locator, mime_type, byte_len, digest, published_at
             FROM rotation_log WHERE campaign_id = ?1 ORDER BY seq",
        )?;

        let rows = stmt
            .query_map(params![id.to_string()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(index, locator, mime_type, byte_len, digest, published_at)| {
                Ok(RotationMeta {
                    campaign_id: id,
                    variant_index: index as usize,
                    variant_locator: locator,
                    mime_type,
                    byte_len: byte_len as usize,
                    digest,
                    published_at: from_millis(published_at)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl PerformanceStore for SqliteCampaignStore {
    async fn has_performance(&self, campaign_id: Uuid, locator: &str) -> StoreResult<bool> {
        let conn = self.lock()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM performance WHERE campaign_id = ?1 AND variant_locator = ?2)",
            params![campaign_id.to_string(), locator],
            |row| row.get(0),
        )?;

        Ok(exists)
    }

    async fn insert_performance(&self, record: &PerformanceRecord) -> StoreResult<bool> {
        let conn = self.lock()?;
        let m = &record.metrics;
        let inserted = conn.execute(
            r#"
                INSERT OR IGNORE INTO performance (campaign_id, variant_locator, owner,
                    target_resource, views, estimated_minutes_watched, average_view_duration,
                    likes, comments, collected_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
            params![
                record.campaign_id.to_string(),
                record.variant_locator,
                record.owner,
                record.target_resource,
                m.views as i64,
                m.estimated_minutes_watched,
                m.average_view_duration,
                m.likes as i64,
                m.comments as i64,
                record.collected_at.timestamp_millis(),
            ],
        )?;

        Ok(inserted == 1)
    }

    async fn performance_for(&self, campaign_id: Uuid) -> StoreResult<Vec<PerformanceRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT variant_locator, owner, target_resource, views, estimated_minutes_watched,
                    average_view_duration, likes, comments, collected_at
             FROM performance WHERE campaign_id = ?1 ORDER BY rowid",
        )?;

        let rows = stmt
            .query_map(params![campaign_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    MetricsRow {
                        views: row.get::<_, i64>(3)? as u64,
                        estimated_minutes_watched: row.get(4)?,
                        average_view_duration: row.get(5)?,
                        likes: row.get::<_, i64>(6)? as u64,
                        comments: row.get::<_, i64>(7)? as u64,
                    },
                    row.get::<_, i64>(8)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(locator, owner, target, metrics, collected_at)| {
                Ok(PerformanceRecord {
                    campaign_id,
                    owner,
                    target_resource: target,
                    variant_locator: locator,
                    metrics,
                    collected_at: from_millis(collected_at)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl RefreshTokenSource for SqliteCampaignStore {
    async fn refresh_token(&self, owner: &str) -> StoreResult<Option<String>> {
        let conn = self.lock()?;
        let token = conn
            .query_row(
                "SELECT refresh_token FROM owner_credentials WHERE owner = ?1",
                params![owner],
                |row| row.get(0),
            )
            .optional()?;

        Ok(token)
    }

    async fn set_refresh_token(&self, owner: &str, token: &str) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
                INSERT INTO owner_credentials (owner, refresh_token, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(owner) DO UPDATE SET
                    refresh_token = excluded.refresh_token,
                    updated_at = excluded.updated_at
                "#,
            params![owner, token, Utc::now().timestamp_millis()],
        )?;

        Ok(())
    }
}

// ============================================================================
// In-Memory Implementation
// ============================================================================

/// In-memory implementation of all store traits
///
/// Applies the same conditional-write rules as SQLite. Also counts
/// successful mutations and can simulate outages, which tests use to
/// observe that rejected work changed nothing.
pub struct MemoryCampaignStore {
    campaigns: RwLock<HashMap<Uuid, Campaign>>,
    rotation_log: RwLock<Vec<RotationMeta>>,
    performance: RwLock<Vec<PerformanceRecord>>,
    tokens: RwLock<HashMap<String, String>>,
    mutations: AtomicUsize,
    unavailable: AtomicBool,
    fail_rotation_meta: AtomicBool,
}

impl MemoryCampaignStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            campaigns: RwLock::new(HashMap::new()),
            rotation_log: RwLock::new(Vec::new()),
            performance: RwLock::new(Vec::new()),
            tokens: RwLock::new(HashMap::new()),
            mutations: AtomicUsize::new(0),
            unavailable: AtomicBool::new(false),
            fail_rotation_meta: AtomicBool::new(false),
        }
    }

    /// Number of successful mutations (commits, finalizations, inserts)
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Make every call fail with `StoreError::Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make rotation log writes fail
    pub fn set_fail_rotation_meta(&self, fail: bool) {
        self.fail_rotation_meta.store(fail, Ordering::SeqCst);
    }

    /// Get the number of campaigns
    pub fn len(&self) -> usize {
        self.campaigns.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated outage".to_string()));
        }
        Ok(())
    }

    fn bump(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }

    fn filtered(&self, keep: impl Fn(&Campaign) -> bool) -> StoreResult<Vec<Campaign>> {
        self.check_available()?;
        let campaigns = self.campaigns.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(campaigns.values().filter(|c| keep(*c)).cloned().collect())
    }
}

impl Default for MemoryCampaignStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CampaignStore for MemoryCampaignStore {
    async fn insert_campaign(&self, campaign: &Campaign) -> StoreResult<()> {
        self.check_available()?;
        let mut campaigns = self.campaigns.write().map_err(|_| StoreError::LockPoisoned)?;
        if campaigns.contains_key(&campaign.id) {
            return Err(StoreError::Duplicate(campaign.id));
        }
        campaigns.insert(campaign.id, campaign.clone());
        self.bump();
        Ok(())
    }

    async fn get_campaign(&self, id: Uuid) -> StoreResult<Option<Campaign>> {
        self.check_available()?;
        let campaigns = self.campaigns.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(campaigns.get(&id).cloned())
    }

    async fn list_campaigns(&self) -> StoreResult<Vec<Campaign>> {
        let mut all = self.filtered(|_| true)?;
        all.sort_by(|a, b| (a.window_start, a.id).cmp(&(b.window_start, b.id)));
        Ok(all)
    }

    async fn list_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<Campaign>> {
        let mut due =
            self.filtered(|c| !c.finalized && c.next_due_at <= now && c.window_end >= now)?;
        due.sort_by(|a, b| (a.next_due_at, a.id).cmp(&(b.next_due_at, b.id)));
        Ok(due)
    }

    async fn list_ended_unfinalized(&self, now: DateTime<Utc>) -> StoreResult<Vec<Campaign>> {
        let mut ended = self.filtered(|c| !c.finalized && c.has_ended(now))?;
        ended.sort_by(|a, b| (a.window_end, a.id).cmp(&(b.window_end, b.id)));
        Ok(ended)
    }

    async fn commit_rotation(&self, commit: &RotationCommit) -> StoreResult<bool> {
        self.check_available()?;
        let mut campaigns = self.campaigns.write().map_err(|_| StoreError::LockPoisoned)?;

        let Some(campaign) = campaigns.get_mut(&commit.id) else {
            return Ok(false);
        };
        if campaign.finalized
            || campaign.current_index != commit.expected_index
            || campaign.next_due_at != commit.expected_next_due_at
        {
            return Ok(false);
        }

        campaign.current_index = commit.new_index;
        campaign.last_rotated_at = Some(commit.rotated_at);
        campaign.next_due_at = commit.new_next_due_at;
        self.bump();
        Ok(true)
    }

    async fn mark_finalized(&self, id: Uuid) -> StoreResult<bool> {
        self.check_available()?;
        let mut campaigns = self.campaigns.write().map_err(|_| StoreError::LockPoisoned)?;

        match campaigns.get_mut(&id) {
            Some(campaign) if !campaign.finalized => {
                campaign.finalized = true;
                self.bump();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_rotation_meta(&self, meta: &RotationMeta) -> StoreResult<()> {
        self.check_available()?;
        if self.fail_rotation_meta.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("rotation log rejected write".to_string()));
        }
        let mut log = self.rotation_log.write().map_err(|_| StoreError::LockPoisoned)?;
        log.push(meta.clone());
        Ok(())
    }

    async fn rotation_log(&self, id: Uuid) -> StoreResult<Vec<RotationMeta>> {
        self.check_available()?;
        let log = self.rotation_log.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(log.iter().filter(|m| m.campaign_id == id).cloned().collect())
    }
}

#[async_trait]
impl PerformanceStore for MemoryCampaignStore {
    async fn has_performance(&self, campaign_id: Uuid, locator: &str) -> StoreResult<bool> {
        self.check_available()?;
        let records = self.performance.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(records
            .iter()
            .any(|r| r.campaign_id == campaign_id && r.variant_locator == locator))
    }

    async fn insert_performance(&self, record: &PerformanceRecord) -> StoreResult<bool> {
        self.check_available()?;
        let mut records = self.performance.write().map_err(|_| StoreError::LockPoisoned)?;
        if records
            .iter()
            .any(|r| r.campaign_id == record.campaign_id && r.variant_locator == record.variant_locator)
        {
            return Ok(false);
        }
        records.push(record.clone());
        self.bump();
        Ok(true)
    }

    async fn performance_for(&self, campaign_id: Uuid) -> StoreResult<Vec<PerformanceRecord>> {
        self.check_available()?;
        let records = self.performance.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(records
            .iter()
            .filter(|r| r.campaign_id == campaign_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RefreshTokenSource for MemoryCampaignStore {
    async fn refresh_token(&self, owner: &str) -> StoreResult<Option<String>> {
        self.check_available()?;
        let tokens = self.tokens.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(tokens.get(owner).cloned())
    }

    async fn set_refresh_token(&self, owner: &str, token: &str) -> StoreResult<()> {
        self.check_available()?;
        let mut tokens = self.tokens.write().map_err(|_| StoreError::LockPoisoned)?;
        tokens.insert(owner.to_string(), token.to_string());
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{content_digest, NewCampaign};
    use chrono::Duration;

    trait TestStore: CampaignStore + PerformanceStore + RefreshTokenSource {}
    impl<T: CampaignStore + PerformanceStore + RefreshTokenSource> TestStore for T {}

    // Helper to create test stores
    fn create_test_stores() -> Vec<Box<dyn TestStore>> {
        vec![
            Box::new(SqliteCampaignStore::in_memory().unwrap()),
            Box::new(MemoryCampaignStore::new()),
        ]
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn campaign(variants: usize, hours: i64) -> Campaign {
        NewCampaign {
            owner: "owner-1".to_string(),
            target_resource: "video-1".to_string(),
            variants: (0..variants)
                .map(|i| format!("https://cdn.example.com/{i}.png"))
                .collect(),
            window_start: start(),
            window_end: start() + Duration::hours(hours),
            cadence: Cadence::new(1, CadenceUnit::Hours),
        }
        .into_campaign()
        .unwrap()
    }

    fn commit_for(c: &Campaign, now: DateTime<Utc>) -> RotationCommit {
        RotationCommit {
            id: c.id,
            expected_index: c.current_index,
            expected_next_due_at: c.next_due_at,
            new_index: c.next_index(),
            rotated_at: now,
            new_next_due_at: c.next_due_at + Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn test_insert_and_get_roundtrip() {
        for store in create_test_stores() {
            let c = campaign(3, 24);
            store.insert_campaign(&c).await.unwrap();

            let loaded = store.get_campaign(c.id).await.unwrap().unwrap();
            assert_eq!(loaded, c);
            assert!(store.get_campaign(Uuid::new_v4()).await.unwrap().is_none());

            assert!(matches!(
                store.insert_campaign(&c).await,
                Err(StoreError::Duplicate(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_list_due_filters_and_orders() {
        for store in create_test_stores() {
            let mut late = campaign(2, 24);
            late.next_due_at = start() + Duration::minutes(30);
            let early = campaign(2, 24);
            let mut future = campaign(2, 24);
            future.next_due_at = start() + Duration::hours(5);
            let mut done = campaign(2, 24);
            done.finalized = true;
            let ended = campaign(2, 1);

            for c in [&late, &early, &future, &done, &ended] {
                store.insert_campaign(c).await.unwrap();
            }

            let now = start() + Duration::hours(2);
            let due: Vec<Uuid> = store
                .list_due(now)
                .await
                .unwrap()
                .into_iter()
                .map(|c| c.id)
                .collect();
            assert_eq!(due, vec![early.id, late.id]);

            let ended_ids: Vec<Uuid> = store
                .list_ended_unfinalized(now)
                .await
                .unwrap()
                .into_iter()
                .map(|c| c.id)
                .collect();
            assert_eq!(ended_ids, vec![ended.id]);
        }
    }

    #[tokio::test]
    async fn test_commit_rotation_is_conditional() {
        for store in create_test_stores() {
            let c = campaign(3, 24);
            store.insert_campaign(&c).await.unwrap();

            let now = start() + Duration::minutes(1);
            let commit = commit_for(&c, now);
            assert!(store.commit_rotation(&commit).await.unwrap());
            assert!(!store.commit_rotation(&commit).await.unwrap());

            let stored = store.get_campaign(c.id).await.unwrap().unwrap();
            assert_eq!(stored.current_index, 1);
            assert_eq!(stored.last_rotated_at, Some(now));
            assert_eq!(stored.next_due_at, start() + Duration::hours(1));
        }
    }

    #[tokio::test]
    async fn test_single_variant_commit_guarded_by_next_due() {
        for store in create_test_stores() {
            let c = campaign(1, 24);
            store.insert_campaign(&c).await.unwrap();

            let commit = commit_for(&c, start());
            assert_eq!(commit.new_index, 0);
            assert!(store.commit_rotation(&commit).await.unwrap());
            // Same expected index, but next_due_at moved on
            assert!(!store.commit_rotation(&commit).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_commit_rejected_after_finalize() {
        for store in create_test_stores() {
            let c = campaign(2, 24);
            store.insert_campaign(&c).await.unwrap();

            assert!(store.mark_finalized(c.id).await.unwrap());
            assert!(!store.mark_finalized(c.id).await.unwrap());
            assert!(!store.commit_rotation(&commit_for(&c, start())).await.unwrap());
            assert!(!store.mark_finalized(Uuid::new_v4()).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_performance_once_per_variant() {
        for store in create_test_stores() {
            let c = campaign(2, 1);
            let record = PerformanceRecord::for_variant(
                &c,
                &c.variants[0],
                MetricsRow {
                    views: 10,
                    likes: 1,
                    ..Default::default()
                },
                start(),
            );

            assert!(!store.has_performance(c.id, &c.variants[0]).await.unwrap());
            assert!(store.insert_performance(&record).await.unwrap());
            assert!(!store.insert_performance(&record).await.unwrap());
            assert!(store.has_performance(c.id, &c.variants[0]).await.unwrap());

            let records = store.performance_for(c.id).await.unwrap();
            assert_eq!(records, vec![record]);
        }
    }

    #[tokio::test]
    async fn test_rotation_log() {
        for store in create_test_stores() {
            let c = campaign(2, 24);
            let meta = RotationMeta {
                campaign_id: c.id,
                variant_index: 1,
                variant_locator: c.variants[1].clone(),
                mime_type: "image/png".to_string(),
                byte_len: 4,
                digest: content_digest(b"test"),
                published_at: start(),
            };
            store.record_rotation_meta(&meta).await.unwrap();

            assert_eq!(store.rotation_log(c.id).await.unwrap(), vec![meta]);
            assert!(store.rotation_log(Uuid::new_v4()).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_refresh_tokens() {
        for store in create_test_stores() {
            assert!(store.refresh_token("owner-1").await.unwrap().is_none());
            store.set_refresh_token("owner-1", "rt-1").await.unwrap();
            store.set_refresh_token("owner-1", "rt-2").await.unwrap();
            assert_eq!(
                store.refresh_token("owner-1").await.unwrap().as_deref(),
                Some("rt-2")
            );
        }
    }

    #[tokio::test]
    async fn test_sqlite_file_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.db");
        let c = campaign(2, 24);

        {
            let store = SqliteCampaignStore::open(&path).unwrap();
            store.insert_campaign(&c).await.unwrap();
        }

        let store = SqliteCampaignStore::open(&path).unwrap();
        assert_eq!(store.get_campaign(c.id).await.unwrap(), Some(c));
    }

    #[tokio::test]
    async fn test_sqlite_rejects_out_of_range_index() {
        let store = SqliteCampaignStore::in_memory().unwrap();
        let c = campaign(2, 24);
        store.insert_campaign(&c).await.unwrap();

        store
            .lock()
            .unwrap()
            .execute(
                "UPDATE campaigns SET current_index = 7 WHERE id = ?1",
                params![c.id.to_string()],
            )
            .unwrap();

        assert!(matches!(
            store.get_campaign(c.id).await,
            Err(StoreError::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_store_outage_and_counter() {
        let store = MemoryCampaignStore::new();
        let c = campaign(2, 24);
        store.insert_campaign(&c).await.unwrap();
        assert_eq!(store.mutation_count(), 1);
        assert_eq!(store.len(), 1);

        store.set_unavailable(true);
        assert!(matches!(
            store.list_due(start()).await,
            Err(StoreError::Unavailable(_))
        ));

        store.set_unavailable(false);
        assert_eq!(store.list_due(start()).await.unwrap().len(), 1);
    }
}
