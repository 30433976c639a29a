//! External persistence seams for the usage governor.
//!
//! Every entity the governor touches lives in a hosted database; this module
//! defines the record shapes and the async trait seams the governor is
//! constructed against. Production uses the Supabase PostgREST client in
//! [`supabase`]; tests substitute the in-memory store in [`memory`].
//!
//! ## Design
//! - One trait per table family (profiles, counters, stats, settings)
//! - All mutation is read-then-write; no store-side locking is assumed
//! - Expired counter rows are reclaimed by the sweep job, never inline

pub mod memory;
pub mod supabase;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub use memory::MemoryStore;
pub use supabase::{SupabaseConfig, SupabaseStore};

/// Errors surfaced by a backing store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Transport-level failure (connect, timeout, TLS).
    #[error("store transport: {0}")]
    Transport(#[from] reqwest::Error),
    /// The store answered with a non-success status.
    #[error("store rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    /// Response body did not decode into the expected shape.
    #[error("store decode: {0}")]
    Decode(#[from] serde_json::Error),
    /// Anything else (misconfiguration, missing row where one is required).
    #[error("{0}")]
    Other(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Subscription status carried on an account profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Inactive,
}

/// Per-account daily-cap override set by support staff.
///
/// While unexpired it replaces the tier's default daily cap outright; it is
/// never additive. Expired overrides are ignored, not deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomDailyLimit {
    pub limit: u32,
    pub expires_at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// An account as persisted in the profile store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountProfile {
    /// Opaque stable identifier (hash of the extension's bearer token).
    pub account_id: String,
    /// Raw tier name as stored; unrecognized names resolve to the free tier.
    pub tier: String,
    pub status: SubscriptionStatus,
    /// Billable operations performed in the current monthly cycle.
    pub api_calls_this_month: u32,
    /// When the monthly counter last rolled over to zero.
    pub last_api_call_reset: DateTime<Utc>,
    pub custom_daily_limit: Option<CustomDailyLimit>,
}

impl AccountProfile {
    /// Fresh free-tier profile, created lazily on first authenticated access.
    pub fn new(account_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            account_id: account_id.to_string(),
            tier: "free".to_string(),
            status: SubscriptionStatus::Active,
            api_calls_this_month: 0,
            last_api_call_reset: now,
            custom_daily_limit: None,
        }
    }
}

/// Calendar-aligned window kind for a usage counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Minute,
    Day,
}

impl WindowKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WindowKind::Minute => "minute",
            WindowKind::Day => "day",
        }
    }
}

/// A fixed-window usage counter row, keyed by (account, kind, window key).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageCounter {
    pub account_id: String,
    pub window: WindowKind,
    /// Deterministic UTC wall-clock key, e.g. `202608301204` or `20260830`.
    pub window_key: String,
    pub count: u32,
    /// Start of the next window boundary; the sweep deletes rows past this.
    pub expires_at: DateTime<Utc>,
}

/// Service-wide accumulator for one UTC calendar day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalDailyStat {
    pub date: NaiveDate,
    pub operation_count: u64,
    pub estimated_cost_usd: f64,
}

impl GlobalDailyStat {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            operation_count: 0,
            estimated_cost_usd: 0.0,
        }
    }
}

/// The emergency brake: one global flag checked before every governed call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KillSwitch {
    pub active: bool,
    pub reason: Option<String>,
}

/// Account profile persistence.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Fetch the profile for `account_id`, creating a fresh free-tier row on
    /// first access.
    async fn get_or_create(&self, account_id: &str) -> StoreResult<AccountProfile>;

    /// Persist the full profile row (last write wins).
    async fn update(&self, profile: &AccountProfile) -> StoreResult<()>;
}

/// Fixed-window counter persistence.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn get(
        &self,
        account_id: &str,
        window: WindowKind,
        window_key: &str,
    ) -> StoreResult<Option<UsageCounter>>;

    /// Insert or overwrite the counter row (read-modify-write; callers accept
    /// the lost-update race under concurrent load).
    async fn put(&self, counter: &UsageCounter) -> StoreResult<()>;

    /// Delete every counter whose expiry precedes `cutoff`. Returns the
    /// number of rows reclaimed.
    async fn delete_expired_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;
}

/// Global per-day stats persistence.
#[async_trait]
pub trait StatsStore: Send + Sync {
    async fn get_day(&self, date: NaiveDate) -> StoreResult<Option<GlobalDailyStat>>;

    async fn upsert_day(&self, stat: &GlobalDailyStat) -> StoreResult<()>;
}

/// Global settings persistence (currently just the kill switch).
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Read the kill switch; a missing row means "not active".
    async fn kill_switch(&self) -> StoreResult<KillSwitch>;

    async fn set_kill_switch(&self, active: bool, reason: Option<&str>) -> StoreResult<()>;
}
