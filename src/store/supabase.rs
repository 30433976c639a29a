//! Supabase-backed store implementation.
//!
//! Talks to Supabase's PostgREST API with service-key authentication:
//! - `accounts`: one row per account profile
//! - `usage_counters`: fixed-window counters, unique on
//!   (account_id, window, window_key)
//! - `global_daily_stats`: one row per UTC calendar day
//! - `app_settings`: key/value rows; the kill switch lives under
//!   `emergency_brake`
//!
//! ## Design
//! - HTTP client (reqwest) against PostgREST endpoints
//! - Service-key authentication for server-side operations
//! - Upserts via `Prefer: resolution=merge-duplicates`; no store-side
//!   read-modify-write, so counter increments race under concurrency

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::{
    AccountProfile, CounterStore, GlobalDailyStat, KillSwitch, ProfileStore, SettingsStore,
    StatsStore, StoreError, StoreResult, UsageCounter, WindowKind,
};
use async_trait::async_trait;

/// Settings key under which the kill switch is stored.
const KILL_SWITCH_KEY: &str = "emergency_brake";

/// Supabase connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupabaseConfig {
    /// Supabase project URL (e.g., https://xxxx.supabase.co).
    pub url: String,
    /// Supabase service role key (server-side, never exposed to client).
    pub service_key: String,
}

impl SupabaseConfig {
    /// Load from environment variables.
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_KEY").ok()?;

        if url.is_empty() || service_key.is_empty() {
            return None;
        }

        Some(Self { url, service_key })
    }
}

/// PostgREST row shape for `app_settings`.
#[derive(Debug, Serialize, Deserialize)]
struct SettingRow {
    key: String,
    value: KillSwitch,
}

/// Supabase HTTP client implementing every store seam.
pub struct SupabaseStore {
    config: SupabaseConfig,
    http: reqwest::Client,
}

impl SupabaseStore {
    pub fn new(config: SupabaseConfig) -> StoreResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;

        Ok(Self { config, http })
    }

    /// Build the PostgREST URL for a table.
    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.config.url, table)
    }

    /// Base headers for authenticated requests.
    fn auth_headers(&self) -> Vec<(&str, String)> {
        vec![
            ("apikey", self.config.service_key.clone()),
            (
                "Authorization",
                format!("Bearer {}", self.config.service_key),
            ),
        ]
    }

    fn authed(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (key, value) in self.auth_headers() {
            request = request.header(key, value);
        }
        request
    }

    /// Convert a non-success response into `StoreError::Rejected`.
    async fn check(resp: reqwest::Response) -> StoreResult<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(StoreError::Rejected { status, body })
    }
}

#[async_trait]
impl ProfileStore for SupabaseStore {
    async fn get_or_create(&self, account_id: &str) -> StoreResult<AccountProfile> {
        // Try to fetch the existing row first
        let url = format!(
            "{}?account_id=eq.{}&select=*",
            self.table_url("accounts"),
            account_id
        );

        let resp = Self::check(self.authed(self.http.get(&url)).send().await?).await?;
        let rows: Vec<AccountProfile> = resp.json().await?;

        if let Some(profile) = rows.into_iter().next() {
            return Ok(profile);
        }

        // First authenticated access: create a fresh free-tier profile
        let profile = AccountProfile::new(account_id, Utc::now());
        let request = self
            .authed(self.http.post(self.table_url("accounts")))
            .json(&profile)
            .header("Prefer", "return=representation");

        let resp = Self::check(request.send().await?).await?;
        let created: Vec<AccountProfile> = resp.json().await?;
        created
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Other("account creation returned empty response".into()))
    }

    async fn update(&self, profile: &AccountProfile) -> StoreResult<()> {
        let url = format!(
            "{}?account_id=eq.{}",
            self.table_url("accounts"),
            profile.account_id
        );

        let request = self.authed(self.http.patch(&url)).json(profile);
        Self::check(request.send().await?).await?;
        Ok(())
    }
}

#[async_trait]
impl CounterStore for SupabaseStore {
    async fn get(
        &self,
        account_id: &str,
        window: WindowKind,
        window_key: &str,
    ) -> StoreResult<Option<UsageCounter>> {
        let url = format!(
            "{}?account_id=eq.{}&window=eq.{}&window_key=eq.{}&select=*",
            self.table_url("usage_counters"),
            account_id,
            window.as_str(),
            window_key
        );

        let resp = Self::check(self.authed(self.http.get(&url)).send().await?).await?;
        let rows: Vec<UsageCounter> = resp.json().await?;
        Ok(rows.into_iter().next())
    }

    async fn put(&self, counter: &UsageCounter) -> StoreResult<()> {
        let request = self
            .authed(self.http.post(self.table_url("usage_counters")))
            .json(counter)
            .header("Prefer", "resolution=merge-duplicates");

        Self::check(request.send().await?).await?;
        Ok(())
    }

    async fn delete_expired_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let url = format!(
            "{}?expires_at=lt.{}",
            self.table_url("usage_counters"),
            cutoff.to_rfc3339_opts(SecondsFormat::Secs, true)
        );

        let request = self
            .authed(self.http.delete(&url))
            .header("Prefer", "return=representation");

        let resp = Self::check(request.send().await?).await?;
        let deleted: Vec<serde_json::Value> = resp.json().await?;
        Ok(deleted.len() as u64)
    }
}

#[async_trait]
impl StatsStore for SupabaseStore {
    async fn get_day(&self, date: NaiveDate) -> StoreResult<Option<GlobalDailyStat>> {
        let url = format!(
            "{}?date=eq.{}&select=*",
            self.table_url("global_daily_stats"),
            date
        );

        let resp = Self::check(self.authed(self.http.get(&url)).send().await?).await?;
        let rows: Vec<GlobalDailyStat> = resp.json().await?;
        Ok(rows.into_iter().next())
    }

    async fn upsert_day(&self, stat: &GlobalDailyStat) -> StoreResult<()> {
        let request = self
            .authed(self.http.post(self.table_url("global_daily_stats")))
            .json(stat)
            .header("Prefer", "resolution=merge-duplicates");

        Self::check(request.send().await?).await?;
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for SupabaseStore {
    async fn kill_switch(&self) -> StoreResult<KillSwitch> {
        let url = format!(
            "{}?key=eq.{}&select=*",
            self.table_url("app_settings"),
            KILL_SWITCH_KEY
        );

        let resp = Self::check(self.authed(self.http.get(&url)).send().await?).await?;
        let rows: Vec<SettingRow> = resp.json().await?;
        Ok(rows.into_iter().next().map(|r| r.value).unwrap_or_default())
    }

    async fn set_kill_switch(&self, active: bool, reason: Option<&str>) -> StoreResult<()> {
        let row = SettingRow {
            key: KILL_SWITCH_KEY.to_string(),
            value: KillSwitch {
                active,
                reason: reason.map(str::to_string),
            },
        };

        let request = self
            .authed(self.http.post(self.table_url("app_settings")))
            .json(&row)
            .header("Prefer", "resolution=merge-duplicates");

        Self::check(request.send().await?).await?;
        Ok(())
    }
}
