//! In-memory store implementation.
//!
//! Backs local development and the deterministic governor tests; every trait
//! seam in [`super`] is implemented against plain maps behind a
//! `parking_lot::Mutex`. Semantics mirror the hosted store: get-then-put with
//! no atomicity across calls.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;

use super::{
    AccountProfile, CounterStore, GlobalDailyStat, KillSwitch, ProfileStore, SettingsStore,
    StatsStore, StoreResult, UsageCounter, WindowKind,
};

#[derive(Default)]
struct Inner {
    profiles: HashMap<String, AccountProfile>,
    counters: HashMap<(String, WindowKind, String), UsageCounter>,
    stats: HashMap<NaiveDate, GlobalDailyStat>,
    kill_switch: KillSwitch,
}

/// Map-backed store for tests and local runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a profile directly (test setup).
    pub fn insert_profile(&self, profile: AccountProfile) {
        self.inner
            .lock()
            .profiles
            .insert(profile.account_id.clone(), profile);
    }

    /// Seed a counter directly (test setup).
    pub fn insert_counter(&self, counter: UsageCounter) {
        let key = (
            counter.account_id.clone(),
            counter.window,
            counter.window_key.clone(),
        );
        self.inner.lock().counters.insert(key, counter);
    }

    /// Seed a global daily stat directly (test setup).
    pub fn insert_stat(&self, stat: GlobalDailyStat) {
        self.inner.lock().stats.insert(stat.date, stat);
    }

    /// Number of counter rows currently held.
    pub fn counter_rows(&self) -> usize {
        self.inner.lock().counters.len()
    }
}

#[async_trait]
impl ProfileStore for MemoryStore {
    async fn get_or_create(&self, account_id: &str) -> StoreResult<AccountProfile> {
        let mut inner = self.inner.lock();
        let profile = inner
            .profiles
            .entry(account_id.to_string())
            .or_insert_with(|| AccountProfile::new(account_id, Utc::now()));
        Ok(profile.clone())
    }

    async fn update(&self, profile: &AccountProfile) -> StoreResult<()> {
        self.inner
            .lock()
            .profiles
            .insert(profile.account_id.clone(), profile.clone());
        Ok(())
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(
        &self,
        account_id: &str,
        window: WindowKind,
        window_key: &str,
    ) -> StoreResult<Option<UsageCounter>> {
        let key = (account_id.to_string(), window, window_key.to_string());
        Ok(self.inner.lock().counters.get(&key).cloned())
    }

    async fn put(&self, counter: &UsageCounter) -> StoreResult<()> {
        let key = (
            counter.account_id.clone(),
            counter.window,
            counter.window_key.clone(),
        );
        self.inner.lock().counters.insert(key, counter.clone());
        Ok(())
    }

    async fn delete_expired_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.lock();
        let before = inner.counters.len();
        inner.counters.retain(|_, c| c.expires_at >= cutoff);
        Ok((before - inner.counters.len()) as u64)
    }
}

#[async_trait]
impl StatsStore for MemoryStore {
    async fn get_day(&self, date: NaiveDate) -> StoreResult<Option<GlobalDailyStat>> {
        Ok(self.inner.lock().stats.get(&date).cloned())
    }

    async fn upsert_day(&self, stat: &GlobalDailyStat) -> StoreResult<()> {
        self.inner.lock().stats.insert(stat.date, stat.clone());
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn kill_switch(&self) -> StoreResult<KillSwitch> {
        Ok(self.inner.lock().kill_switch.clone())
    }

    async fn set_kill_switch(&self, active: bool, reason: Option<&str>) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.kill_switch = KillSwitch {
            active,
            reason: reason.map(str::to_string),
        };
        Ok(())
    }
}
