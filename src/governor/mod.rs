//! Usage governor: admit/deny for billable generation operations.
//!
//! Gates every photo-to-listing generation behind tiered quotas before the
//! paid LLM call is made, and records the operation's cost impact after it
//! succeeds. Checks run in a strict, short-circuiting order:
//!
//! 1. Kill switch (global emergency brake)
//! 2. Global daily cost budget (service-wide circuit breaker)
//! 3. Monthly cap for the account's tier
//! 4. Per-minute burst cap (fixed calendar window)
//! 5. Per-day cap, unless the tier is daily-exempt
//!
//! ## Design
//! - Read-only `check_quota`; bookkeeping happens in `record_success`
//! - Every external read fails open: a store error passes that check and is
//!   warn-logged, so an infrastructure outage never blocks generations
//! - Counter increments are read-then-write with no concurrency guard; two
//!   concurrent requests can both be admitted at the cap boundary

pub mod tier;
pub mod window;

use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use tracing::warn;

use crate::store::{
    AccountProfile, CounterStore, GlobalDailyStat, SettingsStore, StatsStore, StoreResult,
    UsageCounter, WindowKind,
};

pub use tier::{Tier, TierPolicy, TierTable};

/// Why a request was denied. Fixed vocabulary; nothing else is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    KillSwitchActive,
    GlobalBudgetExhausted,
    MonthlyLimitReached,
    BurstLimitExceeded,
    DailyLimitReached,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::KillSwitchActive => "kill_switch_active",
            DenyReason::GlobalBudgetExhausted => "global_budget_exhausted",
            DenyReason::MonthlyLimitReached => "monthly_limit_reached",
            DenyReason::BurstLimitExceeded => "burst_limit_exceeded",
            DenyReason::DailyLimitReached => "daily_limit_reached",
        }
    }

    /// Human-readable message for the HTTP layer.
    pub fn message(self) -> &'static str {
        match self {
            DenyReason::KillSwitchActive => {
                "Generation is temporarily paused for maintenance. Please try again later."
            }
            DenyReason::GlobalBudgetExhausted => {
                "The service has reached its daily capacity. Please try again tomorrow."
            }
            DenyReason::MonthlyLimitReached => {
                "You have used all generations in your plan this month. Upgrade for more."
            }
            DenyReason::BurstLimitExceeded => {
                "Too many requests at once. Please wait a minute and try again."
            }
            DenyReason::DailyLimitReached => {
                "You have reached today's generation limit. It resets at midnight UTC."
            }
        }
    }
}

/// Remaining-quota snapshot returned on allow, computed optimistically
/// (cap minus the pre-increment count minus the operation about to be
/// recorded).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RemainingQuota {
    pub minute: u32,
    /// `None` for the daily-exempt tier.
    pub day: Option<u32>,
    pub month: u32,
}

/// Outcome of a quota check.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenyReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<RemainingQuota>,
}

impl Decision {
    fn deny(reason: DenyReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            remaining: None,
        }
    }

    fn allow(remaining: RemainingQuota) -> Self {
        Self {
            allowed: true,
            reason: None,
            remaining: Some(remaining),
        }
    }
}

/// Which bookkeeping step of `record_success` failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bookkeeping {
    MinuteCounter,
    DayCounter,
    GlobalStat,
}

/// Result of `record_success`: the operation itself already succeeded; this
/// only reports which best-effort bookkeeping writes were lost.
#[derive(Debug, Default)]
pub struct RecordOutcome {
    pub failed: Vec<Bookkeeping>,
}

impl RecordOutcome {
    pub fn fully_recorded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Budget knobs for the governor, fixed at deploy time.
#[derive(Debug, Clone, Copy, serde::Deserialize, Serialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Aggregate estimated-cost ceiling per UTC day, across all accounts.
    pub global_daily_budget_usd: f64,
    /// Flat per-operation cost estimate added to the global accumulator.
    pub cost_per_operation_usd: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            global_daily_budget_usd: 50.0,
            cost_per_operation_usd: 0.04,
        }
    }
}

/// Reset the monthly counter if `now` is in a later calendar month than the
/// profile's last reset. Returns whether the profile changed; the caller
/// persists it, once per request, before invoking `check_quota`.
pub fn roll_over_month(profile: &mut AccountProfile, now: DateTime<Utc>) -> bool {
    let last = profile.last_api_call_reset;
    if (now.year(), now.month()) > (last.year(), last.month()) {
        profile.api_calls_this_month = 0;
        profile.last_api_call_reset = now;
        return true;
    }
    false
}

/// The usage governor. Stateless between requests; all state lives in the
/// injected stores.
pub struct Governor {
    counters: Arc<dyn CounterStore>,
    stats: Arc<dyn StatsStore>,
    settings: Arc<dyn SettingsStore>,
    tiers: TierTable,
    budget: BudgetConfig,
}

impl Governor {
    pub fn new(
        counters: Arc<dyn CounterStore>,
        stats: Arc<dyn StatsStore>,
        settings: Arc<dyn SettingsStore>,
        tiers: TierTable,
        budget: BudgetConfig,
    ) -> Self {
        Self {
            counters,
            stats,
            settings,
            tiers,
            budget,
        }
    }

    /// Decide whether `account_id` may perform one billable generation right
    /// now. Read-only; call `record_success` after the gated operation
    /// succeeds.
    pub async fn check_quota(&self, account_id: &str, profile: &AccountProfile) -> Decision {
        let now = Utc::now();

        // 1. Kill switch
        match self.settings.kill_switch().await {
            Ok(ks) if ks.active => {
                warn!(
                    account = account_id,
                    reason = ks.reason.as_deref().unwrap_or("unspecified"),
                    "denied: kill switch active"
                );
                return Decision::deny(DenyReason::KillSwitchActive);
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "kill switch read failed; failing open"),
        }

        // 2. Global daily cost budget
        match self.stats.get_day(now.date_naive()).await {
            Ok(Some(stat)) if stat.estimated_cost_usd >= self.budget.global_daily_budget_usd => {
                warn!(
                    spent_usd = stat.estimated_cost_usd,
                    budget_usd = self.budget.global_daily_budget_usd,
                    "denied: global daily budget exhausted"
                );
                return Decision::deny(DenyReason::GlobalBudgetExhausted);
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "global stat read failed; failing open"),
        }

        // 3. Tier policy (unrecognized names fall back to free)
        let tier = Tier::from_name(&profile.tier);
        let policy = self.tiers.policy(tier);

        // 4. Monthly cap
        if profile.api_calls_this_month >= policy.monthly_cap {
            return Decision::deny(DenyReason::MonthlyLimitReached);
        }

        // 5. Per-minute burst
        let minute_used = self.counter_count(account_id, WindowKind::Minute, now).await;
        if minute_used >= policy.burst_per_minute {
            return Decision::deny(DenyReason::BurstLimitExceeded);
        }

        // 6. Per-day cap, unless the tier is exempt
        let mut day_remaining = None;
        if let Some(default_cap) = policy.daily_cap {
            let cap = effective_daily_cap(profile, default_cap, now);
            let day_used = self.counter_count(account_id, WindowKind::Day, now).await;
            if day_used >= cap {
                return Decision::deny(DenyReason::DailyLimitReached);
            }
            day_remaining = Some(cap.saturating_sub(day_used + 1));
        }

        Decision::allow(RemainingQuota {
            minute: policy.burst_per_minute.saturating_sub(minute_used + 1),
            day: day_remaining,
            month: policy
                .monthly_cap
                .saturating_sub(profile.api_calls_this_month + 1),
        })
    }

    /// Record one successful generation: bump the minute counter, the day
    /// counter (unless the tier is daily-exempt), and the global daily stat.
    ///
    /// The monthly profile counter is the caller's to increment. Sub-writes
    /// are independent and fail-silent; no deduplication is performed, so
    /// callers must invoke this exactly once per successful operation.
    pub async fn record_success(&self, account_id: &str, tier: Tier) -> RecordOutcome {
        let now = Utc::now();
        let mut outcome = RecordOutcome::default();

        if let Err(err) = self.bump_counter(account_id, WindowKind::Minute, now).await {
            warn!(error = %err, account = account_id, "minute counter update lost");
            outcome.failed.push(Bookkeeping::MinuteCounter);
        }

        if self.tiers.policy(tier).daily_cap.is_some() {
            if let Err(err) = self.bump_counter(account_id, WindowKind::Day, now).await {
                warn!(error = %err, account = account_id, "day counter update lost");
                outcome.failed.push(Bookkeeping::DayCounter);
            }
        }

        if let Err(err) = self.bump_global_stat(now).await {
            warn!(error = %err, "global stat update lost");
            outcome.failed.push(Bookkeeping::GlobalStat);
        }

        outcome
    }

    /// Current count for the window containing `now`; store errors read as
    /// zero (fail-open).
    async fn counter_count(&self, account_id: &str, kind: WindowKind, now: DateTime<Utc>) -> u32 {
        let key = window::window_key(kind, now);
        match self.counters.get(account_id, kind, &key).await {
            Ok(Some(counter)) => counter.count,
            Ok(None) => 0,
            Err(err) => {
                warn!(error = %err, window = kind.as_str(), "counter read failed; failing open");
                0
            }
        }
    }

    /// Read-modify-write increment. Two concurrent callers can both read N
    /// and write N+1; the transient over-admission is accepted.
    async fn bump_counter(
        &self,
        account_id: &str,
        kind: WindowKind,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let key = window::window_key(kind, now);
        let counter = match self.counters.get(account_id, kind, &key).await? {
            Some(mut existing) => {
                existing.count += 1;
                existing
            }
            None => UsageCounter {
                account_id: account_id.to_string(),
                window: kind,
                window_key: key,
                count: 1,
                expires_at: window::window_expiry(kind, now),
            },
        };
        self.counters.put(&counter).await
    }

    async fn bump_global_stat(&self, now: DateTime<Utc>) -> StoreResult<()> {
        let date = now.date_naive();
        let mut stat = self
            .stats
            .get_day(date)
            .await?
            .unwrap_or_else(|| GlobalDailyStat::new(date));
        stat.operation_count += 1;
        stat.estimated_cost_usd += self.budget.cost_per_operation_usd;
        self.stats.upsert_day(&stat).await
    }
}

/// An unexpired per-account override replaces the tier default outright.
fn effective_daily_cap(profile: &AccountProfile, default_cap: u32, now: DateTime<Utc>) -> u32 {
    profile
        .custom_daily_limit
        .as_ref()
        .filter(|o| now < o.expires_at)
        .map(|o| o.limit)
        .unwrap_or(default_cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CustomDailyLimit, MemoryStore, StoreError, SubscriptionStatus};
    use async_trait::async_trait;
    use chrono::Duration;

    /// Counter store that errors on every call, simulating a database outage.
    struct BrokenCounters;

    #[async_trait]
    impl CounterStore for BrokenCounters {
        async fn get(
            &self,
            _account_id: &str,
            _window: WindowKind,
            _window_key: &str,
        ) -> StoreResult<Option<UsageCounter>> {
            Err(StoreError::Other("connection refused".into()))
        }

        async fn put(&self, _counter: &UsageCounter) -> StoreResult<()> {
            Err(StoreError::Other("connection refused".into()))
        }

        async fn delete_expired_before(&self, _cutoff: DateTime<Utc>) -> StoreResult<u64> {
            Err(StoreError::Other("connection refused".into()))
        }
    }

    fn governor_over(store: Arc<MemoryStore>) -> Governor {
        Governor::new(
            store.clone(),
            store.clone(),
            store,
            TierTable::default(),
            BudgetConfig::default(),
        )
    }

    fn profile(tier: &str, calls_this_month: u32) -> AccountProfile {
        AccountProfile {
            account_id: "acct-1".into(),
            tier: tier.into(),
            status: SubscriptionStatus::Active,
            api_calls_this_month: calls_this_month,
            last_api_call_reset: Utc::now(),
            custom_daily_limit: None,
        }
    }

    fn seed_counter(store: &MemoryStore, kind: WindowKind, count: u32) {
        let now = Utc::now();
        store.insert_counter(UsageCounter {
            account_id: "acct-1".into(),
            window: kind,
            window_key: window::window_key(kind, now),
            count,
            expires_at: window::window_expiry(kind, now),
        });
    }

    #[tokio::test]
    async fn fresh_account_is_admitted_with_optimistic_remaining() {
        let store = Arc::new(MemoryStore::new());
        let gov = governor_over(store);

        let decision = gov.check_quota("acct-1", &profile("free", 0)).await;
        assert!(decision.allowed);
        let remaining = decision.remaining.unwrap();
        // Free defaults: burst 3, daily 2, monthly 8; all minus the
        // operation about to be recorded.
        assert_eq!(remaining.minute, 2);
        assert_eq!(remaining.day, Some(1));
        assert_eq!(remaining.month, 7);
    }

    #[tokio::test]
    async fn monthly_cap_denies_regardless_of_counters() {
        let store = Arc::new(MemoryStore::new());
        let gov = governor_over(store);

        let decision = gov.check_quota("acct-1", &profile("free", 8)).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(DenyReason::MonthlyLimitReached));
    }

    #[tokio::test]
    async fn kill_switch_dominates_every_other_check() {
        let store = Arc::new(MemoryStore::new());
        store.set_kill_switch(true, Some("incident")).await.unwrap();
        let gov = governor_over(store);

        // Monthly cap is also exceeded, but the kill switch must win.
        let decision = gov.check_quota("acct-1", &profile("free", 999)).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(DenyReason::KillSwitchActive));
    }

    #[tokio::test]
    async fn global_budget_denies_before_tier_checks() {
        let store = Arc::new(MemoryStore::new());
        store.insert_stat(GlobalDailyStat {
            date: Utc::now().date_naive(),
            operation_count: 10_000,
            estimated_cost_usd: 1_000.0,
        });
        let gov = governor_over(store);

        let decision = gov.check_quota("acct-1", &profile("business", 0)).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(DenyReason::GlobalBudgetExhausted));
    }

    #[tokio::test]
    async fn burst_cap_checked_before_daily() {
        let store = Arc::new(MemoryStore::new());
        seed_counter(&store, WindowKind::Minute, 3);
        // Day counter is also over, but minute is checked first.
        seed_counter(&store, WindowKind::Day, 99);
        let gov = governor_over(store);

        let decision = gov.check_quota("acct-1", &profile("free", 0)).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(DenyReason::BurstLimitExceeded));
    }

    #[tokio::test]
    async fn daily_cap_denies_at_limit() {
        let store = Arc::new(MemoryStore::new());
        seed_counter(&store, WindowKind::Day, 2);
        let gov = governor_over(store);

        let decision = gov.check_quota("acct-1", &profile("free", 0)).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(DenyReason::DailyLimitReached));
    }

    #[tokio::test]
    async fn exempt_tier_never_hits_daily_and_reports_none() {
        let store = Arc::new(MemoryStore::new());
        seed_counter(&store, WindowKind::Day, 10_000);
        let gov = governor_over(store);

        let decision = gov.check_quota("acct-1", &profile("business", 0)).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining.unwrap().day, None);
    }

    #[tokio::test]
    async fn unexpired_override_replaces_tier_default() {
        let store = Arc::new(MemoryStore::new());
        // 5 used today: over the free default of 2, under the override of 10.
        seed_counter(&store, WindowKind::Day, 5);
        let gov = governor_over(store);

        let mut p = profile("free", 0);
        p.custom_daily_limit = Some(CustomDailyLimit {
            limit: 10,
            expires_at: Utc::now() + Duration::days(7),
            reason: Some("support bump".into()),
        });

        let decision = gov.check_quota("acct-1", &p).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining.unwrap().day, Some(4));
    }

    #[tokio::test]
    async fn expired_override_reverts_to_tier_default() {
        let store = Arc::new(MemoryStore::new());
        seed_counter(&store, WindowKind::Day, 5);
        let gov = governor_over(store);

        let mut p = profile("free", 0);
        p.custom_daily_limit = Some(CustomDailyLimit {
            limit: 10,
            expires_at: Utc::now() - Duration::hours(1),
            reason: None,
        });

        let decision = gov.check_quota("acct-1", &p).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(DenyReason::DailyLimitReached));
    }

    #[tokio::test]
    async fn broken_counter_store_fails_open() {
        let store = Arc::new(MemoryStore::new());
        let gov = Governor::new(
            Arc::new(BrokenCounters),
            store.clone(),
            store,
            TierTable::default(),
            BudgetConfig::default(),
        );

        let decision = gov.check_quota("acct-1", &profile("free", 0)).await;
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn broken_stores_surface_in_record_outcome_only() {
        let store = Arc::new(MemoryStore::new());
        let gov = Governor::new(
            Arc::new(BrokenCounters),
            store.clone(),
            store,
            TierTable::default(),
            BudgetConfig::default(),
        );

        let outcome = gov.record_success("acct-1", Tier::Free).await;
        assert!(!outcome.fully_recorded());
        assert!(outcome.failed.contains(&Bookkeeping::MinuteCounter));
        assert!(outcome.failed.contains(&Bookkeeping::DayCounter));
        // Global stat store still works
        assert!(!outcome.failed.contains(&Bookkeeping::GlobalStat));
    }

    #[tokio::test]
    async fn record_success_performs_no_deduplication() {
        let store = Arc::new(MemoryStore::new());
        let gov = governor_over(store.clone());

        assert!(gov.record_success("acct-1", Tier::Free).await.fully_recorded());
        assert!(gov.record_success("acct-1", Tier::Free).await.fully_recorded());

        let now = Utc::now();
        let key = window::window_key(WindowKind::Minute, now);
        let counter = store
            .get("acct-1", WindowKind::Minute, &key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counter.count, 2);

        let stat = store.get_day(now.date_naive()).await.unwrap().unwrap();
        assert_eq!(stat.operation_count, 2);
        assert!(stat.estimated_cost_usd > 0.0);
    }

    #[tokio::test]
    async fn exempt_tier_skips_day_counter_on_record() {
        let store = Arc::new(MemoryStore::new());
        let gov = governor_over(store.clone());

        gov.record_success("acct-1", Tier::Business).await;

        let now = Utc::now();
        let day_key = window::window_key(WindowKind::Day, now);
        assert!(store
            .get("acct-1", WindowKind::Day, &day_key)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .get(
                "acct-1",
                WindowKind::Minute,
                &window::window_key(WindowKind::Minute, now)
            )
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn monthly_rollover_admits_account_at_old_cap() {
        let store = Arc::new(MemoryStore::new());
        let gov = governor_over(store);

        let mut p = profile("free", 8);
        p.last_api_call_reset = Utc::now() - Duration::days(62);

        // Caller-side rollover, before the quota check
        assert!(roll_over_month(&mut p, Utc::now()));
        assert_eq!(p.api_calls_this_month, 0);

        let decision = gov.check_quota("acct-1", &p).await;
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn rollover_is_a_noop_within_the_same_month() {
        let mut p = profile("free", 5);
        let before = p.last_api_call_reset;
        assert!(!roll_over_month(&mut p, before + Duration::seconds(30)));
        assert_eq!(p.api_calls_this_month, 5);
    }

    #[tokio::test]
    async fn free_tier_daily_scenario_end_to_end() {
        let store = Arc::new(MemoryStore::new());
        let gov = governor_over(store.clone());
        let p = profile("free", 0);

        // Two calls in a day succeed and are recorded
        for _ in 0..2 {
            let decision = gov.check_quota("acct-1", &p).await;
            assert!(decision.allowed);
            gov.record_success("acct-1", Tier::Free).await;
        }

        // Third call the same day is denied on the daily cap
        let decision = gov.check_quota("acct-1", &p).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(DenyReason::DailyLimitReached));

        // A counter keyed to yesterday never matches today's window: an
        // at-cap row from the previous day does not block a fresh account.
        let store2 = Arc::new(MemoryStore::new());
        let yesterday = Utc::now() - Duration::days(1);
        store2.insert_counter(UsageCounter {
            account_id: "acct-1".into(),
            window: WindowKind::Day,
            window_key: window::window_key(WindowKind::Day, yesterday),
            count: 2,
            expires_at: window::window_expiry(WindowKind::Day, yesterday),
        });
        let gov2 = governor_over(store2);
        assert!(gov2.check_quota("acct-1", &p).await.allowed);
    }
}
