//! Subscription tiers and their static quota policies.
//!
//! Tiers are a closed enumeration: unrecognized names from the profile store
//! resolve to `Free` through an explicit default arm rather than an open
//! string-keyed lookup, so the fallback is checkable at compile time.

use serde::{Deserialize, Serialize};

/// A named subscription plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Free,
    Starter,
    Pro,
    Business,
}

impl Tier {
    /// Resolve a stored tier name, falling back to `Free` for anything
    /// unrecognized (stale rows, typos in manual edits).
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "starter" => Tier::Starter,
            "pro" => Tier::Pro,
            "business" => Tier::Business,
            _ => Tier::Free,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Starter => "starter",
            Tier::Pro => "pro",
            Tier::Business => "business",
        }
    }
}

/// Per-tier quota policy, fixed at deploy time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierPolicy {
    /// Billable operations allowed per monthly cycle.
    pub monthly_cap: u32,
    /// Operations allowed per UTC calendar minute.
    pub burst_per_minute: u32,
    /// Operations allowed per UTC calendar day; `None` exempts the tier from
    /// daily capping entirely.
    pub daily_cap: Option<u32>,
}

/// Static tier-name-to-policy table, loaded at process start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierTable {
    pub free: TierPolicy,
    pub starter: TierPolicy,
    pub pro: TierPolicy,
    pub business: TierPolicy,
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            free: TierPolicy {
                monthly_cap: 8,
                burst_per_minute: 3,
                daily_cap: Some(2),
            },
            starter: TierPolicy {
                monthly_cap: 100,
                burst_per_minute: 5,
                daily_cap: Some(25),
            },
            pro: TierPolicy {
                monthly_cap: 400,
                burst_per_minute: 8,
                daily_cap: Some(60),
            },
            // Business is the daily-exempt tier
            business: TierPolicy {
                monthly_cap: 2000,
                burst_per_minute: 12,
                daily_cap: None,
            },
        }
    }
}

impl TierTable {
    pub fn policy(&self, tier: Tier) -> TierPolicy {
        match tier {
            Tier::Free => self.free,
            Tier::Starter => self.starter,
            Tier::Pro => self.pro,
            Tier::Business => self.business,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_names_resolve() {
        assert_eq!(Tier::from_name("free"), Tier::Free);
        assert_eq!(Tier::from_name("Starter"), Tier::Starter);
        assert_eq!(Tier::from_name("PRO"), Tier::Pro);
        assert_eq!(Tier::from_name(" business "), Tier::Business);
    }

    #[test]
    fn unrecognized_names_fall_back_to_free() {
        assert_eq!(Tier::from_name("enterprise"), Tier::Free);
        assert_eq!(Tier::from_name(""), Tier::Free);
    }

    #[test]
    fn business_is_daily_exempt_by_default() {
        let table = TierTable::default();
        assert!(table.policy(Tier::Business).daily_cap.is_none());
        assert!(table.policy(Tier::Free).daily_cap.is_some());
    }

    #[test]
    fn table_deserializes_with_partial_overrides() {
        let table: TierTable = toml::from_str(
            r#"
            [free]
            monthly_cap = 10
            burst_per_minute = 4
            daily_cap = 3
            "#,
        )
        .unwrap();
        assert_eq!(table.free.monthly_cap, 10);
        // Untouched tiers keep their defaults
        assert_eq!(table.pro.monthly_cap, TierTable::default().pro.monthly_cap);
    }
}
