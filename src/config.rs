//! Deploy-time configuration.
//!
//! Layered the usual way: compiled-in defaults, then an optional TOML file,
//! then environment variables for the secrets that should never live in a
//! file (`SUPABASE_URL`, `SUPABASE_SERVICE_KEY`, `GENERATION_API_KEY`).

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::generation::GenerationConfig;
use crate::governor::{BudgetConfig, TierTable};
use crate::store::SupabaseConfig;

/// Default listen address for the gateway.
const DEFAULT_BIND: &str = "0.0.0.0:8787";

/// Default counter-sweep period (seconds).
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 15 * 60;

/// Gateway listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind: String,
    pub request_timeout_secs: u64,
    pub max_body_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            request_timeout_secs: 90,
            // Four photos at ~1MB each, base64-inflated
            max_body_bytes: 6 * 1024 * 1024,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    /// Absent when running against the in-memory store (local development).
    pub supabase: Option<SupabaseConfig>,
    pub generation: GenerationConfig,
    pub budget: BudgetConfig,
    pub tiers: TierTable,
    pub sweep_interval_secs: Option<u64>,
}

impl Config {
    /// Load from an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("reading config file {}", p.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("parsing config file {}", p.display()))?
            }
            None => Config::default(),
        };

        if let Some(supabase) = SupabaseConfig::from_env() {
            config.supabase = Some(supabase);
        }
        if let Ok(key) = std::env::var("GENERATION_API_KEY") {
            if !key.is_empty() {
                config.generation.api_key = key;
            }
        }
        if let Ok(bind) = std::env::var("SNAPLIST_BIND") {
            if !bind.is_empty() {
                config.gateway.bind = bind;
            }
        }

        Ok(config)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(
            self.sweep_interval_secs.unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_usable() {
        let config = Config::default();
        assert_eq!(config.gateway.bind, DEFAULT_BIND);
        assert!(config.supabase.is_none());
        assert_eq!(config.tiers.free.monthly_cap, 8);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            sweep_interval_secs = 60

            [gateway]
            bind = "127.0.0.1:9000"

            [budget]
            global_daily_budget_usd = 12.5

            [tiers.free]
            monthly_cap = 20
            burst_per_minute = 3
            daily_cap = 5
            "#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.gateway.bind, "127.0.0.1:9000");
        assert_eq!(config.budget.global_daily_budget_usd, 12.5);
        assert_eq!(config.tiers.free.monthly_cap, 20);
        assert_eq!(config.sweep_interval().as_secs(), 60);
        // Sections absent from the file keep their defaults
        assert_eq!(config.budget.cost_per_operation_usd, BudgetConfig::default().cost_per_operation_usd);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "gateway = 12").unwrap();
        assert!(Config::load(Some(file.path())).is_err());
    }
}
