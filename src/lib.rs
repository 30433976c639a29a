//! Backend for a photo-to-resale-listing browser extension.
//!
//! The core is the [`governor`] module: tiered per-minute/per-day/per-month
//! quota enforcement with a global cost-budget circuit breaker and an
//! emergency kill switch, evaluated against counters in an external store
//! before every paid generation call. Around it sit the [`store`] seams
//! (Supabase in production, in-memory for tests), the [`gateway`] HTTP
//! surface, the [`generation`] vision-LLM client, and the counter [`sweep`].

pub mod config;
pub mod gateway;
pub mod generation;
pub mod governor;
pub mod store;
pub mod sweep;

pub use config::Config;
pub use governor::{Decision, DenyReason, Governor, RemainingQuota, Tier, TierPolicy, TierTable};
pub use store::{AccountProfile, MemoryStore, SupabaseStore};
