//! Periodic reclamation of expired usage-counter rows.
//!
//! Pure garbage collection: window keys never match an old window again, so
//! skipping a sweep only grows storage, never breaks admission. Runs on a
//! fixed interval alongside the gateway.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::CounterStore;

/// Spawn the sweep loop. The handle can be dropped; the task runs for the
/// life of the process.
pub fn spawn(counters: Arc<dyn CounterStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick fires immediately; skip it so startup isn't a sweep.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match counters.delete_expired_before(Utc::now()).await {
                Ok(0) => debug!("counter sweep: nothing to reclaim"),
                Ok(deleted) => info!(deleted, "counter sweep reclaimed expired rows"),
                Err(err) => warn!(error = %err, "counter sweep failed; will retry next tick"),
            }
        }
    })
}
