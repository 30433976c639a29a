use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use snaplist::config::Config;
use snaplist::gateway::{self, AppState};
use snaplist::generation::GenerationClient;
use snaplist::governor::Governor;
use snaplist::store::{
    CounterStore, MemoryStore, ProfileStore, SettingsStore, StatsStore, SupabaseStore,
};
use snaplist::sweep;

#[derive(Parser)]
#[command(name = "snaplist", version, about = "Listing-generation backend")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the generation gateway and the counter sweep.
    Serve,
    /// Flip the emergency brake that denies all governed operations.
    Brake {
        #[command(subcommand)]
        action: BrakeAction,
    },
}

#[derive(Subcommand)]
enum BrakeAction {
    /// Engage the brake.
    On {
        /// Why the brake was pulled; shown in logs and to support staff.
        #[arg(long)]
        reason: String,
    },
    /// Release the brake.
    Off,
}

/// The four store roles, backed by one client in practice.
struct Stores {
    profiles: Arc<dyn ProfileStore>,
    counters: Arc<dyn CounterStore>,
    stats: Arc<dyn StatsStore>,
    settings: Arc<dyn SettingsStore>,
}

fn build_stores(config: &Config) -> Result<Stores> {
    match &config.supabase {
        Some(supabase) => {
            let store = Arc::new(SupabaseStore::new(supabase.clone())?);
            Ok(Stores {
                profiles: store.clone(),
                counters: store.clone(),
                stats: store.clone(),
                settings: store,
            })
        }
        None => {
            // No SUPABASE_URL configured: local development against an
            // in-memory store that forgets everything on restart.
            warn!("no supabase configuration; using volatile in-memory store");
            let store = Arc::new(MemoryStore::new());
            Ok(Stores {
                profiles: store.clone(),
                counters: store.clone(),
                stats: store.clone(),
                settings: store,
            })
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    let stores = build_stores(&config)?;

    match cli.command {
        Command::Serve => {
            let governor = Governor::new(
                stores.counters.clone(),
                stores.stats,
                stores.settings,
                config.tiers.clone(),
                config.budget,
            );
            let state = Arc::new(AppState {
                governor,
                profiles: stores.profiles,
                generator: GenerationClient::new(config.generation.clone())?,
            });

            sweep::spawn(stores.counters, config.sweep_interval());
            gateway::serve(state, &config.gateway).await
        }
        Command::Brake { action } => {
            match action {
                BrakeAction::On { reason } => {
                    stores.settings.set_kill_switch(true, Some(&reason)).await?;
                    info!(reason, "emergency brake engaged");
                }
                BrakeAction::Off => {
                    stores.settings.set_kill_switch(false, None).await?;
                    info!("emergency brake released");
                }
            }
            Ok(())
        }
    }
}
