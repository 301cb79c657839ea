//! Stakepoints - Staking Reward Reconciliation Engine
//!
//! Periodically reconciles every active staking position against the Solana
//! balance oracle and accrues time-weighted reward points.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stakepoints_engine::config::Config;
use stakepoints_engine::engine::ReconciliationEngine;
use stakepoints_engine::oracle::{OnchainBalanceVerifier, SolanaRpcClient};
use stakepoints_engine::store::RewardsDb;

#[derive(Parser, Debug)]
#[command(name = "stakepoints")]
#[command(about = "Staking reward reconciliation engine")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run reconciliation cycles on the configured interval (default)
    Run,
    /// Run exactly one reconciliation cycle and exit
    Once,
    /// Print active positions, top users, and recent cycle history
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    load_env();
    init_tracing();

    match args.command.unwrap_or(Command::Run) {
        Command::Status => {
            // Status only reads the database; no oracle configuration needed.
            let db_path = resolve_data_path(env::var("REWARDS_DB_PATH").ok(), "stakepoints.db");
            let store = RewardsDb::new(&db_path).context("open rewards db")?;
            print_status(&store).await
        }
        Command::Once => {
            let config = Config::from_env().context("load configuration")?;
            let engine = build_engine(&config)?;
            let report = engine.run_cycle().await?;
            info!(
                cycle = %report.cycle_id,
                points = report.points_awarded,
                "🎯 Single cycle finished"
            );
            Ok(())
        }
        Command::Run => {
            let config = Config::from_env().context("load configuration")?;
            let engine = build_engine(&config)?;
            run_daemon(engine, config.cycle_interval_secs).await
        }
    }
}

fn build_engine(config: &Config) -> Result<ReconciliationEngine> {
    info!("🚀 Stakepoints reward engine starting");

    let db_path = resolve_data_path(Some(config.db_path.clone()), "stakepoints.db");
    let store = RewardsDb::new(&db_path).context("open rewards db")?;
    info!("💾 Rewards database at: {}", db_path);

    let rpc = SolanaRpcClient::new(config.rpc_url.clone(), config.verify_timeout_secs)?;
    let verifier = Arc::new(OnchainBalanceVerifier::new(rpc, config.mint_address.clone()));
    info!(
        policy = config.failure_policy.as_str(),
        concurrency = config.max_concurrent_verifications,
        "📊 Balance oracle: {} (mint {})",
        config.rpc_url,
        config.mint_address
    );

    Ok(ReconciliationEngine::new(
        store,
        verifier,
        config.failure_policy,
        config.max_concurrent_verifications,
    ))
}

async fn run_daemon(engine: ReconciliationEngine, interval_secs: u64) -> Result<()> {
    info!(interval_secs, "🔥 Reconciliation daemon active");

    // First tick fires immediately, so a restart settles outstanding
    // intervals right away instead of waiting a full period.
    let mut ticker = interval(Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if let Err(e) = engine.run_cycle().await {
            warn!(error = %e, "⚠️ Reward cycle aborted");
        }
    }
}

async fn print_status(store: &RewardsDb) -> Result<()> {
    let active = store.count_active_positions().await?;
    let users = store.list_users(10).await?;
    let cycles = store.list_recent_cycles(5).await?;

    println!("=== Stakepoints Status ===");
    println!("Active positions: {}", active);
    println!();

    println!("Top users:");
    if users.is_empty() {
        println!("  (none)");
    }
    for user in users {
        println!("  {:<44} {:>12} pts", user.wallet_address, user.points);
    }
    println!();

    println!("Recent cycles:");
    if cycles.is_empty() {
        println!("  (none)");
    }
    for cycle in cycles {
        println!(
            "  {} scanned={} accrued={} partial={} full={} deferred={} contended={} failed={} points={}",
            cycle.started_at.format("%Y-%m-%d %H:%M:%S"),
            cycle.scanned,
            cycle.accrued,
            cycle.partial_unstakes,
            cycle.full_unstakes,
            cycle.deferred,
            cycle.contended,
            cycle.failed,
            cycle.points_awarded
        );
    }
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stakepoints=debug,stakepoints_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn default_data_path(filename: &str) -> String {
    // Anchor defaults to the crate directory so running from elsewhere
    // doesn't accidentally create a new empty DB.
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    base.join(filename).to_string_lossy().to_string()
}

fn resolve_data_path(env_value: Option<String>, default_filename: &str) -> String {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let Some(raw) = env_value.filter(|v| !v.trim().is_empty()) else {
        return default_data_path(default_filename);
    };

    let p = PathBuf::from(raw);
    if p.is_absolute() {
        return p.to_string_lossy().to_string();
    }

    // Treat relative paths as relative to the crate dir, not the caller's cwd.
    base.join(p).to_string_lossy().to_string()
}

fn load_env() {
    // 1) Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // 2) Also try crate-root .env (common when running with --manifest-path from elsewhere)
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));

    let candidates = [manifest_dir.join(".env"), manifest_dir.join("../.env")];

    for p in candidates {
        if p.exists() {
            let _ = dotenv::from_path(&p);
        }
    }
}
