//! Reward Ledger Server
//!
//! Serves the reward API on top of PostgreSQL

use std::sync::Arc;

use reward_ledger::server::AppState;
use reward_ledger::{Config, PgLedger, RewardEngine, TokenIssuer, TracingEvents};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Reward Ledger Server");

    let config = Config::load()?;

    let store = Arc::new(
        PgLedger::connect(
            &config.database.url,
            config.database.max_pool_size,
            config.op_timeout(),
        )
        .await?,
    );
    info!("PostgreSQL storage initialized");

    let engine = RewardEngine::new(store, Arc::new(TracingEvents))
        .with_referral_bonus(config.rewards.referral_bonus)
        .with_leaderboard_limit(config.rewards.leaderboard_limit);
    let tokens = TokenIssuer::new(&config.auth.jwt_secret, config.token_ttl());

    let state = Arc::new(AppState::new(engine, tokens));
    reward_ledger::server::run_server(&config.server.host, config.server.port, state).await?;

    Ok(())
}
