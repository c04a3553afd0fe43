pub mod leaderboard;
pub mod migrate;
pub mod task;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use reward_ledger::store::DEFAULT_OP_TIMEOUT_SECS;
use reward_ledger::{PgLedger, RewardEngine, TracingEvents};

/// Small pool; the CLI issues one call at a time
const CLI_POOL_SIZE: usize = 2;

pub async fn connect_engine(database_url: &str) -> Result<RewardEngine<PgLedger>> {
    let store = PgLedger::connect(
        database_url,
        CLI_POOL_SIZE,
        Duration::from_secs(DEFAULT_OP_TIMEOUT_SECS),
    )
    .await?;
    Ok(RewardEngine::new(Arc::new(store), Arc::new(TracingEvents)))
}
