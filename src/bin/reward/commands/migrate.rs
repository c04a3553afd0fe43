//! Migrate command

use std::time::Duration;

use anyhow::Result;
use reward_ledger::store::DEFAULT_OP_TIMEOUT_SECS;
use reward_ledger::PgLedger;

use super::CLI_POOL_SIZE;
use crate::style::*;

pub async fn run(database_url: &str) -> Result<()> {
    let store = PgLedger::connect_without_migrations(
        database_url,
        CLI_POOL_SIZE,
        Duration::from_secs(DEFAULT_OP_TIMEOUT_SECS),
    )
    .await?;

    let applied = store.run_migrations().await?;
    if applied == 0 {
        print_info("Schema is up to date");
    } else {
        print_success(&format!("Applied {} migration(s)", applied));
    }
    Ok(())
}
