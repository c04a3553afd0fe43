//! Leaderboard command

use anyhow::Result;

use super::connect_engine;
use crate::style::*;

pub async fn run(database_url: &str, limit: u32) -> Result<()> {
    print_header("Reward Leaderboard");

    let engine = connect_engine(database_url)
        .await?
        .with_leaderboard_limit(limit);
    let entries = engine.leaderboard().await?;

    if entries.is_empty() {
        print_info("No users yet.");
        return Ok(());
    }

    println!();
    println!("{:>4}  {:<24}  {:>10}", "Rank", "Username", "Balance");
    println!("{}", "─".repeat(42));

    for entry in &entries {
        let rank = format!("#{}", entry.rank);
        let rank_styled = if entry.rank == 1 {
            style_yellow(&rank)
        } else if entry.rank <= 3 {
            style_cyan(&rank)
        } else {
            rank
        };
        println!(
            "{:>4}  {:<24}  {:>10}",
            rank_styled, entry.username, entry.balance
        );
    }

    println!();
    println!("Total shown: {}", entries.len());
    Ok(())
}
