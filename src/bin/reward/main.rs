//! Reward Ledger CLI
//!
//! Operator commands: schema migrations, task catalog and leaderboard.

mod commands;
mod style;

use clap::{Parser, Subcommand};
use style::*;

#[derive(Parser)]
#[command(name = "reward")]
#[command(author = "CortexLM")]
#[command(version)]
#[command(about = "Reward Ledger - manage tasks and inspect balances", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// PostgreSQL database URL
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,

    /// Manage the task catalog
    #[command(subcommand)]
    Task(TaskCommand),

    /// View the leaderboard
    #[command(visible_alias = "lb")]
    Leaderboard {
        /// Number of entries to show
        #[arg(short, long, default_value = "10")]
        limit: u32,
    },
}

#[derive(Subcommand)]
pub enum TaskCommand {
    /// Add a task to the catalog
    Add { description: String, reward: i64 },

    /// List all tasks
    #[command(visible_alias = "ls")]
    List,

    /// Change the reward of an existing task
    SetReward { id: i64, reward: i64 },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt().with_env_filter("info").init();
    }

    let database_url = match cli.database_url {
        Some(url) if !url.is_empty() => url,
        _ => {
            print_error("DATABASE_URL is required (set it or pass --database-url)");
            std::process::exit(2);
        }
    };

    let result = match cli.command {
        Commands::Migrate => commands::migrate::run(&database_url).await,
        Commands::Task(command) => commands::task::run(&database_url, command).await,
        Commands::Leaderboard { limit } => commands::leaderboard::run(&database_url, limit).await,
    };

    if let Err(e) = result {
        print_error(&format!("{}", e));
        std::process::exit(1);
    }
}
