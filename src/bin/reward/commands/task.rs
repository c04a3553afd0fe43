//! Task catalog commands

use anyhow::Result;
use reward_ledger::NewTask;

use super::connect_engine;
use crate::style::*;
use crate::TaskCommand;

pub async fn run(database_url: &str, command: TaskCommand) -> Result<()> {
    let engine = connect_engine(database_url).await?;

    match command {
        TaskCommand::Add {
            description,
            reward,
        } => {
            let id = engine
                .create_task(NewTask {
                    description,
                    reward,
                })
                .await?;
            print_success(&format!("Created task #{}", id));
        }
        TaskCommand::List => {
            let tasks = engine.list_tasks().await?;
            print_header("Tasks");
            if tasks.is_empty() {
                print_info("No tasks yet.");
                return Ok(());
            }
            println!("{:>6}  {:>8}  Description", "Id", "Reward");
            for task in tasks {
                println!("{:>6}  {:>8}  {}", task.id, task.reward, task.description);
            }
        }
        TaskCommand::SetReward { id, reward } => {
            engine.update_task_reward(id, reward).await?;
            print_success(&format!("Task #{} now rewards {}", id, reward));
        }
    }

    Ok(())
}
