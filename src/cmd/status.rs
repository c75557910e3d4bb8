//! Thread inspection: `anvil status`, `anvil history`, and `anvil plans`.

use anyhow::Result;
use std::path::Path;

use anvil::config::Config;
use anvil::store::{DbHandle, WorkflowDb};

use super::super::Cli;

pub async fn cmd_status(cli: &Cli, project_dir: &Path, thread: &str) -> Result<()> {
    use anvil::errors::WorkflowError;
    use anvil::models::StepStatus;
    use anvil::workflow::decode_checkpoint;

    let config = Config::new(project_dir.to_path_buf(), cli.verbose, cli.max_retries)?;
    if !config.db_path.exists() {
        return Err(WorkflowError::ThreadNotFound {
            thread_id: thread.to_string(),
        }
        .into());
    }
    let db = DbHandle::new(WorkflowDb::open(&config.db_path)?);

    let tid = thread.to_string();
    let checkpoint = db
        .call(move |db| db.latest_checkpoint(&tid))
        .await?
        .ok_or_else(|| WorkflowError::ThreadNotFound {
            thread_id: thread.to_string(),
        })?;
    let (state, meta) = decode_checkpoint(&checkpoint)?;

    println!();
    println!("Thread {}", thread);
    println!("==================");
    println!();
    println!("Last node:  {}", meta.node);
    println!(
        "Checkpoint: {} at {}",
        checkpoint.checkpoint_id, checkpoint.created_at
    );
    println!("Request:    {}", state.plan.original_request);
    println!(
        "Progress:   step {}/{}, retry {}",
        state.current_step_index.min(state.plan.steps.len()),
        state.plan.steps.len(),
        state.retry_count
    );
    println!();

    for (i, step) in state.plan.steps.iter().enumerate() {
        let marker = match step.status {
            StepStatus::Completed => console::style(step.status.as_str()).green(),
            StepStatus::Failed => console::style(step.status.as_str()).red(),
            StepStatus::InProgress => console::style(step.status.as_str()).yellow(),
            StepStatus::Pending => console::style(step.status.as_str()).dim(),
        };
        println!("  {}. [{}] {} ({})", i + 1, marker, step.description, step.role);
    }

    if let Some(review) = &state.review {
        println!();
        println!("Last review: {}", review.verdict);
        if !review.justification.is_empty() {
            println!("  {}", review.justification);
        }
    }

    if let Some(error) = &state.error {
        println!();
        println!("{} {}", console::style("Error:").red().bold(), error);
    }
    println!();
    Ok(())
}

pub async fn cmd_history(cli: &Cli, project_dir: &Path, thread: &str, limit: i64) -> Result<()> {
    use anvil::errors::WorkflowError;
    use anvil::workflow::decode_checkpoint;

    let config = Config::new(project_dir.to_path_buf(), cli.verbose, cli.max_retries)?;
    if !config.db_path.exists() {
        return Err(WorkflowError::ThreadNotFound {
            thread_id: thread.to_string(),
        }
        .into());
    }
    let db = DbHandle::new(WorkflowDb::open(&config.db_path)?);

    let tid = thread.to_string();
    let checkpoints = db
        .call(move |db| db.list_checkpoints(&tid, limit))
        .await?;
    if checkpoints.is_empty() {
        return Err(WorkflowError::ThreadNotFound {
            thread_id: thread.to_string(),
        }
        .into());
    }

    println!();
    println!("Checkpoints for thread {} (newest first)", thread);
    println!();
    println!(
        "{:<38} {:<16} {:<6} {:<7} {}",
        "Checkpoint", "Node", "Step", "Retry", "Created"
    );

    for checkpoint in &checkpoints {
        let (state, meta) = decode_checkpoint(checkpoint)?;
        println!(
            "{:<38} {:<16} {:<6} {:<7} {}",
            checkpoint.checkpoint_id,
            meta.node,
            meta.step_index,
            state.retry_count,
            checkpoint.created_at
        );
    }
    println!();
    Ok(())
}

pub async fn cmd_plans(cli: &Cli, project_dir: &Path, limit: i64) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), cli.verbose, cli.max_retries)?;
    if !config.db_path.exists() {
        println!();
        println!("No plans stored yet. Run 'anvil run <request>' to create one.");
        println!();
        return Ok(());
    }
    let db = DbHandle::new(WorkflowDb::open(&config.db_path)?);

    let plans = db.call(move |db| db.list_plans(limit)).await?;
    if plans.is_empty() {
        println!();
        println!("No plans stored yet. Run 'anvil run <request>' to create one.");
        println!();
        return Ok(());
    }

    println!();
    println!(
        "{:<38} {:<11} {:<20} Request",
        "Plan", "Steps", "Created"
    );

    for plan in &plans {
        println!(
            "{:<38} {:<11} {:<20} {}",
            plan.id.to_string(),
            format!("{}/{}", plan.completed_steps, plan.total_steps),
            plan.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            truncate(&plan.original_request, 60)
        );
    }
    println!();
    Ok(())
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}...", cut.trim_end())
}
