//! Workflow runs: `anvil run` and `anvil resume`.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use anvil::config::Config;
use anvil::workflow::{RunReport, WorkflowRunner};

use super::super::Cli;

/// Wire a runner from configuration: one Claude CLI collaborator serving
/// all three agent roles, a Docker-backed sandbox, and the SQLite store.
pub(crate) fn build_runner(config: &Config) -> Result<WorkflowRunner> {
    use anvil::agents::ClaudeCli;
    use anvil::config::DEFAULT_COLLAB_TIMEOUT_SECS;
    use anvil::sandbox::{DockerCli, SandboxConfig, SandboxManager};
    use anvil::store::{DbHandle, WorkflowDb};

    let db = DbHandle::new(WorkflowDb::open(&config.db_path)?);
    let sandbox_config = SandboxConfig::load(&config.sandbox_config_path)?;
    let sandbox = SandboxManager::new(DockerCli::new(config.docker_cmd.as_str()), sandbox_config);
    let claude = Arc::new(ClaudeCli::new(
        config.claude_cmd.as_str(),
        DEFAULT_COLLAB_TIMEOUT_SECS,
    ));

    Ok(WorkflowRunner::new(
        db,
        claude.clone(),
        claude.clone(),
        claude,
        sandbox,
        config.max_retries,
    ))
}

pub async fn cmd_run(
    cli: &Cli,
    project_dir: &Path,
    request: &str,
    path: Option<&Path>,
    thread: Option<String>,
    pause: bool,
) -> Result<()> {
    use anvil::workflow::RunOptions;

    let config = Config::new(project_dir.to_path_buf(), cli.verbose, cli.max_retries)?;
    config.ensure_directories()?;

    let workspace = match path {
        Some(p) => p.to_path_buf(),
        None => config.workspace_dir.clone(),
    };

    let runner = build_runner(&config)?;

    println!();
    println!("{}", console::style("Anvil Workflow Run").bold().cyan());
    println!("Request:   {}", request);
    println!("Workspace: {}", workspace.display());
    println!();

    let report = runner
        .start(
            request,
            &workspace,
            RunOptions {
                thread,
                pause_before_execute: pause,
            },
        )
        .await?;

    print_report(&report);
    Ok(())
}

pub async fn cmd_resume(
    cli: &Cli,
    project_dir: &Path,
    thread: &str,
    feedback: Option<String>,
    pause: bool,
) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), cli.verbose, cli.max_retries)?;
    config.ensure_directories()?;
    let runner = build_runner(&config)?;

    println!();
    println!("{}", console::style("Resuming thread").bold().cyan());
    println!("Thread: {}", thread);
    if let Some(ref text) = feedback {
        println!("Feedback: {}", text);
    }
    println!();

    let report = runner.resume(thread, feedback, pause).await?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &RunReport) {
    use anvil::models::StepStatus;
    use anvil::workflow::RunStatus;

    let status = match report.status {
        RunStatus::Success => console::style("SUCCESS").green().bold(),
        RunStatus::Aborted => console::style("ABORTED").red().bold(),
        RunStatus::Paused => console::style("PAUSED").yellow().bold(),
    };
    println!("{} (thread {})", status, report.thread_id);
    println!();

    for (i, step) in report.state.plan.steps.iter().enumerate() {
        let marker = match step.status {
            StepStatus::Completed => console::style(step.status.as_str()).green(),
            StepStatus::Failed => console::style(step.status.as_str()).red(),
            StepStatus::InProgress => console::style(step.status.as_str()).yellow(),
            StepStatus::Pending => console::style(step.status.as_str()).dim(),
        };
        println!("  {}. [{}] {}", i + 1, marker, step.description);
    }

    if let Some(ref error) = report.state.error {
        println!();
        println!("{} {}", console::style("Error:").red().bold(), error);
    }

    println!();
    match report.status {
        RunStatus::Paused => {
            println!("Paused before execution. Continue with:");
            println!("  anvil resume {}", report.thread_id);
        }
        RunStatus::Aborted => {
            println!("Inspect the aborted thread with:");
            println!("  anvil status {}", report.thread_id);
        }
        RunStatus::Success => {}
    }
    println!();
}
