//! Direct sandbox operations: `anvil sandbox exec|logs|stop|rm`.
//!
//! These bypass the workflow entirely and drive the container for a
//! workspace by hand, which is the fastest way to poke at a wedged run.

use anyhow::Result;
use std::path::{Path, PathBuf};

use anvil::config::Config;
use anvil::sandbox::{DockerCli, SandboxConfig, SandboxManager};

use super::super::{Cli, SandboxCommands};

fn build_sandbox(config: &Config) -> Result<SandboxManager> {
    let sandbox_config = SandboxConfig::load(&config.sandbox_config_path)?;
    Ok(SandboxManager::new(
        DockerCli::new(config.docker_cmd.as_str()),
        sandbox_config,
    ))
}

fn resolve_workspace(config: &Config, path: Option<&PathBuf>) -> PathBuf {
    match path {
        Some(p) => p.clone(),
        None => config.workspace_dir.clone(),
    }
}

pub async fn cmd_sandbox(cli: &Cli, project_dir: &Path, command: &SandboxCommands) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), cli.verbose, cli.max_retries)?;
    config.ensure_directories()?;
    let sandbox = build_sandbox(&config)?;

    match command {
        SandboxCommands::Exec { command, path } => {
            let workspace = resolve_workspace(&config, path.as_ref());
            let session = sandbox.ensure_session(&workspace).await?;
            let result = sandbox.run_command(&session, command, None).await?;
            print!("{}", result.output);
            if !result.output.is_empty() && !result.output.ends_with('\n') {
                println!();
            }
            if !result.success {
                anyhow::bail!("Command exited with code {}", result.exit_code);
            }
        }
        SandboxCommands::Logs { pid, path, tail } => {
            let workspace = resolve_workspace(&config, path.as_ref());
            let session = sandbox.ensure_session(&workspace).await?;
            let logs = sandbox.read_background_logs(&session, pid, *tail).await?;
            print!("{}", logs);
            if !logs.is_empty() && !logs.ends_with('\n') {
                println!();
            }
        }
        SandboxCommands::Stop { pid, path } => {
            let workspace = resolve_workspace(&config, path.as_ref());
            let session = sandbox.ensure_session(&workspace).await?;
            let message = sandbox.stop_background_process(&session, pid).await?;
            println!("{}", message);
        }
        SandboxCommands::Rm { path } => {
            let workspace = resolve_workspace(&config, path.as_ref());
            sandbox.remove_session(&workspace).await?;
            println!("Removed sandbox for {}", workspace.display());
        }
    }
    Ok(())
}
