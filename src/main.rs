use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod cmd;

#[derive(Parser)]
#[command(name = "anvil")]
#[command(version, about = "Self-healing development workflow runner")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Total execution attempts allowed per step before the run aborts
    #[arg(long, default_value = "3", global = true)]
    pub max_retries: u32,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Plan a request and run it to completion
    Run {
        /// What to build or fix
        request: String,

        /// Workspace directory (defaults to ./workspace)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Thread id override (defaults to plan-<plan-id>)
        #[arg(long)]
        thread: Option<String>,

        /// Checkpoint and stop before the first execution attempt
        #[arg(long)]
        pause: bool,
    },
    /// Continue a thread from its latest checkpoint
    Resume {
        thread: String,

        /// Feedback folded into the next execution attempt
        #[arg(short, long)]
        feedback: Option<String>,

        /// Checkpoint and stop before the next execution attempt
        #[arg(long)]
        pause: bool,
    },
    /// Show where a thread currently stands
    Status {
        thread: String,
    },
    /// List the checkpoints of a thread, newest first
    History {
        thread: String,

        #[arg(long, default_value = "20")]
        limit: i64,
    },
    /// List stored development plans, newest first
    Plans {
        #[arg(long, default_value = "20")]
        limit: i64,
    },
    /// Operate directly on a workspace sandbox
    Sandbox {
        #[command(subcommand)]
        command: SandboxCommands,
    },
}

#[derive(Subcommand)]
pub enum SandboxCommands {
    /// Run a shell command inside the sandbox
    Exec {
        command: String,

        /// Workspace whose sandbox to use
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Tail the log of a background process
    Logs {
        pid: String,

        #[arg(long)]
        path: Option<PathBuf>,

        #[arg(long, default_value = "100")]
        tail: usize,
    },
    /// Stop a background process
    Stop {
        pid: String,

        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Remove the sandbox container of a workspace
    Rm {
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "anvil=debug" } else { "anvil=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run {
            request,
            path,
            thread,
            pause,
        } => {
            cmd::cmd_run(&cli, &project_dir, request, path.as_deref(), thread.clone(), *pause)
                .await?;
        }
        Commands::Resume {
            thread,
            feedback,
            pause,
        } => {
            cmd::cmd_resume(&cli, &project_dir, thread, feedback.clone(), *pause).await?;
        }
        Commands::Status { thread } => cmd::cmd_status(&cli, &project_dir, thread).await?,
        Commands::History { thread, limit } => {
            cmd::cmd_history(&cli, &project_dir, thread, *limit).await?
        }
        Commands::Plans { limit } => cmd::cmd_plans(&cli, &project_dir, *limit).await?,
        Commands::Sandbox { command } => cmd::cmd_sandbox(&cli, &project_dir, command).await?,
    }

    Ok(())
}
