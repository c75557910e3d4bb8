use anyhow::{Context, Result};
use std::path::PathBuf;

/// Default bound on execution attempts per step.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default timeout for a single collaborator call, in seconds.
pub const DEFAULT_COLLAB_TIMEOUT_SECS: u64 = 300;

/// Runtime configuration for Anvil.
///
/// Owns the `.anvil/` directory layout under the project directory and
/// the names of the external binaries the runner drives. Both binaries
/// can be overridden through the environment, which is how tests
/// substitute stubs.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub anvil_dir: PathBuf,
    pub db_path: PathBuf,
    pub sandbox_config_path: PathBuf,
    /// Default workspace bound into the sandbox when a run does not
    /// name one explicitly.
    pub workspace_dir: PathBuf,
    pub claude_cmd: String,
    pub docker_cmd: String,
    pub max_retries: u32,
    pub verbose: bool,
}

impl Config {
    pub fn new(project_dir: PathBuf, verbose: bool, max_retries: u32) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;

        let anvil_dir = project_dir.join(".anvil");
        let db_path = anvil_dir.join("anvil.db");
        let sandbox_config_path = anvil_dir.join("sandbox.toml");
        let workspace_dir = project_dir.join("workspace");

        let claude_cmd =
            std::env::var("ANVIL_CLAUDE_CMD").unwrap_or_else(|_| "claude".to_string());
        let docker_cmd =
            std::env::var("ANVIL_DOCKER_CMD").unwrap_or_else(|_| "docker".to_string());

        Ok(Self {
            project_dir,
            anvil_dir,
            db_path,
            sandbox_config_path,
            workspace_dir,
            claude_cmd,
            docker_cmd,
            max_retries,
            verbose,
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.anvil_dir).context("Failed to create .anvil directory")?;
        std::fs::create_dir_all(&self.workspace_dir)
            .context("Failed to create workspace directory")?;
        Ok(())
    }
}
