//! Step Executor Adapter.
//!
//! Bridges the Coder collaborator and the sandbox: sends the task out,
//! writes the returned files into the host workspace (the bind mount makes
//! them visible inside the container), then dispatches the single command
//! through the sandbox command dialect. Every failure mode is folded into
//! the returned outcome; this layer never raises to the orchestrator.

use std::path::{Component, Path};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::agents::{Coder, CoderResponse};
use crate::errors::SandboxError;
use crate::sandbox::SandboxManager;

/// Lines returned by a background log read.
pub const DEFAULT_TAIL_LINES: usize = 100;

/// One command in the sandbox dialect. Prefixes are matched
/// case-sensitively at the start of the string; anything unprefixed is a
/// plain shell command.
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxCommand {
    BgStart(String),
    BgLog(String),
    BgStop(String),
    BgInput(String),
    CreateDirectory(String),
    Shell(String),
}

impl SandboxCommand {
    pub fn parse(raw: &str) -> Self {
        if let Some(rest) = raw.strip_prefix("BG_START:") {
            Self::BgStart(rest.trim().to_string())
        } else if let Some(rest) = raw.strip_prefix("BG_LOG:") {
            Self::BgLog(rest.trim().to_string())
        } else if let Some(rest) = raw.strip_prefix("BG_STOP:") {
            Self::BgStop(rest.trim().to_string())
        } else if let Some(rest) = raw.strip_prefix("BG_INPUT:") {
            Self::BgInput(rest.trim().to_string())
        } else if let Some(rest) = raw.strip_prefix("CREATE_DIRECTORY:") {
            Self::CreateDirectory(rest.trim().to_string())
        } else {
            Self::Shell(raw.to_string())
        }
    }
}

/// What one execution attempt produced. `success` drives the review and
/// retry routing; `output_log` is what the Reviewer (and the next retry
/// attempt) gets to see.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub output_log: String,
    pub modified_files: Vec<String>,
    pub success: bool,
}

impl ExecutionOutcome {
    fn failure(output_log: String) -> Self {
        Self {
            output_log,
            modified_files: Vec::new(),
            success: false,
        }
    }
}

/// Drives one step attempt end to end: Coder call, file writes, command
/// dispatch.
pub struct StepExecutor {
    coder: Arc<dyn Coder>,
    sandbox: SandboxManager,
}

impl StepExecutor {
    pub fn new(coder: Arc<dyn Coder>, sandbox: SandboxManager) -> Self {
        Self { coder, sandbox }
    }

    /// Execute one task attempt against the given workspace.
    pub async fn execute_step(&self, task: &str, workspace: &Path) -> ExecutionOutcome {
        let response = match self.coder.execute(task).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "coder call failed");
                return ExecutionOutcome::failure(format!("Coder call failed: {}", e));
            }
        };

        self.apply_response(&response, workspace).await
    }

    async fn apply_response(
        &self,
        response: &CoderResponse,
        workspace: &Path,
    ) -> ExecutionOutcome {
        let mut modified_files = Vec::new();
        let mut log = String::new();

        for file in &response.files {
            match write_workspace_file(workspace, &file.filename, &file.content) {
                Ok(()) => modified_files.push(file.filename.clone()),
                Err(e) => {
                    warn!(file = %file.filename, error = %e, "file write failed");
                    return ExecutionOutcome::failure(format!(
                        "Failed to write {}: {}",
                        file.filename, e
                    ));
                }
            }
        }
        if !modified_files.is_empty() {
            log.push_str(&format!(
                "Wrote {} file(s): {}\n",
                modified_files.len(),
                modified_files.join(", ")
            ));
        }

        let command = match &response.command {
            Some(command) => command,
            None => {
                log.push_str("No verification command provided.");
                return ExecutionOutcome {
                    output_log: log,
                    modified_files,
                    success: true,
                };
            }
        };

        let session = match self.sandbox.ensure_session(workspace).await {
            Ok(session) => session,
            Err(e) => {
                return self.infra_failure("session setup", e, log, modified_files);
            }
        };

        debug!(command = %command, "dispatching sandbox command");
        let (command_log, success) = match SandboxCommand::parse(command) {
            SandboxCommand::Shell(cmd) => {
                match self.sandbox.run_command(&session, &cmd, None).await {
                    Ok(result) => (result.output, result.success),
                    Err(e) => return self.infra_failure("command execution", e, log, modified_files),
                }
            }
            SandboxCommand::BgStart(cmd) => {
                match self.sandbox.start_background_process(&session, &cmd, None).await {
                    Ok(process) => (format!("BG_START Success. PID: {}.", process.pid), true),
                    Err(e) => return self.infra_failure("background launch", e, log, modified_files),
                }
            }
            SandboxCommand::BgLog(pid) => {
                match self
                    .sandbox
                    .read_background_logs(&session, &pid, DEFAULT_TAIL_LINES)
                    .await
                {
                    Ok(logs) => (format!("Logs for PID {}:\n{}", pid, logs), true),
                    Err(SandboxError::LogMissing { pid }) => {
                        (format!("No log file for background process {}", pid), false)
                    }
                    Err(e) => return self.infra_failure("log read", e, log, modified_files),
                }
            }
            SandboxCommand::BgStop(pid) => {
                match self.sandbox.stop_background_process(&session, &pid).await {
                    Ok(output) => (output, true),
                    Err(e) => return self.infra_failure("background stop", e, log, modified_files),
                }
            }
            SandboxCommand::BgInput(payload) => (
                format!(
                    "BG_INPUT is not supported; interactive input to background processes is unavailable (requested: {})",
                    payload
                ),
                false,
            ),
            SandboxCommand::CreateDirectory(path) => {
                match self.sandbox.create_directory(&session, &path).await {
                    Ok(result) if result.success => (format!("Created directory {}", path), true),
                    Ok(result) => (result.output, false),
                    Err(e) => return self.infra_failure("directory creation", e, log, modified_files),
                }
            }
        };

        log.push_str(&command_log);
        ExecutionOutcome {
            output_log: log,
            modified_files,
            success,
        }
    }

    /// Infrastructure failures feed the retry loop like any failing
    /// command, but are logged distinctly from in-sandbox command failure.
    fn infra_failure(
        &self,
        phase: &str,
        err: SandboxError,
        mut log: String,
        modified_files: Vec<String>,
    ) -> ExecutionOutcome {
        warn!(%phase, error = %err, "sandbox infrastructure failure");
        log.push_str(&format!("Sandbox infrastructure error during {}: {}", phase, err));
        ExecutionOutcome {
            output_log: log,
            modified_files,
            success: false,
        }
    }
}

/// Write one Coder-provided file under the workspace root, creating parent
/// directories as needed. Paths must stay inside the workspace.
fn write_workspace_file(workspace: &Path, filename: &str, content: &str) -> Result<()> {
    let relative = Path::new(filename);
    if relative.is_absolute()
        || relative
            .components()
            .any(|c| matches!(c, Component::ParentDir))
    {
        anyhow::bail!("path escapes the workspace");
    }

    let target = workspace.join(relative);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(&target, content)
        .with_context(|| format!("Failed to write {}", target.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    use async_trait::async_trait;

    use crate::agents::FileWrite;
    use crate::errors::CollaboratorError;
    use crate::sandbox::{DockerCli, SandboxConfig};

    struct FakeCoder {
        response: CoderResponse,
    }

    #[async_trait]
    impl Coder for FakeCoder {
        async fn execute(&self, _task: &str) -> Result<CoderResponse, CollaboratorError> {
            Ok(self.response.clone())
        }
    }

    struct BrokenCoder;

    #[async_trait]
    impl Coder for BrokenCoder {
        async fn execute(&self, _task: &str) -> Result<CoderResponse, CollaboratorError> {
            Err(CollaboratorError::Unusable {
                role: "Coder".to_string(),
                message: "not JSON; raw response: here is some code...".to_string(),
            })
        }
    }

    fn create_stub(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&path, perms).unwrap();
        }
        path
    }

    /// Stub runtime that reports the container as running and executes
    /// `exec` scripts locally.
    fn local_exec_sandbox(dir: &Path) -> SandboxManager {
        let stub = create_stub(
            dir,
            "docker",
            "#!/bin/sh\ncase \"$1\" in\n  inspect) echo true ;;\n  exec) exec sh -c \"$7\" ;;\n  *) ;;\nesac\n",
        );
        SandboxManager::new(DockerCli::new(stub.to_string_lossy()), SandboxConfig::default())
    }

    fn executor_with(coder: impl Coder + 'static, sandbox: SandboxManager) -> StepExecutor {
        StepExecutor::new(Arc::new(coder), sandbox)
    }

    #[test]
    fn test_dialect_parsing() {
        assert_eq!(
            SandboxCommand::parse("BG_START: python -m http.server"),
            SandboxCommand::BgStart("python -m http.server".to_string())
        );
        assert_eq!(
            SandboxCommand::parse("BG_LOG:4242"),
            SandboxCommand::BgLog("4242".to_string())
        );
        assert_eq!(
            SandboxCommand::parse("BG_STOP:4242"),
            SandboxCommand::BgStop("4242".to_string())
        );
        assert_eq!(
            SandboxCommand::parse("BG_INPUT:4242|yes"),
            SandboxCommand::BgInput("4242|yes".to_string())
        );
        assert_eq!(
            SandboxCommand::parse("CREATE_DIRECTORY: src/lib"),
            SandboxCommand::CreateDirectory("src/lib".to_string())
        );
        assert_eq!(
            SandboxCommand::parse("python main.py"),
            SandboxCommand::Shell("python main.py".to_string())
        );
    }

    #[test]
    fn test_dialect_prefixes_are_anchored_and_case_sensitive() {
        // Lowercase prefix is not the dialect.
        assert_eq!(
            SandboxCommand::parse("bg_start: serve"),
            SandboxCommand::Shell("bg_start: serve".to_string())
        );
        // A prefix not at the start of the string is not the dialect.
        assert_eq!(
            SandboxCommand::parse(" BG_START: serve"),
            SandboxCommand::Shell(" BG_START: serve".to_string())
        );
        assert_eq!(
            SandboxCommand::parse("echo BG_STOP:1"),
            SandboxCommand::Shell("echo BG_STOP:1".to_string())
        );
    }

    #[tokio::test]
    async fn test_files_written_then_command_run() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = local_exec_sandbox(dir.path());
        let workspace = dir.path().join("ws");

        let executor = executor_with(
            FakeCoder {
                response: CoderResponse {
                    files: vec![FileWrite {
                        filename: "a.py".to_string(),
                        content: "print(1)".to_string(),
                    }],
                    // The stub executes on the host in the test process cwd,
                    // so the command must not depend on the workspace.
                    command: Some("echo verified".to_string()),
                },
            },
            sandbox,
        );

        let outcome = executor.execute_step("write a.py", &workspace).await;
        assert!(outcome.success, "log: {}", outcome.output_log);
        assert_eq!(outcome.modified_files, vec!["a.py".to_string()]);
        assert_eq!(fs::read_to_string(workspace.join("a.py")).unwrap(), "print(1)");
        assert!(outcome.output_log.contains("Wrote 1 file(s): a.py"));
        assert!(outcome.output_log.contains("verified"));
    }

    #[tokio::test]
    async fn test_no_command_is_immediate_success() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = local_exec_sandbox(dir.path());
        let workspace = dir.path().join("ws");

        let executor = executor_with(
            FakeCoder {
                response: CoderResponse {
                    files: vec![FileWrite {
                        filename: "notes.md".to_string(),
                        content: "done".to_string(),
                    }],
                    command: None,
                },
            },
            sandbox,
        );

        let outcome = executor.execute_step("write notes", &workspace).await;
        assert!(outcome.success);
        assert!(outcome.output_log.contains("No verification command provided."));
        assert_eq!(outcome.modified_files, vec!["notes.md".to_string()]);
    }

    #[tokio::test]
    async fn test_failing_command_is_a_failing_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = local_exec_sandbox(dir.path());
        let workspace = dir.path().join("ws");

        let executor = executor_with(
            FakeCoder {
                response: CoderResponse {
                    files: vec![],
                    command: Some("echo broken >&2; exit 3".to_string()),
                },
            },
            sandbox,
        );

        let outcome = executor.execute_step("run it", &workspace).await;
        assert!(!outcome.success);
        assert!(outcome.output_log.contains("broken"));
    }

    #[tokio::test]
    async fn test_coder_failure_keeps_raw_response_in_log() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = local_exec_sandbox(dir.path());
        let workspace = dir.path().join("ws");

        let executor = executor_with(BrokenCoder, sandbox);
        let outcome = executor.execute_step("do something", &workspace).await;
        assert!(!outcome.success);
        assert!(outcome.output_log.contains("Coder call failed"));
        assert!(outcome.output_log.contains("here is some code"));
    }

    #[tokio::test]
    async fn test_bg_input_is_not_supported() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = local_exec_sandbox(dir.path());
        let workspace = dir.path().join("ws");

        let executor = executor_with(
            FakeCoder {
                response: CoderResponse {
                    files: vec![],
                    command: Some("BG_INPUT:4242|y".to_string()),
                },
            },
            sandbox,
        );

        let outcome = executor.execute_step("answer the prompt", &workspace).await;
        assert!(!outcome.success);
        assert!(outcome.output_log.contains("BG_INPUT is not supported"));
    }

    #[tokio::test]
    async fn test_escaping_path_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = local_exec_sandbox(dir.path());
        let workspace = dir.path().join("ws");

        let executor = executor_with(
            FakeCoder {
                response: CoderResponse {
                    files: vec![FileWrite {
                        filename: "../outside.txt".to_string(),
                        content: "nope".to_string(),
                    }],
                    command: None,
                },
            },
            sandbox,
        );

        let outcome = executor.execute_step("write outside", &workspace).await;
        assert!(!outcome.success);
        assert!(outcome.output_log.contains("escapes the workspace"));
        assert!(!dir.path().join("outside.txt").exists());
    }

    #[tokio::test]
    async fn test_infrastructure_failure_is_folded_into_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let stub = create_stub(
            dir.path(),
            "docker",
            "#!/bin/sh\ncase \"$1\" in\n  inspect) exit 1 ;;\n  run) echo 'daemon not running' >&2; exit 1 ;;\nesac\n",
        );
        let sandbox =
            SandboxManager::new(DockerCli::new(stub.to_string_lossy()), SandboxConfig::default());
        let workspace = dir.path().join("ws");

        let executor = executor_with(
            FakeCoder {
                response: CoderResponse {
                    files: vec![],
                    command: Some("echo hi".to_string()),
                },
            },
            sandbox,
        );

        let outcome = executor.execute_step("run it", &workspace).await;
        assert!(!outcome.success);
        assert!(outcome.output_log.contains("Sandbox infrastructure error"));
        assert!(outcome.output_log.contains("daemon not running"));
    }
}
