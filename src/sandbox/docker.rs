use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

use crate::errors::SandboxError;

/// Raw output of one container-runtime invocation.
#[derive(Debug, Clone)]
pub struct CliOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CliOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout and stderr concatenated, stdout first.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Thin wrapper over the `docker` command-line client.
///
/// Every operation is a single subprocess invocation. The binary name is
/// configurable so tests can substitute a stub script; the manager layer
/// decides what each exit code means.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Invoke the client with the given arguments, bounded by a timeout.
    ///
    /// A nonzero exit is a normal `CliOutput`; only spawn failure and
    /// timeout are errors. The child is killed if the timeout fires.
    pub async fn invoke(
        &self,
        args: &[&str],
        timeout_secs: u64,
    ) -> Result<CliOutput, SandboxError> {
        let child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SandboxError::SpawnFailed {
                cmd: self.binary.clone(),
                source,
            })?;

        let output = match timeout(Duration::from_secs(timeout_secs), child.wait_with_output()).await
        {
            Ok(result) => result.map_err(|e| {
                SandboxError::Other(anyhow::anyhow!(
                    "Failed to read container runtime output: {}",
                    e
                ))
            })?,
            Err(_) => {
                return Err(SandboxError::CommandTimeout {
                    seconds: timeout_secs,
                });
            }
        };

        Ok(CliOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Run a shell script inside a container via `docker exec`.
    pub async fn exec_sh(
        &self,
        container: &str,
        script: &str,
        work_dir: &str,
        timeout_secs: u64,
    ) -> Result<CliOutput, SandboxError> {
        self.invoke(
            &["exec", "-w", work_dir, container, "sh", "-c", script],
            timeout_secs,
        )
        .await
    }

    /// Whether a container exists and is running.
    ///
    /// `Some(true)` = running, `Some(false)` = exists but stopped,
    /// `None` = no such container.
    pub async fn running_state(
        &self,
        container: &str,
        timeout_secs: u64,
    ) -> Result<Option<bool>, SandboxError> {
        let out = self
            .invoke(
                &["inspect", "--format", "{{.State.Running}}", container],
                timeout_secs,
            )
            .await?;
        if !out.success() {
            return Ok(None);
        }
        Ok(Some(out.stdout.trim() == "true"))
    }
}
