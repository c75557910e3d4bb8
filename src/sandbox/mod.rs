//! Persistent per-workspace execution sandboxes.
//!
//! Each workspace gets one long-lived container, named deterministically
//! from the workspace path, with the workspace bind-mounted at
//! `/workspace`. Sessions are resolved through [`SandboxManager::ensure_session`]
//! on every use, so a container lost to a crash or restart is recreated
//! transparently. Background processes are supervised by pid, with their
//! combined output captured to per-pid log files inside the container.

pub mod config;
pub mod docker;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::errors::SandboxError;
pub use config::SandboxConfig;
pub use docker::{CliOutput, DockerCli};

/// Container path every workspace is mounted at.
pub const WORKSPACE_DIR: &str = "/workspace";

/// Container directory holding background-process log files.
pub const BG_LOG_DIR: &str = "/tmp/anvil-bg";

const CONTAINER_START_TIMEOUT_SECS: u64 = 120;
const QUICK_TIMEOUT_SECS: u64 = 30;

/// Handle to one persistent execution environment, bound 1:1 to a
/// canonical workspace path.
#[derive(Debug, Clone)]
pub struct SandboxSession {
    pub workspace: PathBuf,
    pub container_name: String,
}

/// Outcome of a synchronous command. A nonzero exit is a normal result,
/// not an error.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub output: String,
    pub success: bool,
}

/// A detached command supervised by pid.
#[derive(Debug, Clone)]
pub struct BackgroundProcess {
    pub pid: String,
    pub log_file: String,
    pub command: String,
}

/// Owns the session and background-process registries and drives the
/// container runtime. Every operation returns `Err` only for
/// infrastructure failure; in-container command failure comes back as a
/// result value.
#[derive(Clone)]
pub struct SandboxManager {
    docker: DockerCli,
    config: SandboxConfig,
    sessions: Arc<tokio::sync::Mutex<HashMap<PathBuf, SandboxSession>>>,
    background: Arc<tokio::sync::Mutex<HashMap<(String, String), BackgroundProcess>>>,
}

impl SandboxManager {
    pub fn new(docker: DockerCli, config: SandboxConfig) -> Self {
        Self {
            docker,
            config,
            sessions: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            background: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    /// Deterministic container name for a workspace path.
    pub fn container_name(workspace: &Path) -> String {
        let digest = Sha256::digest(workspace.to_string_lossy().as_bytes());
        let hex = format!("{:x}", digest);
        format!("anvil-sbx-{}", &hex[..12])
    }

    /// Resolve (creating if necessary) the session for a workspace.
    ///
    /// Idempotent: a running container is reused, a stopped one is
    /// restarted, a missing one is created with the workspace mounted at
    /// [`WORKSPACE_DIR`].
    pub async fn ensure_session(&self, workspace: &Path) -> Result<SandboxSession, SandboxError> {
        std::fs::create_dir_all(workspace).map_err(|e| SandboxError::Unreachable {
            workspace: workspace.to_path_buf(),
            message: format!("cannot create workspace directory: {}", e),
        })?;
        let workspace = std::fs::canonicalize(workspace).map_err(|e| SandboxError::Unreachable {
            workspace: workspace.to_path_buf(),
            message: format!("cannot resolve workspace directory: {}", e),
        })?;
        let name = Self::container_name(&workspace);

        match self.docker.running_state(&name, QUICK_TIMEOUT_SECS).await? {
            Some(true) => {
                debug!(container = %name, "reusing running sandbox");
            }
            Some(false) => {
                info!(container = %name, "restarting stopped sandbox");
                let out = self
                    .docker
                    .invoke(&["start", &name], CONTAINER_START_TIMEOUT_SECS)
                    .await
                    .map_err(as_start_timeout)?;
                if !out.success() {
                    return Err(SandboxError::Unreachable {
                        workspace,
                        message: format!("container restart failed: {}", out.combined().trim()),
                    });
                }
            }
            None => {
                info!(container = %name, workspace = %workspace.display(), "creating sandbox");
                let args = self.run_args(&name, &workspace);
                let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
                let out = self
                    .docker
                    .invoke(&arg_refs, CONTAINER_START_TIMEOUT_SECS)
                    .await
                    .map_err(as_start_timeout)?;
                if !out.success() {
                    return Err(SandboxError::Unreachable {
                        workspace,
                        message: format!("container create failed: {}", out.combined().trim()),
                    });
                }
            }
        }

        let session = SandboxSession {
            workspace: workspace.clone(),
            container_name: name,
        };
        self.sessions.lock().await.insert(workspace, session.clone());
        Ok(session)
    }

    fn run_args(&self, name: &str, workspace: &Path) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.into(),
            "-v".into(),
            format!("{}:{}", workspace.display(), WORKSPACE_DIR),
            "-w".into(),
            WORKSPACE_DIR.into(),
            "--memory".into(),
            self.config.memory.clone(),
            "--cpus".into(),
            self.config.cpus.to_string(),
        ];
        let mut env: Vec<_> = self.config.env.iter().collect();
        env.sort();
        for (key, value) in env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        args.push(self.config.image.clone());
        args.push("sleep".into());
        args.push("infinity".into());
        args
    }

    /// Run a command to completion inside the session.
    ///
    /// Combined stdout/stderr; `success` mirrors the exit code. Errors only
    /// for infrastructure failure (unreachable runtime, timeout).
    pub async fn run_command(
        &self,
        session: &SandboxSession,
        command: &str,
        work_dir: Option<&str>,
    ) -> Result<ExecResult, SandboxError> {
        let work_dir = work_dir.unwrap_or(WORKSPACE_DIR);
        debug!(container = %session.container_name, %command, "running sandbox command");
        let out = self
            .docker
            .exec_sh(&session.container_name, command, work_dir, self.config.timeout)
            .await?;
        Ok(ExecResult {
            exit_code: out.exit_code,
            output: out.combined(),
            success: out.success(),
        })
    }

    /// Detach a command and return its pid.
    ///
    /// The command runs under `sh -c` with combined output redirected to a
    /// log file named from the pid the shell reports. A command that dies
    /// immediately still launches; its exit lands in the log file.
    pub async fn start_background_process(
        &self,
        session: &SandboxSession,
        command: &str,
        work_dir: Option<&str>,
    ) -> Result<BackgroundProcess, SandboxError> {
        let work_dir = work_dir.unwrap_or(WORKSPACE_DIR);
        // The child redirects to a log named from its own pid, which equals
        // the pid the launcher reports because every layer execs. The
        // launcher touches the same path in append mode so the file exists
        // before the pid is returned, whichever side runs first.
        let script = format!(
            "d={dir}; mkdir -p \"$d\"; \
             nohup sh -c 'exec >>\"$1/$$.log\" 2>&1; exec sh -c \"$2\"' bg \"$d\" {cmd} \
             >/dev/null 2>&1 & \
             p=$!; : >>\"$d/$p.log\"; echo \"$p\"",
            dir = BG_LOG_DIR,
            cmd = shell_quote(command),
        );
        let out = self
            .docker
            .exec_sh(&session.container_name, &script, work_dir, self.config.timeout)
            .await?;
        if !out.success() {
            return Err(SandboxError::Other(anyhow::anyhow!(
                "Background launch failed: {}",
                out.combined().trim()
            )));
        }
        let pid = out.stdout.trim().to_string();
        if pid.is_empty() {
            return Err(SandboxError::Other(anyhow::anyhow!(
                "Background launch reported no pid"
            )));
        }

        let process = BackgroundProcess {
            pid: pid.clone(),
            log_file: format!("{}/{}.log", BG_LOG_DIR, pid),
            command: command.to_string(),
        };
        info!(container = %session.container_name, %pid, "background process started");
        self.background
            .lock()
            .await
            .insert((session.container_name.clone(), pid), process.clone());
        Ok(process)
    }

    /// Tail the log file of a background process.
    pub async fn read_background_logs(
        &self,
        session: &SandboxSession,
        pid: &str,
        tail_lines: usize,
    ) -> Result<String, SandboxError> {
        let log_file = format!("{}/{}.log", BG_LOG_DIR, pid);
        let script = format!(
            "test -f {f} || exit 44; tail -n {n} {f}",
            f = shell_quote(&log_file),
            n = tail_lines,
        );
        let out = self
            .docker
            .exec_sh(&session.container_name, &script, WORKSPACE_DIR, self.config.timeout)
            .await?;
        if out.exit_code == 44 {
            return Err(SandboxError::LogMissing {
                pid: pid.to_string(),
            });
        }
        if !out.success() {
            return Err(SandboxError::Other(anyhow::anyhow!(
                "Failed to read background logs: {}",
                out.combined().trim()
            )));
        }
        Ok(out.stdout)
    }

    /// Stop a background process: graceful signal first, then a forceful
    /// kill. A process that is already gone counts as success.
    pub async fn stop_background_process(
        &self,
        session: &SandboxSession,
        pid: &str,
    ) -> Result<String, SandboxError> {
        let quoted = shell_quote(pid);
        let script = format!(
            "p={q}; if kill -0 \"$p\" 2>/dev/null; then \
               kill \"$p\" 2>/dev/null; sleep 0.2; \
               if kill -0 \"$p\" 2>/dev/null; then kill -9 \"$p\" 2>/dev/null; fi; \
               echo \"stopped $p\"; \
             else echo \"process $p already stopped\"; fi",
            q = quoted,
        );
        let out = self
            .docker
            .exec_sh(&session.container_name, &script, WORKSPACE_DIR, self.config.timeout)
            .await?;
        if !out.success() {
            return Err(SandboxError::Other(anyhow::anyhow!(
                "Failed to stop background process {}: {}",
                pid,
                out.combined().trim()
            )));
        }
        self.background
            .lock()
            .await
            .remove(&(session.container_name.clone(), pid.to_string()));
        Ok(out.stdout.trim().to_string())
    }

    /// Create a directory inside the session.
    pub async fn create_directory(
        &self,
        session: &SandboxSession,
        path: &str,
    ) -> Result<ExecResult, SandboxError> {
        let script = format!("mkdir -p {}", shell_quote(path));
        let out = self
            .docker
            .exec_sh(&session.container_name, &script, WORKSPACE_DIR, self.config.timeout)
            .await?;
        Ok(ExecResult {
            exit_code: out.exit_code,
            output: out.combined(),
            success: out.success(),
        })
    }

    /// Stop and remove the container for a workspace. Removing a container
    /// that doesn't exist is success. Not used by the workflow loop; exposed
    /// for operability.
    pub async fn remove_session(&self, workspace: &Path) -> Result<(), SandboxError> {
        let workspace = match std::fs::canonicalize(workspace) {
            Ok(p) => p,
            Err(_) => workspace.to_path_buf(),
        };
        let name = Self::container_name(&workspace);
        let out = self
            .docker
            .invoke(&["rm", "-f", &name], CONTAINER_START_TIMEOUT_SECS)
            .await?;
        if !out.success() && !out.stderr.contains("No such container") {
            return Err(SandboxError::Unreachable {
                workspace,
                message: format!("container remove failed: {}", out.combined().trim()),
            });
        }
        info!(container = %name, "sandbox removed");

        self.sessions.lock().await.remove(&workspace);
        self.background
            .lock()
            .await
            .retain(|(container, _), _| container != &name);
        Ok(())
    }

    /// Background processes currently registered for a session.
    pub async fn list_background_processes(
        &self,
        session: &SandboxSession,
    ) -> Vec<BackgroundProcess> {
        self.background
            .lock()
            .await
            .iter()
            .filter(|((container, _), _)| container == &session.container_name)
            .map(|(_, process)| process.clone())
            .collect()
    }
}

fn as_start_timeout(err: SandboxError) -> SandboxError {
    match err {
        SandboxError::CommandTimeout { seconds } => SandboxError::StartTimeout { seconds },
        other => other,
    }
}

/// Single-quote a string for safe embedding in an `sh -c` script.
fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

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

    /// Stub that records every invocation, answers `inspect` with the given
    /// body, and executes `exec` scripts locally so in-container behavior
    /// can be observed on the host.
    fn recording_stub(dir: &Path, calls: &Path, inspect_body: &str) -> PathBuf {
        create_stub(
            dir,
            "docker",
            &format!(
                "#!/bin/sh\necho \"$@\" >> {calls}\ncase \"$1\" in\n  inspect) {inspect} ;;\n  exec) exec sh -c \"$7\" ;;\n  *) ;;\nesac\n",
                calls = calls.display(),
                inspect = inspect_body,
            ),
        )
    }

    fn manager_with_stub(stub: &Path) -> SandboxManager {
        SandboxManager::new(
            DockerCli::new(stub.to_string_lossy()),
            SandboxConfig::default(),
        )
    }

    #[test]
    fn test_container_names_are_stable_per_workspace() {
        let a = SandboxManager::container_name(Path::new("/tmp/project-a"));
        let b = SandboxManager::container_name(Path::new("/tmp/project-a"));
        let c = SandboxManager::container_name(Path::new("/tmp/project-b"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("anvil-sbx-"));
        assert_eq!(a.len(), "anvil-sbx-".len() + 12);
    }

    #[test]
    fn test_shell_quote_embedded_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[tokio::test]
    async fn test_ensure_session_reuses_running_container() {
        let dir = tempfile::tempdir().unwrap();
        let calls = dir.path().join("calls.log");
        let stub = recording_stub(dir.path(), &calls, "echo true");
        let manager = manager_with_stub(&stub);
        let workspace = dir.path().join("ws");

        let first = manager.ensure_session(&workspace).await.unwrap();
        let second = manager.ensure_session(&workspace).await.unwrap();
        assert_eq!(first.container_name, second.container_name);

        let recorded = fs::read_to_string(&calls).unwrap();
        assert!(!recorded.contains("run -d"), "should not create: {}", recorded);
        assert!(!recorded.contains("start"), "should not restart: {}", recorded);
    }

    #[tokio::test]
    async fn test_ensure_session_restarts_stopped_container() {
        let dir = tempfile::tempdir().unwrap();
        let calls = dir.path().join("calls.log");
        let stub = recording_stub(dir.path(), &calls, "echo false");
        let manager = manager_with_stub(&stub);
        let workspace = dir.path().join("ws");

        let session = manager.ensure_session(&workspace).await.unwrap();

        let recorded = fs::read_to_string(&calls).unwrap();
        assert!(recorded.contains(&format!("start {}", session.container_name)));
        assert!(!recorded.contains("run -d"));
    }

    #[tokio::test]
    async fn test_ensure_session_creates_missing_container() {
        let dir = tempfile::tempdir().unwrap();
        let calls = dir.path().join("calls.log");
        let stub = recording_stub(dir.path(), &calls, "exit 1");
        let manager = manager_with_stub(&stub);
        let workspace = dir.path().join("ws");

        let session = manager.ensure_session(&workspace).await.unwrap();
        assert!(workspace.exists(), "workspace dir should be created");

        let recorded = fs::read_to_string(&calls).unwrap();
        assert!(recorded.contains(&format!("run -d --name {}", session.container_name)));
        assert!(recorded.contains(":/workspace"));
        assert!(recorded.contains("--memory 1g"));
        assert!(recorded.contains("--cpus 2"));
        assert!(recorded.contains("python:3.12-slim sleep infinity"));
    }

    #[tokio::test]
    async fn test_ensure_session_unreachable_when_create_fails() {
        let dir = tempfile::tempdir().unwrap();
        let stub = create_stub(
            dir.path(),
            "docker",
            "#!/bin/sh\ncase \"$1\" in\n  inspect) exit 1 ;;\n  run) echo 'no space left' >&2; exit 125 ;;\nesac\n",
        );
        let manager = manager_with_stub(&stub);
        let workspace = dir.path().join("ws");

        let err = manager.ensure_session(&workspace).await.unwrap_err();
        match err {
            SandboxError::Unreachable { message, .. } => {
                assert!(message.contains("no space left"), "got: {}", message);
            }
            other => panic!("expected Unreachable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_command_reports_exit_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let calls = dir.path().join("calls.log");
        let stub = recording_stub(dir.path(), &calls, "echo true");
        let manager = manager_with_stub(&stub);
        let session = manager.ensure_session(&dir.path().join("ws")).await.unwrap();

        let ok = manager
            .run_command(&session, "echo hello", None)
            .await
            .unwrap();
        assert!(ok.success);
        assert_eq!(ok.exit_code, 0);
        assert!(ok.output.contains("hello"));

        let failed = manager
            .run_command(&session, "echo boom >&2; exit 2", None)
            .await
            .unwrap();
        assert!(!failed.success);
        assert_eq!(failed.exit_code, 2);
        assert!(failed.output.contains("boom"));
    }

    #[tokio::test]
    async fn test_background_process_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let calls = dir.path().join("calls.log");
        let stub = recording_stub(dir.path(), &calls, "echo true");
        let manager = manager_with_stub(&stub);
        let session = manager.ensure_session(&dir.path().join("ws")).await.unwrap();

        let process = manager
            .start_background_process(&session, "sleep 30", None)
            .await
            .unwrap();
        assert!(process.pid.parse::<u32>().is_ok(), "pid: {}", process.pid);
        assert_eq!(
            process.log_file,
            format!("{}/{}.log", BG_LOG_DIR, process.pid)
        );

        // The process has produced no output yet; the log exists but is empty.
        let logs = manager
            .read_background_logs(&session, &process.pid, 10)
            .await
            .unwrap();
        assert_eq!(logs, "");

        let registered = manager.list_background_processes(&session).await;
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].command, "sleep 30");

        let stopped = manager
            .stop_background_process(&session, &process.pid)
            .await
            .unwrap();
        assert!(stopped.contains("stopped"), "got: {}", stopped);
        assert!(manager.list_background_processes(&session).await.is_empty());

        // Stopping again is still success.
        let again = manager
            .stop_background_process(&session, &process.pid)
            .await
            .unwrap();
        assert!(again.contains("already stopped"), "got: {}", again);

        // The stub ran the launch script locally, so tidy up the host log.
        let _ = fs::remove_file(format!("{}/{}.log", BG_LOG_DIR, process.pid));
    }

    #[tokio::test]
    async fn test_read_background_logs_missing_pid() {
        let dir = tempfile::tempdir().unwrap();
        let calls = dir.path().join("calls.log");
        let stub = recording_stub(dir.path(), &calls, "echo true");
        let manager = manager_with_stub(&stub);
        let session = manager.ensure_session(&dir.path().join("ws")).await.unwrap();

        let err = manager
            .read_background_logs(&session, "999999999", 10)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::LogMissing { .. }));
    }

    #[tokio::test]
    async fn test_stop_accepts_non_numeric_pid_as_gone() {
        let dir = tempfile::tempdir().unwrap();
        let calls = dir.path().join("calls.log");
        let stub = recording_stub(dir.path(), &calls, "echo true");
        let manager = manager_with_stub(&stub);
        let session = manager.ensure_session(&dir.path().join("ws")).await.unwrap();

        let output = manager
            .stop_background_process(&session, "not-a-pid")
            .await
            .unwrap();
        assert!(output.contains("already stopped"), "got: {}", output);
    }

    #[tokio::test]
    async fn test_create_directory() {
        let dir = tempfile::tempdir().unwrap();
        let calls = dir.path().join("calls.log");
        let stub = recording_stub(dir.path(), &calls, "echo true");
        let manager = manager_with_stub(&stub);
        let session = manager.ensure_session(&dir.path().join("ws")).await.unwrap();

        // The stub executes locally, so use a host path to observe the result.
        let target = dir.path().join("nested").join("deep");
        let result = manager
            .create_directory(&session, &target.to_string_lossy())
            .await
            .unwrap();
        assert!(result.success);
        assert!(target.is_dir());
    }

    #[tokio::test]
    async fn test_remove_session_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let calls = dir.path().join("calls.log");
        let stub = create_stub(
            dir.path(),
            "docker",
            &format!(
                "#!/bin/sh\necho \"$@\" >> {}\ncase \"$1\" in\n  inspect) echo true ;;\n  rm) echo 'Error: No such container' >&2; exit 1 ;;\nesac\n",
                calls.display()
            ),
        );
        let manager = manager_with_stub(&stub);
        let workspace = dir.path().join("ws");
        manager.ensure_session(&workspace).await.unwrap();

        // The stub reports the container as already gone; still success.
        manager.remove_session(&workspace).await.unwrap();
        let recorded = fs::read_to_string(&calls).unwrap();
        assert!(recorded.contains("rm -f anvil-sbx-"));
    }
}
