//! Typed error hierarchy for the Anvil workflow runner.
//!
//! One enum per subsystem:
//! - [`WorkflowError`]: state machine and checkpoint/resume failures
//! - [`SandboxError`]: sandbox infrastructure failures
//! - [`CollaboratorError`]: Planner/Coder/Reviewer call failures
//!
//! A command that merely exits nonzero is not an error anywhere in this
//! hierarchy; it is a normal `ExecResult` with `success == false`.

use thiserror::Error;

/// Errors from the workflow state machine and its checkpoint store.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("No checkpoints found for thread {thread_id}")]
    ThreadNotFound { thread_id: String },

    #[error("Checkpoint for thread {thread_id} does not deserialize: {source}")]
    CheckpointCorrupt {
        thread_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Step index {index} out of range for plan with {len} steps")]
    StepIndexOutOfRange { index: usize, len: usize },

    #[error("Checkpoint store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the sandbox infrastructure.
///
/// These mean the isolated environment itself could not be driven. The
/// step executor folds them into a failing outcome so they feed the
/// retry loop like any failing command, but logs them distinctly.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to spawn container runtime '{cmd}': {source}")]
    SpawnFailed {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Sandbox for {} is unreachable: {message}", .workspace.display())]
    Unreachable {
        workspace: std::path::PathBuf,
        message: String,
    },

    #[error("Sandbox session did not start within {seconds}s")]
    StartTimeout { seconds: u64 },

    #[error("Command did not finish within {seconds}s")]
    CommandTimeout { seconds: u64 },

    #[error("No log file for background process {pid}")]
    LogMissing { pid: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from an external collaborator call.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("Failed to spawn collaborator '{cmd}': {source}")]
    SpawnFailed {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Collaborator exited with code {exit_code}: {stderr}")]
    NonZeroExit { exit_code: i32, stderr: String },

    #[error("Collaborator did not answer within {seconds}s")]
    Timeout { seconds: u64 },

    #[error("{role} returned an unusable response: {message}")]
    Unusable { role: String, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
