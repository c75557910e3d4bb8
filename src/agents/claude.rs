use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::parse;
use super::{Coder, CoderResponse, PlanResponse, Planner, ReviewResponse, Reviewer};
use crate::errors::CollaboratorError;
use crate::models::Review;

const PLANNER_SYSTEM_PROMPT: &str = r#"You are a software engineering planner. Break the given request into a short ordered list of concrete implementation steps.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "steps": [
    {
      "description": "Detailed instruction for one unit of work",
      "role": "TECH_LEAD" | "FULLSTACK" | "DEVOPS"
    }
  ]
}

Rules:
- Each step must be independently executable and verifiable.
- Use FULLSTACK for application code, DEVOPS for environment and tooling work, TECH_LEAD for cross-cutting design work.
- For simple requests, return a single step - don't over-decompose.
"#;

const CODER_SYSTEM_PROMPT: &str = r#"You are a software engineer working inside a persistent sandbox. Complete the given task by producing file contents and one verification command.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "files": [
    {"filename": "relative/path/to/file.py", "content": "full file content"}
  ],
  "command": "one shell command"
}

The command field supports these forms:
- A plain shell command, run to completion in the workspace.
- "BG_START:<command>" to start a long-running process in the background.
- "BG_LOG:<pid>" to read the recent output of a background process.
- "BG_STOP:<pid>" to stop a background process.
- "CREATE_DIRECTORY:<path>" to create a directory.

Rules:
- File paths are relative to the workspace root.
- Prefer a command that verifies your work (run the tests, run the script).
- Omit the command field entirely only when there is genuinely nothing to verify.
- If the task includes feedback from a failed attempt, fix the reported problem rather than repeating the same output.
"#;

const REVIEWER_SYSTEM_PROMPT: &str = r#"You are a strict code reviewer. Judge whether the execution attempt completed the task, using the code and the execution logs.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "verdict": "PASS" | "FAIL",
  "justification": "One or two sentences explaining the verdict"
}

Rules:
- A command that exited nonzero is a FAIL unless the task explicitly expected it.
- Judge what the task asked for, not style preferences.
- On FAIL, the justification must name the concrete problem so the next attempt can fix it.
"#;

/// Collaborator backed by a local `claude`-style CLI: prompt on argv, text
/// on stdout. The binary name is configurable so tests can substitute a
/// stub script.
#[derive(Debug, Clone)]
pub struct ClaudeCli {
    binary: String,
    timeout_secs: u64,
}

impl ClaudeCli {
    pub fn new(binary: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            binary: binary.into(),
            timeout_secs,
        }
    }

    async fn call(&self, system_prompt: &str, prompt: &str) -> Result<String, CollaboratorError> {
        debug!(cmd = %self.binary, prompt_len = prompt.len(), "calling collaborator");
        let child = Command::new(&self.binary)
            .args([
                "--print",
                "--output-format",
                "text",
                "-p",
                prompt,
                "--system",
                system_prompt,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CollaboratorError::SpawnFailed {
                cmd: self.binary.clone(),
                source,
            })?;

        let output = match timeout(Duration::from_secs(self.timeout_secs), child.wait_with_output())
            .await
        {
            Ok(result) => result.map_err(|e| {
                CollaboratorError::Other(anyhow::anyhow!(
                    "Failed to read collaborator output: {}",
                    e
                ))
            })?,
            Err(_) => {
                return Err(CollaboratorError::Timeout {
                    seconds: self.timeout_secs,
                });
            }
        };

        if !output.status.success() {
            return Err(CollaboratorError::NonZeroExit {
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn unusable(role: &str, err: anyhow::Error, raw: &str) -> CollaboratorError {
        CollaboratorError::Unusable {
            role: role.to_string(),
            message: format!("{}; raw response: {}", err, raw.trim()),
        }
    }
}

#[async_trait]
impl Planner for ClaudeCli {
    async fn plan(
        &self,
        request: &str,
        project_path: &str,
    ) -> Result<PlanResponse, CollaboratorError> {
        let prompt = format!(
            "Create an implementation plan for this request.\n\n\
             ## Request\n{}\n\n\
             ## Project path\n{}\n\n\
             Respond with JSON only.",
            request, project_path,
        );
        let raw = self.call(PLANNER_SYSTEM_PROMPT, &prompt).await?;
        parse::parse_response(&raw).map_err(|e| Self::unusable("Planner", e, &raw))
    }
}

#[async_trait]
impl Coder for ClaudeCli {
    async fn execute(&self, task: &str) -> Result<CoderResponse, CollaboratorError> {
        let raw = self.call(CODER_SYSTEM_PROMPT, task).await?;
        parse::parse_response(&raw).map_err(|e| Self::unusable("Coder", e, &raw))
    }
}

#[async_trait]
impl Reviewer for ClaudeCli {
    async fn review(
        &self,
        task_description: &str,
        code_context: &str,
        execution_logs: &str,
    ) -> Result<Review, CollaboratorError> {
        let prompt = format!(
            "Review this execution attempt.\n\n\
             ## Task\n{}\n\n\
             ## Code\n{}\n\n\
             ## Execution logs\n{}\n\n\
             Respond with JSON only.",
            task_description, code_context, execution_logs,
        );
        let raw = self.call(REVIEWER_SYSTEM_PROMPT, &prompt).await?;
        let response: ReviewResponse =
            parse::parse_response(&raw).map_err(|e| Self::unusable("Reviewer", e, &raw))?;
        response
            .into_review()
            .map_err(|e| Self::unusable("Reviewer", e, &raw))
    }
}
