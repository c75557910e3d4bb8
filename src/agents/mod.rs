//! External collaborator boundary.
//!
//! The Planner, Coder, and Reviewer are black boxes that turn natural
//! language into structured data. The traits here are the seam: the shipped
//! implementation drives a local `claude`-style CLI, and the workflow tests
//! substitute in-process fakes.

pub mod claude;
pub mod parse;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::CollaboratorError;
use crate::models::{AgentRole, Review, Step};

pub use claude::ClaudeCli;

/// Produces an ordered plan for a request.
/// Real implementation: `ClaudeCli`. Test double: fake planners in the
/// workflow tests.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(
        &self,
        request: &str,
        project_path: &str,
    ) -> Result<PlanResponse, CollaboratorError>;
}

/// Turns one task description into file writes plus an optional
/// verification command.
#[async_trait]
pub trait Coder: Send + Sync {
    async fn execute(&self, task: &str) -> Result<CoderResponse, CollaboratorError>;
}

/// Judges one execution attempt from the task, the written code, and the
/// execution logs.
#[async_trait]
pub trait Reviewer: Send + Sync {
    async fn review(
        &self,
        task_description: &str,
        code_context: &str,
        execution_logs: &str,
    ) -> Result<Review, CollaboratorError>;
}

/// Planner output: an ordered list of step blueprints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanResponse {
    pub steps: Vec<PlannedStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedStep {
    pub description: String,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "FULLSTACK".to_string()
}

impl PlanResponse {
    /// Convert the blueprint into domain steps. An unknown role string
    /// downgrades that step to FULLSTACK instead of failing the plan.
    pub fn into_steps(self) -> Vec<Step> {
        self.steps
            .into_iter()
            .map(|planned| {
                let role = planned.role.parse().unwrap_or(AgentRole::Fullstack);
                Step::new(planned.description, role)
            })
            .collect()
    }

    /// Minimum-viable plan used when the Planner is unreachable or returns
    /// nothing usable, so the run proceeds into the normal retry loop.
    pub fn fallback(request: &str) -> Self {
        Self {
            steps: vec![PlannedStep {
                description: format!("Diagnosis failed; attempt the task directly: {}", request),
                role: "FULLSTACK".to_string(),
            }],
        }
    }
}

/// Coder output: files to write, then at most one command to run.
/// No command at all means the step succeeds without verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoderResponse {
    #[serde(default)]
    pub files: Vec<FileWrite>,
    #[serde(default)]
    pub command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileWrite {
    pub filename: String,
    pub content: String,
}

/// Raw reviewer output before the verdict string is validated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewResponse {
    pub verdict: String,
    #[serde(default)]
    pub justification: String,
}

impl ReviewResponse {
    pub fn into_review(self) -> anyhow::Result<Review> {
        let verdict = self.verdict.parse().map_err(|e: String| anyhow::anyhow!(e))?;
        Ok(Review {
            verdict,
            justification: self.justification,
        })
    }
}
