use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of one plan step. Wire format is the uppercase form.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("Invalid step status: {}", s)),
        }
    }
}

/// Role a step is assigned to. Unknown role strings from the Planner
/// are mapped to `Fullstack` at parse time, not here.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentRole {
    TechLead,
    Fullstack,
    Devops,
    Reviewer,
    Architect,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TechLead => "TECH_LEAD",
            Self::Fullstack => "FULLSTACK",
            Self::Devops => "DEVOPS",
            Self::Reviewer => "REVIEWER",
            Self::Architect => "ARCHITECT",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TECH_LEAD" => Ok(Self::TechLead),
            "FULLSTACK" => Ok(Self::Fullstack),
            "DEVOPS" => Ok(Self::Devops),
            "REVIEWER" => Ok(Self::Reviewer),
            "ARCHITECT" => Ok(Self::Architect),
            _ => Err(format!("Invalid agent role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewVerdict {
    Pass,
    Fail,
}

impl ReviewVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
        }
    }
}

impl std::fmt::Display for ReviewVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewVerdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PASS" => Ok(Self::Pass),
            "FAIL" => Ok(Self::Fail),
            _ => Err(format!("Invalid review verdict: {}", s)),
        }
    }
}

/// Reviewer output: the verdict and the reasoning behind it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Review {
    pub verdict: ReviewVerdict,
    pub justification: String,
}

impl Review {
    pub fn pass(justification: impl Into<String>) -> Self {
        Self {
            verdict: ReviewVerdict::Pass,
            justification: justification.into(),
        }
    }

    pub fn fail(justification: impl Into<String>) -> Self {
        Self {
            verdict: ReviewVerdict::Fail,
            justification: justification.into(),
        }
    }

    pub fn passed(&self) -> bool {
        self.verdict == ReviewVerdict::Pass
    }
}

/// One unit of work. Status, result, and logs are mutated only by the
/// orchestrator; `logs` is append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: Uuid,
    pub description: String,
    pub role: AgentRole,
    pub status: StepStatus,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub logs: String,
}

impl Step {
    pub fn new(description: impl Into<String>, role: AgentRole) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            role,
            status: StepStatus::Pending,
            result: String::new(),
            logs: String::new(),
        }
    }

    /// Appends one entry to the step log, separated from prior content
    /// by a blank line.
    pub fn append_log(&mut self, entry: &str) {
        if !self.logs.is_empty() {
            self.logs.push_str("\n\n");
        }
        self.logs.push_str(entry);
    }
}

/// Ordered sequence of steps produced for one development request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DevelopmentPlan {
    pub id: Uuid,
    pub original_request: String,
    pub project_path: String,
    pub steps: Vec<Step>,
    pub created_at: DateTime<Utc>,
}

impl DevelopmentPlan {
    pub fn new(
        original_request: impl Into<String>,
        project_path: impl Into<String>,
        steps: Vec<Step>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            original_request: original_request.into(),
            project_path: project_path.into(),
            steps,
            created_at: Utc::now(),
        }
    }
}
