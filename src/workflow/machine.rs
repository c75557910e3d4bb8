//! Node set and routing for the workflow state machine.
//!
//! Routing is a pure function of the state a node produced; every side
//! effect lives in the runner. `max_retries` bounds execution attempts
//! per step: the attempt just reviewed is `retry_count + 1`, and a
//! failing verdict on the final attempt aborts the run.

use std::str::FromStr;

use super::state::WorkflowState;

/// How a finished run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowNode {
    Architect,
    Planner,
    Executor,
    Reviewer,
    RetryHandler,
    NextStepHandler,
    HumanPause,
    End(RunOutcome),
}

impl WorkflowNode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Architect => "Architect",
            Self::Planner => "Planner",
            Self::Executor => "Executor",
            Self::Reviewer => "Reviewer",
            Self::RetryHandler => "RetryHandler",
            Self::NextStepHandler => "NextStepHandler",
            Self::HumanPause => "HumanPause",
            Self::End(RunOutcome::Success) => "End(Success)",
            Self::End(RunOutcome::Abort) => "End(Abort)",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End(_))
    }

    /// The node that runs after this one produced `state`.
    pub fn next(&self, state: &WorkflowState, max_retries: u32) -> WorkflowNode {
        match self {
            Self::Architect => Self::Planner,
            Self::Planner => {
                if state.plan.steps.is_empty() {
                    Self::End(RunOutcome::Abort)
                } else if state.is_complete() {
                    Self::End(RunOutcome::Success)
                } else {
                    Self::Executor
                }
            }
            Self::Executor => Self::Reviewer,
            Self::Reviewer => match &state.review {
                Some(review) if review.passed() => Self::NextStepHandler,
                _ => {
                    if state.retry_count + 1 < max_retries {
                        Self::RetryHandler
                    } else {
                        Self::End(RunOutcome::Abort)
                    }
                }
            },
            Self::RetryHandler => Self::Executor,
            Self::NextStepHandler => {
                if state.is_complete() {
                    Self::End(RunOutcome::Success)
                } else {
                    Self::Executor
                }
            }
            Self::HumanPause => Self::Executor,
            Self::End(outcome) => Self::End(*outcome),
        }
    }
}

impl std::fmt::Display for WorkflowNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowNode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Architect" => Ok(Self::Architect),
            "Planner" => Ok(Self::Planner),
            "Executor" => Ok(Self::Executor),
            "Reviewer" => Ok(Self::Reviewer),
            "RetryHandler" => Ok(Self::RetryHandler),
            "NextStepHandler" => Ok(Self::NextStepHandler),
            "HumanPause" => Ok(Self::HumanPause),
            "End(Success)" => Ok(Self::End(RunOutcome::Success)),
            "End(Abort)" => Ok(Self::End(RunOutcome::Abort)),
            _ => Err(format!("Invalid workflow node: {}", s)),
        }
    }
}
