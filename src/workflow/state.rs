//! Serializable workflow state.
//!
//! `WorkflowState` is the value threaded through the state machine: each
//! node consumes a state and returns a new one, and the checkpoint store
//! records every successive value. The transforms here are the only place
//! step status, retry bookkeeping, and the retry history format are
//! decided; the runner just sequences them.

use serde::{Deserialize, Serialize};

use crate::executor::ExecutionOutcome;
use crate::models::{DevelopmentPlan, Review, Step, StepStatus};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowState {
    pub plan: DevelopmentPlan,
    pub current_step_index: usize,
    pub retry_count: u32,
    /// Verdict for the most recent execution attempt of the current step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<Review>,
    /// Files written by the most recent execution attempt.
    #[serde(default)]
    pub modified_files: Vec<String>,
    pub project_path: String,
    /// Failure captured at a node boundary, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Feedback injected on resume, consumed by the next execution attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_feedback: Option<String>,
}

impl WorkflowState {
    pub fn new(plan: DevelopmentPlan) -> Self {
        Self {
            project_path: plan.project_path.clone(),
            plan,
            current_step_index: 0,
            retry_count: 0,
            review: None,
            modified_files: Vec::new(),
            error: None,
            human_feedback: None,
        }
    }

    pub fn current_step(&self) -> Option<&Step> {
        self.plan.steps.get(self.current_step_index)
    }

    /// True once every step has been passed.
    pub fn is_complete(&self) -> bool {
        self.current_step_index >= self.plan.steps.len()
    }

    /// Replace the plan, restarting step tracking from the top.
    pub fn with_plan(mut self, plan: DevelopmentPlan) -> Self {
        self.project_path = plan.project_path.clone();
        self.plan = plan;
        self.current_step_index = 0;
        self.retry_count = 0;
        self.review = None;
        self.modified_files.clear();
        self.error = None;
        self
    }

    /// Record one execution attempt of the current step. The attempt's
    /// output becomes the step result; resume feedback is consumed here.
    pub fn with_execution(mut self, outcome: &ExecutionOutcome) -> Self {
        self.modified_files = outcome.modified_files.clone();
        self.error = None;
        self.human_feedback = None;
        if let Some(step) = self.plan.steps.get_mut(self.current_step_index) {
            step.status = StepStatus::InProgress;
            step.result = outcome.output_log.clone();
        }
        self
    }

    /// Record the verdict for the attempt just reviewed.
    ///
    /// A failing verdict appends an `ATTEMPT {n} FAILED` entry with the
    /// execution output and the justification to the step log, and marks
    /// the step `FAILED` when no attempts remain (`max_retries` bounds
    /// attempts per step; the attempt just reviewed is `retry_count + 1`).
    pub fn with_review(mut self, review: Review, max_retries: u32) -> Self {
        let attempt = self.retry_count + 1;
        let exhausted = attempt >= max_retries;
        if let Some(step) = self.plan.steps.get_mut(self.current_step_index) {
            if review.passed() {
                step.status = StepStatus::Completed;
            } else {
                let mut entry = format!("ATTEMPT {} FAILED\n{}", attempt, step.result);
                if !review.justification.is_empty() {
                    entry.push('\n');
                    entry.push_str(&review.justification);
                }
                step.append_log(&entry);
                if exhausted {
                    step.status = StepStatus::Failed;
                }
            }
        }
        self.review = Some(review);
        self
    }

    /// Another attempt of the same step is about to run.
    pub fn with_retry(mut self) -> Self {
        self.retry_count += 1;
        self
    }

    /// Move on to the next step. Retry bookkeeping and the verdict reset;
    /// `modified_files` keeps the last attempt's writes until the next
    /// execution overwrites them.
    pub fn advanced(mut self) -> Self {
        if self.current_step_index < self.plan.steps.len() {
            self.current_step_index += 1;
        }
        self.retry_count = 0;
        self.review = None;
        self
    }

    /// Record a failure caught at a node boundary. The current step is
    /// marked `FAILED` so a terminal state always explains itself.
    pub fn with_node_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        if let Some(step) = self.plan.steps.get_mut(self.current_step_index) {
            step.status = StepStatus::Failed;
        }
        self
    }

    /// Attach human feedback for the next execution attempt, keeping a
    /// copy in the step log.
    pub fn with_feedback(mut self, feedback: impl Into<String>) -> Self {
        let feedback = feedback.into();
        if let Some(step) = self.plan.steps.get_mut(self.current_step_index) {
            step.append_log(&format!("HUMAN FEEDBACK\n{}", feedback));
        }
        self.human_feedback = Some(feedback);
        self
    }
}
