//! Workflow runner.
//!
//! Sequences the nodes of the state machine, checkpointing after every
//! node's output so a crash between any two nodes resumes exactly at the
//! next node. Failures inside a node are caught at the node boundary and
//! folded into the state; the only errors a caller sees are checkpoint
//! store failures, which break resumability and must surface.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::agents::{Coder, PlanResponse, Planner, Reviewer};
use crate::errors::WorkflowError;
use crate::executor::StepExecutor;
use crate::models::{DevelopmentPlan, Review, Step};
use crate::review::ReviewGate;
use crate::sandbox::SandboxManager;
use crate::store::{Checkpoint, DbHandle};

use super::machine::{RunOutcome, WorkflowNode};
use super::state::WorkflowState;

/// Marker file the Architect node writes into a prepared workspace.
const INIT_MARKER: &str = ".anvil-init";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Aborted,
    Paused,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Aborted => "ABORTED",
            Self::Paused => "PAUSED",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a finished (or paused) drive hands back to the caller.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub thread_id: String,
    pub status: RunStatus,
    pub state: WorkflowState,
}

/// Metadata stored alongside every checkpoint: which node produced the
/// state and where the plan stood.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub node: String,
    pub step_index: usize,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Caller-supplied thread id; defaults to `plan-{plan_id}`.
    pub thread: Option<String>,
    /// Pause with a checkpoint before the next execution attempt.
    pub pause_before_execute: bool,
}

pub struct WorkflowRunner {
    db: DbHandle,
    planner: Arc<dyn Planner>,
    executor: StepExecutor,
    review_gate: ReviewGate,
    sandbox: SandboxManager,
    max_retries: u32,
}

impl WorkflowRunner {
    pub fn new(
        db: DbHandle,
        planner: Arc<dyn Planner>,
        coder: Arc<dyn Coder>,
        reviewer: Arc<dyn Reviewer>,
        sandbox: SandboxManager,
        max_retries: u32,
    ) -> Self {
        Self {
            db,
            planner,
            executor: StepExecutor::new(coder, sandbox.clone()),
            review_gate: ReviewGate::new(reviewer),
            sandbox,
            max_retries,
        }
    }

    /// Start a fresh run: plan the request, then drive the machine from
    /// the Architect node under a new thread id.
    pub async fn start(
        &self,
        request: &str,
        project_path: &Path,
        options: RunOptions,
    ) -> Result<RunReport> {
        let project_path = project_path.to_string_lossy().to_string();
        let plan = self.request_plan(request, &project_path).await;
        self.persist_plan(&plan).await;

        let thread_id = options
            .thread
            .clone()
            .unwrap_or_else(|| format!("plan-{}", plan.id));
        info!(%thread_id, steps = plan.steps.len(), "starting run");

        let state = WorkflowState::new(plan);
        self.drive(
            &thread_id,
            state,
            WorkflowNode::Architect,
            options.pause_before_execute,
            false,
        )
        .await
    }

    /// Continue a thread from its latest checkpoint, at the node after
    /// the one that produced it. Feedback, if given, reaches the Coder on
    /// the next execution attempt.
    pub async fn resume(
        &self,
        thread_id: &str,
        feedback: Option<String>,
        pause_before_execute: bool,
    ) -> Result<RunReport> {
        let (mut state, last_node) = self.load_head(thread_id).await?;
        if let Some(feedback) = feedback {
            state = state.with_feedback(feedback);
        }
        let next = last_node.next(&state, self.max_retries);
        info!(%thread_id, after = %last_node, resume_at = %next, "resuming run");
        // The entry node runs even when pausing is requested again;
        // resuming into an immediate pause would make no progress.
        self.drive(thread_id, state, next, pause_before_execute, true)
            .await
    }

    /// Load and deserialize the latest checkpoint of a thread.
    pub async fn load_head(
        &self,
        thread_id: &str,
    ) -> Result<(WorkflowState, WorkflowNode), WorkflowError> {
        let tid = thread_id.to_string();
        let checkpoint = self
            .db
            .call(move |db| db.latest_checkpoint(&tid))
            .await
            .map_err(WorkflowError::Store)?
            .ok_or_else(|| WorkflowError::ThreadNotFound {
                thread_id: thread_id.to_string(),
            })?;

        let (state, meta) = decode_checkpoint(&checkpoint)?;
        let node = meta
            .node
            .parse::<WorkflowNode>()
            .map_err(|e| WorkflowError::Other(anyhow!(e)))?;
        Ok((state, node))
    }

    async fn drive(
        &self,
        thread_id: &str,
        mut state: WorkflowState,
        mut node: WorkflowNode,
        pause_before_execute: bool,
        skip_entry_pause: bool,
    ) -> Result<RunReport> {
        let mut entry = true;
        loop {
            if let WorkflowNode::End(outcome) = node {
                let status = match outcome {
                    RunOutcome::Success => RunStatus::Success,
                    RunOutcome::Abort => RunStatus::Aborted,
                };
                info!(%thread_id, %status, "run finished");
                return Ok(RunReport {
                    thread_id: thread_id.to_string(),
                    status,
                    state,
                });
            }

            if node == WorkflowNode::Executor
                && pause_before_execute
                && !(entry && skip_entry_pause)
            {
                self.checkpoint(thread_id, &state, WorkflowNode::HumanPause)
                    .await?;
                info!(%thread_id, "paused before execution");
                return Ok(RunReport {
                    thread_id: thread_id.to_string(),
                    status: RunStatus::Paused,
                    state,
                });
            }
            entry = false;

            state = self.run_node(node, state).await;
            self.checkpoint(thread_id, &state, node).await?;
            node = node.next(&state, self.max_retries);
        }
    }

    /// Run one node, catching any failure at the boundary.
    async fn run_node(&self, node: WorkflowNode, state: WorkflowState) -> WorkflowState {
        debug!(node = %node, step = state.current_step_index, "running node");
        match self.apply_node(node, state.clone()).await {
            Ok(next_state) => next_state,
            Err(e) => {
                warn!(node = %node, error = %e, "node failed");
                state.with_node_error(format!("{} failed: {:#}", node, e))
            }
        }
    }

    async fn apply_node(&self, node: WorkflowNode, state: WorkflowState) -> Result<WorkflowState> {
        match node {
            WorkflowNode::Architect => self.run_architect(state).await,
            WorkflowNode::Planner => self.run_planner(state).await,
            WorkflowNode::Executor => self.run_executor(state).await,
            WorkflowNode::Reviewer => self.run_reviewer(state).await,
            WorkflowNode::RetryHandler => Ok(self.run_retry(state)),
            WorkflowNode::NextStepHandler => Ok(self.run_next_step(state)),
            WorkflowNode::HumanPause | WorkflowNode::End(_) => Ok(state),
        }
    }

    /// Prepare the workspace and warm the sandbox. A marked workspace is
    /// a pass-through, so re-running against the same path is idempotent.
    async fn run_architect(&self, state: WorkflowState) -> Result<WorkflowState> {
        let workspace = PathBuf::from(&state.project_path);
        let marker = workspace.join(INIT_MARKER);
        if marker.exists() {
            debug!(workspace = %workspace.display(), "workspace already prepared");
            return Ok(state);
        }

        std::fs::create_dir_all(&workspace)
            .with_context(|| format!("Failed to create workspace {}", workspace.display()))?;
        std::fs::write(
            &marker,
            format!("prepared {}\n", Utc::now().to_rfc3339()),
        )
        .context("Failed to write workspace marker")?;

        // Warming is an optimization; the executor resolves the session
        // again and reports the real error if this fails now.
        if let Err(e) = self.sandbox.ensure_session(&workspace).await {
            warn!(error = %e, "sandbox warm-up failed");
        }
        Ok(state)
    }

    /// Pass through when a usable plan is already in hand; otherwise ask
    /// the Planner collaborator for a new one.
    async fn run_planner(&self, state: WorkflowState) -> Result<WorkflowState> {
        if !state.plan.steps.is_empty() {
            return Ok(state);
        }
        let plan = self
            .request_plan(&state.plan.original_request, &state.project_path)
            .await;
        self.persist_plan(&plan).await;
        Ok(state.with_plan(plan))
    }

    async fn run_executor(&self, state: WorkflowState) -> Result<WorkflowState> {
        let task = {
            let step = state
                .current_step()
                .ok_or(WorkflowError::StepIndexOutOfRange {
                    index: state.current_step_index,
                    len: state.plan.steps.len(),
                })?;
            build_task(
                step,
                state.review.as_ref(),
                state.retry_count,
                state.human_feedback.as_deref(),
            )
        };

        let workspace = PathBuf::from(&state.project_path);
        let outcome = self.executor.execute_step(&task, &workspace).await;
        info!(
            step = state.current_step_index,
            attempt = state.retry_count + 1,
            success = outcome.success,
            "execution attempt finished"
        );
        let state = state.with_execution(&outcome);
        self.persist_current_step(&state).await;
        Ok(state)
    }

    async fn run_reviewer(&self, state: WorkflowState) -> Result<WorkflowState> {
        let (description, result) = {
            let step = state
                .current_step()
                .ok_or(WorkflowError::StepIndexOutOfRange {
                    index: state.current_step_index,
                    len: state.plan.steps.len(),
                })?;
            (step.description.clone(), step.result.clone())
        };

        let workspace = PathBuf::from(&state.project_path);
        let review = self
            .review_gate
            .review_step(&description, &workspace, &state.modified_files, &result)
            .await;
        info!(
            step = state.current_step_index,
            verdict = %review.verdict,
            "review verdict"
        );
        let state = state.with_review(review, self.max_retries);
        self.persist_current_step(&state).await;
        Ok(state)
    }

    fn run_retry(&self, state: WorkflowState) -> WorkflowState {
        info!(
            step = state.current_step_index,
            next_attempt = state.retry_count + 2,
            "retrying step with reviewer feedback"
        );
        state.with_retry()
    }

    fn run_next_step(&self, state: WorkflowState) -> WorkflowState {
        let state = state.advanced();
        info!(
            step = state.current_step_index,
            total = state.plan.steps.len(),
            "advancing"
        );
        state
    }

    /// Ask the Planner collaborator for a plan, falling back to a single
    /// direct-attempt step when the response is unusable or empty.
    async fn request_plan(&self, request: &str, project_path: &str) -> DevelopmentPlan {
        let response = match self.planner.plan(request, project_path).await {
            Ok(response) if !response.steps.is_empty() => response,
            Ok(_) => {
                warn!("planner returned an empty plan; using fallback step");
                PlanResponse::fallback(request)
            }
            Err(e) => {
                warn!(error = %e, "planner failed; using fallback step");
                PlanResponse::fallback(request)
            }
        };
        DevelopmentPlan::new(request, project_path, response.into_steps())
    }

    /// Best-effort plan persistence; the run continues without it.
    async fn persist_plan(&self, plan: &DevelopmentPlan) {
        let plan = plan.clone();
        if let Err(e) = self.db.call(move |db| db.create_plan(&plan)).await {
            warn!(error = %e, "plan persistence failed");
        }
    }

    /// Best-effort step persistence after execution and review.
    async fn persist_current_step(&self, state: &WorkflowState) {
        let Some(step) = state.current_step() else {
            return;
        };
        let id = step.id;
        let status = step.status;
        let result = step.result.clone();
        let logs = step.logs.clone();
        if let Err(e) = self
            .db
            .call(move |db| db.update_step(&id, &status, &result, &logs))
            .await
        {
            warn!(error = %e, "step persistence failed");
        }
    }

    async fn checkpoint(
        &self,
        thread_id: &str,
        state: &WorkflowState,
        node: WorkflowNode,
    ) -> Result<String> {
        let meta = CheckpointMeta {
            node: node.as_str().to_string(),
            step_index: state.current_step_index,
        };
        let state_json =
            serde_json::to_string(state).context("Failed to serialize workflow state")?;
        let meta_json =
            serde_json::to_string(&meta).context("Failed to serialize checkpoint metadata")?;
        let tid = thread_id.to_string();
        let checkpoint_id = self
            .db
            .call(move |db| db.put_checkpoint(&tid, &state_json, &meta_json))
            .await
            .context("Failed to write checkpoint")?;
        debug!(%thread_id, node = %node, %checkpoint_id, "checkpoint written");
        Ok(checkpoint_id)
    }
}

/// Decode a stored checkpoint row into its state and metadata.
pub fn decode_checkpoint(
    checkpoint: &Checkpoint,
) -> Result<(WorkflowState, CheckpointMeta), WorkflowError> {
    let state: WorkflowState = serde_json::from_str(&checkpoint.state).map_err(|source| {
        WorkflowError::CheckpointCorrupt {
            thread_id: checkpoint.thread_id.clone(),
            source,
        }
    })?;
    let meta: CheckpointMeta = serde_json::from_str(&checkpoint.metadata).map_err(|source| {
        WorkflowError::CheckpointCorrupt {
            thread_id: checkpoint.thread_id.clone(),
            source,
        }
    })?;
    Ok((state, meta))
}

/// The task text sent to the Coder: the step description, the prior
/// Reviewer justification on a retry, and any injected human feedback.
fn build_task(
    step: &Step,
    review: Option<&Review>,
    retry_count: u32,
    feedback: Option<&str>,
) -> String {
    let mut task = step.description.clone();
    if retry_count > 0
        && let Some(review) = review
        && !review.justification.is_empty()
    {
        task.push_str(&format!(
            "\n\nThe previous attempt failed review. Reviewer feedback:\n{}",
            review.justification
        ));
    }
    if let Some(feedback) = feedback {
        task.push_str(&format!("\n\nHuman feedback:\n{}", feedback));
    }
    task
}
