//! Resumable workflow state machine.
//!
//! The machine walks Architect → Planner → Executor → Reviewer and routes
//! each verdict to advance, retry, or abort, checkpointing the state after
//! every node so any thread can resume from its latest checkpoint.

pub mod machine;
pub mod runner;
pub mod state;

pub use machine::{RunOutcome, WorkflowNode};
pub use runner::{CheckpointMeta, RunOptions, RunReport, RunStatus, WorkflowRunner, decode_checkpoint};
pub use state::WorkflowState;
