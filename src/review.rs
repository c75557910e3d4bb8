//! Review Gate.
//!
//! Gathers code context from the last execution attempt and asks the
//! Reviewer collaborator for a verdict. A collaborator that cannot be
//! reached or cannot be parsed becomes a `FAIL` verdict with the failure
//! in the justification, so the orchestrator only ever routes on verdicts.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::agents::Reviewer;
use crate::models::Review;

/// How many modified files the Reviewer gets to see.
const MAX_CONTEXT_FILES: usize = 3;
/// Per-file character cap for the Reviewer context.
const MAX_FILE_CHARS: usize = 2000;

pub struct ReviewGate {
    reviewer: Arc<dyn Reviewer>,
}

impl ReviewGate {
    pub fn new(reviewer: Arc<dyn Reviewer>) -> Self {
        Self { reviewer }
    }

    /// Judge one execution attempt. Never errors: an unusable Reviewer is
    /// itself a failing verdict.
    pub async fn review_step(
        &self,
        task_description: &str,
        workspace: &Path,
        modified_files: &[String],
        execution_logs: &str,
    ) -> Review {
        let code_context = gather_code_context(workspace, modified_files);
        debug!(files = modified_files.len(), "requesting review");

        match self
            .reviewer
            .review(task_description, &code_context, execution_logs)
            .await
        {
            Ok(review) => review,
            Err(e) => {
                warn!(error = %e, "reviewer call failed");
                Review::fail(format!("Reviewer unavailable: {}", e))
            }
        }
    }
}

/// Read up to [`MAX_CONTEXT_FILES`] of the modified files from the host
/// workspace, truncating each to [`MAX_FILE_CHARS`] characters.
fn gather_code_context(workspace: &Path, modified_files: &[String]) -> String {
    if modified_files.is_empty() {
        return "No files were written in this attempt; judge from the execution logs.".to_string();
    }

    let mut sections = Vec::new();
    for filename in modified_files.iter().take(MAX_CONTEXT_FILES) {
        let path = workspace.join(filename);
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                let truncated: String = content.chars().take(MAX_FILE_CHARS).collect();
                let marker = if content.chars().count() > MAX_FILE_CHARS {
                    "\n[truncated]"
                } else {
                    ""
                };
                sections.push(format!("=== {} ===\n{}{}", filename, truncated, marker));
            }
            Err(e) => {
                sections.push(format!("=== {} ===\n[unreadable: {}]", filename, e));
            }
        }
    }
    if modified_files.len() > MAX_CONTEXT_FILES {
        sections.push(format!(
            "({} more file(s) not shown)",
            modified_files.len() - MAX_CONTEXT_FILES
        ));
    }
    sections.join("\n\n")
}
