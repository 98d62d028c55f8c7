//! Derived resume-run construction.
//!
//! Resuming never touches the failed run. It builds a **new** run whose node
//! states come from the source with every non-succeeded node reset to a clean
//! `queued` state; succeeded nodes are kept as-is so their handlers never run
//! again. Context, logs, and artifacts are copied verbatim.

use chrono::Utc;
use flowpilot_types::run::{NodeStatus, Run, RunStatus};
use uuid::Uuid;

pub fn build_resume_run(source: &Run, new_id: Uuid) -> Run {
    let mut node_states = source.node_states.clone();
    for state in node_states.values_mut() {
        if state.status != NodeStatus::Succeeded {
            state.reset();
        }
    }

    let now = Utc::now();
    Run {
        id: new_id,
        workflow_id: source.workflow_id.clone(),
        workflow_version: source.workflow_version,
        test_mode: source.test_mode,
        status: RunStatus::Pending,
        node_states,
        context: source.context.clone(),
        input: source.input.clone(),
        logs: source.logs.clone(),
        artifacts: source.artifacts.clone(),
        checkpoint_node_id: source.checkpoint_node_id.clone(),
        resume_from_run_id: Some(source.id),
        error: None,
        created_at: now,
        updated_at: now,
    }
}
