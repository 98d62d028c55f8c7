//! Run lifecycle events delivered to the notifier.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A node that ended a run in `failed` state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedNode {
    pub node_id: String,
    pub error: Option<String>,
}

/// Typed lifecycle event. Serializes with an `event` tag carrying the
/// external event name (`run.started`, `run.failed`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum LifecycleEvent {
    #[serde(rename = "run.started", rename_all = "camelCase")]
    RunStarted { run_id: Uuid, workflow_id: String },

    #[serde(rename = "run.succeeded", rename_all = "camelCase")]
    RunSucceeded { run_id: Uuid, workflow_id: String },

    #[serde(rename = "run.failed", rename_all = "camelCase")]
    RunFailed {
        run_id: Uuid,
        workflow_id: String,
        error: Option<String>,
        failed_nodes: Vec<FailedNode>,
    },

    #[serde(rename = "run.waiting_approval", rename_all = "camelCase")]
    RunWaitingApproval {
        run_id: Uuid,
        workflow_id: String,
        node_id: String,
    },
}

impl LifecycleEvent {
    /// External event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run.started",
            Self::RunSucceeded { .. } => "run.succeeded",
            Self::RunFailed { .. } => "run.failed",
            Self::RunWaitingApproval { .. } => "run.waiting_approval",
        }
    }

    pub fn run_id(&self) -> Uuid {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::RunSucceeded { run_id, .. }
            | Self::RunFailed { run_id, .. }
            | Self::RunWaitingApproval { run_id, .. } => *run_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_tag_matches_name() {
        let event = LifecycleEvent::RunWaitingApproval {
            run_id: Uuid::nil(),
            workflow_id: "wf".into(),
            node_id: "approve".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], json!(event.name()));
        assert_eq!(value["nodeId"], json!("approve"));
    }

    #[test]
    fn failed_event_lists_nodes() {
        let event = LifecycleEvent::RunFailed {
            run_id: Uuid::nil(),
            workflow_id: "wf".into(),
            error: None,
            failed_nodes: vec![FailedNode {
                node_id: "b".into(),
                error: Some("boom".into()),
            }],
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], json!("run.failed"));
        assert_eq!(value["failedNodes"][0]["nodeId"], json!("b"));
    }
}
