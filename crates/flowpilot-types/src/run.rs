//! Run and node-state types.
//!
//! A `Run` is one execution attempt of a workflow definition. It is persisted
//! after every node transition, so everything the engine needs to pick a run
//! back up (node states, context, checkpoint) lives on this struct.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Node state
// ---------------------------------------------------------------------------

/// Status of a single node within a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Queued,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted status/attempt/timing record for one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    pub status: NodeStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,
}

impl NodeState {
    pub fn queued() -> Self {
        Self::default()
    }

    /// Clear everything a previous attempt recorded and go back to `queued`.
    pub fn reset(&mut self) {
        *self = Self::queued();
    }
}

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// Overall status of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    WaitingApproval,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::WaitingApproval => "WAITING_APPROVAL",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Logs and artifacts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Structured run log entry. Node transitions use `event` values `start`,
/// `succeeded`, `failed`, `skipped`, `retry`, and `waiting_approval`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLogEntry {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub event: String,
    pub message: String,
}

impl RunLogEntry {
    pub fn node(level: LogLevel, node_id: &str, event: &str, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            level,
            node_id: Some(node_id.to_string()),
            event: event.to_string(),
            message: message.into(),
        }
    }

    pub fn run(level: LogLevel, event: &str, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            level,
            node_id: None,
            event: event.to_string(),
            message: message.into(),
        }
    }
}

/// Failure state captured by a handler after a failed attempt (e.g. a screenshot).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub node_id: String,
    pub kind: String,
    pub attempt: u32,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// One execution attempt of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: Uuid,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_version: Option<u32>,
    #[serde(default)]
    pub test_mode: bool,
    pub status: RunStatus,
    #[serde(default)]
    pub node_states: BTreeMap<String, NodeState>,
    /// Serialized execution context.
    #[serde(default)]
    pub context: Value,
    /// Caller-supplied input, merged over the context on every (re)start.
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub logs: Vec<RunLogEntry>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from_run_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    /// A fresh `PENDING` run with no node states.
    pub fn new(workflow_id: impl Into<String>, input: Value, test_mode: bool) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            workflow_id: workflow_id.into(),
            workflow_version: None,
            test_mode,
            status: RunStatus::Pending,
            node_states: BTreeMap::new(),
            context: Value::Null,
            input,
            logs: Vec::new(),
            artifacts: Vec::new(),
            checkpoint_node_id: None,
            resume_from_run_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.node_states.get(node_id).map(|s| s.status)
    }

    /// Number of log entries with the given event for the given node.
    pub fn count_node_events(&self, node_id: &str, event: &str) -> usize {
        self.logs
            .iter()
            .filter(|l| l.event == event && l.node_id.as_deref() == Some(node_id))
            .count()
    }
}
