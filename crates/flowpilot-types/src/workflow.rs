//! Workflow definition types.
//!
//! A `WorkflowDefinition` is the immutable node/edge graph a run executes.
//! Nodes keep their raw `data` map on the wire; [`Node::kind`] parses that map
//! into a typed [`NodeKind`] for the built-in node types and falls back to
//! [`NodeKind::Action`] for everything else, so unknown action types still
//! round-trip untouched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Node type names
// ---------------------------------------------------------------------------

pub const START: &str = "start";
pub const SET_VARIABLE: &str = "set_variable";
pub const CONDITIONAL_BRANCH: &str = "conditional_branch";
pub const LOOP_ITERATE: &str = "loop_iterate";
pub const PARALLEL_EXECUTE: &str = "parallel_execute";
pub const MANUAL_APPROVAL: &str = "manual_approval";
pub const HTTP_REQUEST: &str = "http_request";
pub const INTEGRATION_REQUEST: &str = "integration_request";
pub const TRANSFORM_LLM: &str = "transform_llm";
pub const VALIDATE_RECORD: &str = "validate_record";
pub const SUBMIT_GUARD: &str = "submit_guard";
pub const DATA_IMPORT_CSV: &str = "data_import_csv";

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The node/edge graph a run executes, plus workflow-level execution defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub execution: ExecutionDefaults,
}

impl WorkflowDefinition {
    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Workflow-level execution defaults. Per-node `retryCount` / `timeoutMs`
/// override these; engine configuration fills whatever is left unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionDefaults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_node_timeout_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A unit of work in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique within the definition.
    pub id: String,
    /// Selects the dispatcher handler.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Handler-specific parameters.
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Per-node retry/timeout overrides read from the node's data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeOptions {
    pub retry_count: Option<u32>,
    pub timeout_ms: Option<u64>,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>, data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            id: id.into(),
            node_type: node_type.into(),
            data,
        }
    }

    /// Retry/timeout overrides. Malformed values are ignored.
    pub fn options(&self) -> NodeOptions {
        NodeOptions {
            retry_count: self
                .data
                .get("retryCount")
                .and_then(Value::as_u64)
                .map(|n| n.min(u32::MAX as u64) as u32),
            timeout_ms: self.data.get("timeoutMs").and_then(Value::as_u64),
        }
    }

    /// Parse the node's data into its typed parameter struct.
    pub fn kind(&self) -> Result<NodeKind, NodeParamsError> {
        let kind = match self.node_type.as_str() {
            START => NodeKind::Start,
            SET_VARIABLE => NodeKind::SetVariable(self.params()?),
            CONDITIONAL_BRANCH => NodeKind::ConditionalBranch(self.params()?),
            LOOP_ITERATE => NodeKind::LoopIterate(self.params()?),
            PARALLEL_EXECUTE => NodeKind::ParallelExecute(self.params()?),
            MANUAL_APPROVAL => NodeKind::ManualApproval(self.params()?),
            _ => NodeKind::Action,
        };
        Ok(kind)
    }

    fn params<T: serde::de::DeserializeOwned>(&self) -> Result<T, NodeParamsError> {
        serde_json::from_value(Value::Object(self.data.clone())).map_err(|e| {
            NodeParamsError {
                node_id: self.id.clone(),
                node_type: self.node_type.clone(),
                message: e.to_string(),
            }
        })
    }
}

/// A node's data did not match the parameter shape of its type.
#[derive(Debug, Clone, Error)]
#[error("invalid parameters for {node_type} node '{node_id}': {message}")]
pub struct NodeParamsError {
    pub node_id: String,
    pub node_type: String,
    pub message: String,
}

// ---------------------------------------------------------------------------
// NodeKind (typed parameters)
// ---------------------------------------------------------------------------

/// Typed view of a node, keyed by `node.type`.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Start,
    SetVariable(SetVariableParams),
    ConditionalBranch(BranchParams),
    LoopIterate(LoopParams),
    ParallelExecute(ParallelParams),
    ManualApproval(ApprovalParams),
    /// Any other type; parameters stay in `Node::data` for the action handler.
    Action,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetVariableParams {
    pub key: String,
    #[serde(default)]
    pub value: Value,
}

/// Comparison operators understood by `conditional_branch`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchOperator {
    #[default]
    Truthy,
    Falsy,
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    In,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BranchParams {
    /// Context key holding the left operand. Takes precedence over `left`.
    pub input_key: Option<String>,
    /// Alias of `input_key`.
    pub left_key: Option<String>,
    /// Literal left operand.
    pub left: Option<Value>,
    pub operator: BranchOperator,
    /// Literal right operand.
    pub right: Option<Value>,
    /// Context key holding the right operand. Takes precedence over `right`.
    pub right_key: Option<String>,
    pub true_target: Option<String>,
    pub false_target: Option<String>,
    /// Optional context key receiving the boolean result.
    pub output_key: Option<String>,
}

fn default_item_key() -> String {
    "item".to_string()
}

fn default_index_key() -> String {
    "index".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopParams {
    pub input_key: String,
    #[serde(default = "default_item_key")]
    pub item_key: String,
    #[serde(default = "default_index_key")]
    pub index_key: String,
    #[serde(default)]
    pub output_key: Option<String>,
    #[serde(default)]
    pub tasks: Vec<InlineTask>,
    #[serde(default)]
    pub allow_partial: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParallelParams {
    pub tasks: Vec<InlineTask>,
    pub task_timeout_ms: Option<u64>,
    pub allow_partial: bool,
    pub output_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApprovalParams {
    /// `Some(false)` disables auto-approval in test mode.
    pub auto_approve: Option<bool>,
}

// ---------------------------------------------------------------------------
// InlineTask
// ---------------------------------------------------------------------------

/// A miniature node executed by `loop_iterate` / `parallel_execute` without
/// graph position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineTask {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl InlineTask {
    /// View this task as a standalone node so it can go through the dispatcher.
    pub fn to_node(&self) -> Node {
        Node {
            id: self.id.clone(),
            node_type: self.task_type.clone(),
            data: self.params.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Edge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<EdgeData>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<bool>,
}

impl Edge {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            data: None,
        }
    }

    /// Builder-style `data.when` guard.
    pub fn when(mut self, when: bool) -> Self {
        self.data = Some(EdgeData { when: Some(when) });
        self
    }

    pub fn when_guard(&self) -> Option<bool> {
        self.data.and_then(|d| d.when)
    }
}

// ---------------------------------------------------------------------------
// Workflow Record (stored shape)
// ---------------------------------------------------------------------------

/// A stored workflow with its draft, current, published, and pinned
/// historical definitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft: Option<WorkflowDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<WorkflowDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<WorkflowDefinition>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub versions: BTreeMap<u32, WorkflowDefinition>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn definition_parses_nodes_edges_and_defaults() {
        let def: WorkflowDefinition = serde_json::from_value(json!({
            "nodes": [
                { "id": "s", "type": "start" },
                { "id": "v", "type": "set_variable", "data": { "key": "result", "value": "ok", "retryCount": 4 } }
            ],
            "edges": [ { "id": "e1", "source": "s", "target": "v", "data": { "when": true } } ],
            "execution": { "globalTimeoutMs": 5000, "defaultRetries": 1 }
        }))
        .unwrap();

        assert_eq!(def.nodes.len(), 2);
        assert_eq!(def.edges[0].when_guard(), Some(true));
        assert_eq!(def.execution.global_timeout_ms, Some(5000));
        assert_eq!(def.execution.default_node_timeout_ms, None);
        assert_eq!(def.node("v").unwrap().options().retry_count, Some(4));
    }

    #[test]
    fn unknown_type_is_action_and_round_trips() {
        let raw = json!({ "id": "b", "type": "browser_click", "data": { "selector": "#go" } });
        let node: Node = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(node.kind().unwrap(), NodeKind::Action);
        assert_eq!(serde_json::to_value(&node).unwrap(), raw);
    }

    #[test]
    fn loop_params_apply_defaults() {
        let node = Node::new("l", LOOP_ITERATE, json!({ "inputKey": "rows" }));
        let NodeKind::LoopIterate(params) = node.kind().unwrap() else {
            panic!("expected loop");
        };
        assert_eq!(params.item_key, "item");
        assert_eq!(params.index_key, "index");
        assert!(params.tasks.is_empty());
        assert!(!params.allow_partial);
    }

    #[test]
    fn inline_task_flattens_params() {
        let task: InlineTask = serde_json::from_value(json!({
            "id": "t1", "type": "set_variable", "key": "a", "value": 1
        }))
        .unwrap();
        let node = task.to_node();
        assert_eq!(node.node_type, "set_variable");
        assert_eq!(node.data.get("key"), Some(&json!("a")));
    }

    #[test]
    fn bad_params_report_node() {
        let node = Node::new("v", SET_VARIABLE, json!({ "value": 1 }));
        let err = node.kind().unwrap_err();
        assert!(err.to_string().contains("set_variable node 'v'"), "got: {err}");
    }

    #[test]
    fn branch_operator_defaults_to_truthy() {
        let node = Node::new("b", CONDITIONAL_BRANCH, json!({ "inputKey": "flag" }));
        let NodeKind::ConditionalBranch(params) = node.kind().unwrap() else {
            panic!("expected branch");
        };
        assert_eq!(params.operator, BranchOperator::Truthy);
    }
}
