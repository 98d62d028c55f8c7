//! Execution context: the run's variable store plus typed engine bookkeeping.
//!
//! User variables live in a flat string-keyed map. Approvals, branch
//! decisions, loop metadata, the validation dedup cache, and the network call
//! ring buffer are separate typed fields, so node handlers can never collide
//! with engine state by picking an unlucky variable name.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default number of network call records kept per run.
pub const DEFAULT_NETWORK_LOG_CAPACITY: usize = 50;

// ---------------------------------------------------------------------------
// Bookkeeping records
// ---------------------------------------------------------------------------

/// Outcome of a `conditional_branch` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchDecision {
    pub result: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    pub evaluated_at: DateTime<Utc>,
}

/// Shape of the last `loop_iterate` execution of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopMetadata {
    pub count: usize,
    pub item_key: String,
    pub index_key: String,
    pub output_key: String,
}

/// One outbound call made by an action handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkCall {
    pub node_id: String,
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub duration_ms: u64,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Mutable state shared by every node of one run.
///
/// Serialized with `to_json` after every node transition and restored with
/// `from_json` when a run is (re)started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionContext {
    pub variables: Map<String, Value>,
    pub approvals: BTreeMap<String, bool>,
    pub branch_decisions: BTreeMap<String, BranchDecision>,
    pub loops: BTreeMap<String, LoopMetadata>,
    pub validation_cache: BTreeSet<String>,
    pub network_log: VecDeque<NetworkCall>,
    #[serde(skip)]
    network_log_capacity: usize,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            variables: Map::new(),
            approvals: BTreeMap::new(),
            branch_decisions: BTreeMap::new(),
            loops: BTreeMap::new(),
            validation_cache: BTreeSet::new(),
            network_log: VecDeque::new(),
            network_log_capacity: DEFAULT_NETWORK_LOG_CAPACITY,
        }
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_network_log_capacity(mut self, capacity: usize) -> Self {
        self.network_log_capacity = capacity.max(1);
        while self.network_log.len() > self.network_log_capacity {
            self.network_log.pop_front();
        }
        self
    }

    // -----------------------------------------------------------------------
    // Serialization
    // -----------------------------------------------------------------------

    /// Restore from a persisted run context. `null` yields an empty context.
    pub fn from_json(value: &Value) -> Result<Self, serde_json::Error> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone())
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Merge run input over the variables. Input wins on key collision;
    /// non-object input is ignored.
    pub fn merge_input(&mut self, input: &Value) {
        if let Value::Object(map) = input {
            for (key, value) in map {
                self.variables.insert(key.clone(), value.clone());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Variables
    // -----------------------------------------------------------------------

    /// Look up a variable. An exact key match wins; otherwise the key is
    /// treated as a dotted path into nested objects/arrays (`order.items.0.sku`).
    pub fn get(&self, key: &str) -> Option<&Value> {
        if let Some(value) = self.variables.get(key) {
            return Some(value);
        }
        let mut parts = key.split('.');
        let mut current = self.variables.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.variables.insert(key.into(), value);
    }

    // -----------------------------------------------------------------------
    // Approvals / branches / validation
    // -----------------------------------------------------------------------

    pub fn approval(&self, node_id: &str) -> Option<bool> {
        self.approvals.get(node_id).copied()
    }

    pub fn set_approval(&mut self, node_id: impl Into<String>, approved: bool) {
        self.approvals.insert(node_id.into(), approved);
    }

    pub fn branch_decision(&self, node_id: &str) -> Option<&BranchDecision> {
        self.branch_decisions.get(node_id)
    }

    pub fn record_branch_decision(&mut self, node_id: impl Into<String>, decision: BranchDecision) {
        self.branch_decisions.insert(node_id.into(), decision);
    }

    /// Marks a validation key as seen. Returns `false` if it was already cached.
    pub fn mark_validated(&mut self, key: impl Into<String>) -> bool {
        self.validation_cache.insert(key.into())
    }

    // -----------------------------------------------------------------------
    // Network log
    // -----------------------------------------------------------------------

    /// Append a call record, evicting the oldest beyond capacity.
    pub fn record_network_call(&mut self, call: NetworkCall) {
        self.network_log.push_back(call);
        while self.network_log.len() > self.network_log_capacity {
            self.network_log.pop_front();
        }
    }

    // -----------------------------------------------------------------------
    // Parallel fork/merge
    // -----------------------------------------------------------------------

    /// Private copy for one concurrently running inline task. The copy starts
    /// with an empty network log so only its own calls are merged back.
    pub fn fork(&self) -> Self {
        let mut child = self.clone();
        child.network_log.clear();
        child
    }

    /// Fold a forked child back in. Variables are merged only where the child
    /// changed them relative to `base`.
    pub fn absorb(&mut self, base: &Map<String, Value>, child: Self, keep_variables: bool) {
        if keep_variables {
            for (key, value) in child.variables {
                if base.get(&key) != Some(&value) {
                    self.variables.insert(key, value);
                }
            }
            self.approvals.extend(child.approvals);
            self.branch_decisions.extend(child.branch_decisions);
            self.loops.extend(child.loops);
            self.validation_cache.extend(child.validation_cache);
        }
        for call in child.network_log {
            self.record_network_call(call);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(node: &str) -> NetworkCall {
        NetworkCall {
            node_id: node.into(),
            method: "GET".into(),
            url: "http://example.test".into(),
            status: Some(200),
            duration_ms: 3,
            at: Utc::now(),
            error: None,
        }
    }

    #[test]
    fn input_wins_over_persisted_context() {
        let mut ctx = ExecutionContext::new();
        ctx.set("a", json!(1));
        ctx.set("b", json!(2));
        ctx.merge_input(&json!({ "b": 20, "c": 30 }));
        assert_eq!(ctx.get("a"), Some(&json!(1)));
        assert_eq!(ctx.get("b"), Some(&json!(20)));
        assert_eq!(ctx.get("c"), Some(&json!(30)));
    }

    #[test]
    fn dotted_path_lookup() {
        let mut ctx = ExecutionContext::new();
        ctx.set("order", json!({ "items": [ { "sku": "x-1" } ] }));
        ctx.set("a.b", json!("literal"));
        assert_eq!(ctx.get("order.items.0.sku"), Some(&json!("x-1")));
        assert_eq!(ctx.get("a.b"), Some(&json!("literal")));
        assert_eq!(ctx.get("order.missing"), None);
    }

    #[test]
    fn round_trip_keeps_bookkeeping_separate() {
        let mut ctx = ExecutionContext::new();
        ctx.set("approvals", json!("user value"));
        ctx.set_approval("gate", true);
        ctx.record_branch_decision(
            "b",
            BranchDecision {
                result: true,
                target_id: Some("t".into()),
                evaluated_at: Utc::now(),
            },
        );

        let back = ExecutionContext::from_json(&ctx.to_json()).unwrap();
        assert_eq!(back, ctx);
        assert_eq!(back.get("approvals"), Some(&json!("user value")));
        assert_eq!(back.approval("gate"), Some(true));
    }

    #[test]
    fn null_context_is_empty() {
        let ctx = ExecutionContext::from_json(&Value::Null).unwrap();
        assert!(ctx.variables.is_empty());
    }

    #[test]
    fn network_log_is_bounded() {
        let mut ctx = ExecutionContext::new().with_network_log_capacity(2);
        ctx.record_network_call(call("a"));
        ctx.record_network_call(call("b"));
        ctx.record_network_call(call("c"));
        let nodes: Vec<_> = ctx.network_log.iter().map(|c| c.node_id.as_str()).collect();
        assert_eq!(nodes, vec!["b", "c"]);
    }

    #[test]
    fn absorb_merges_changed_variables_only() {
        let mut parent = ExecutionContext::new();
        parent.set("shared", json!(1));
        let base = parent.variables.clone();

        let mut child = parent.fork();
        child.set("new", json!("x"));
        child.record_network_call(call("t1"));

        parent.set("shared", json!(2));
        parent.absorb(&base, child, true);

        assert_eq!(parent.get("shared"), Some(&json!(2)));
        assert_eq!(parent.get("new"), Some(&json!("x")));
        assert_eq!(parent.network_log.len(), 1);
    }

    #[test]
    fn validation_cache_dedups() {
        let mut ctx = ExecutionContext::new();
        assert!(ctx.mark_validated("row-1"));
        assert!(!ctx.mark_validated("row-1"));
    }
}
