//! `conditional_branch` evaluation and branch-driven skip propagation.
//!
//! A branch node compares two operands, records a [`BranchDecision`] keyed by
//! its own id, and succeeds. Routing happens later: [`should_skip`] inspects a
//! candidate node's incoming edges against the recorded decisions.

use std::collections::BTreeMap;

use chrono::Utc;
use flowpilot_types::run::{NodeState, NodeStatus};
use flowpilot_types::workflow::{BranchOperator, BranchParams, CONDITIONAL_BRANCH, WorkflowDefinition};
use serde_json::Value;

use super::context::{BranchDecision, ExecutionContext};
use super::dispatcher::HandlerResult;
use super::graph::WorkflowGraph;

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate a branch node and record its decision in the context.
pub fn evaluate(node_id: &str, params: &BranchParams, ctx: &mut ExecutionContext) -> HandlerResult {
    let left = match params.input_key.as_deref().or(params.left_key.as_deref()) {
        Some(key) => ctx.get(key).cloned().unwrap_or(Value::Null),
        None => params.left.clone().unwrap_or(Value::Null),
    };
    let right = match params.right_key.as_deref() {
        Some(key) => ctx.get(key).cloned().unwrap_or(Value::Null),
        None => params.right.clone().unwrap_or(Value::Null),
    };

    let result = compare(params.operator, &left, &right);
    let target_id = if result {
        params.true_target.clone()
    } else {
        params.false_target.clone()
    };

    tracing::debug!(node_id, operator = ?params.operator, result, target = ?target_id, "branch evaluated");

    ctx.record_branch_decision(
        node_id,
        BranchDecision {
            result,
            target_id,
            evaluated_at: Utc::now(),
        },
    );

    match &params.output_key {
        Some(key) => {
            ctx.set(key.clone(), Value::Bool(result));
            Ok(Some(key.clone()))
        }
        None => Ok(None),
    }
}

/// Apply a branch operator.
pub fn compare(operator: BranchOperator, left: &Value, right: &Value) -> bool {
    match operator {
        BranchOperator::Truthy => is_truthy(left),
        BranchOperator::Falsy => !is_truthy(left),
        BranchOperator::Eq => loose_eq(left, right),
        BranchOperator::Ne => !loose_eq(left, right),
        BranchOperator::Gt => numeric(left, right, |a, b| a > b),
        BranchOperator::Gte => numeric(left, right, |a, b| a >= b),
        BranchOperator::Lt => numeric(left, right, |a, b| a < b),
        BranchOperator::Lte => numeric(left, right, |a, b| a <= b),
        BranchOperator::Contains => match left {
            Value::Array(items) => items.iter().any(|item| loose_eq(item, right)),
            Value::String(s) => s.contains(&to_text(right)),
            _ => false,
        },
        BranchOperator::In => match right {
            Value::Array(items) => items.iter().any(|item| loose_eq(left, item)),
            _ => false,
        },
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Numeric cast: numbers as-is, numeric strings parsed, booleans as 0/1,
/// null as 0. Anything else is NaN, which makes every comparison false.
fn to_number(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) if s.trim().is_empty() => 0.0,
        Value::String(s) => s.trim().parse().unwrap_or(f64::NAN),
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Null => 0.0,
        Value::Array(_) | Value::Object(_) => f64::NAN,
    }
}

fn numeric(left: &Value, right: &Value, op: impl Fn(f64, f64) -> bool) -> bool {
    op(to_number(left), to_number(right))
}

fn to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Equality with number/string/bool coercion; structural otherwise.
fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Number(_) | Value::Bool(_) | Value::String(_), Value::Number(_) | Value::Bool(_) | Value::String(_)) => {
            let (a, b) = (to_number(left), to_number(right));
            !a.is_nan() && a == b
        }
        _ => left == right,
    }
}

// ---------------------------------------------------------------------------
// Skip propagation
// ---------------------------------------------------------------------------

/// Whether branch routing excludes `node_id`.
///
/// Only incoming edges from a *succeeded* `conditional_branch` with a recorded
/// decision count. Such an edge selects the node when the decision's target is
/// this node (or, without a target, when the edge's `when` equals the result)
/// and rejects it otherwise. The node is skipped when some edge rejects it and
/// none selects it.
pub fn should_skip(
    node_id: &str,
    graph: &WorkflowGraph<'_>,
    definition: &WorkflowDefinition,
    node_states: &BTreeMap<String, NodeState>,
    ctx: &ExecutionContext,
) -> bool {
    let mut selected = false;
    let mut rejected = false;

    for edge in graph.incoming_edges_of(node_id) {
        let source = edge.source.as_str();
        let is_branch = definition
            .node(source)
            .is_some_and(|n| n.node_type == CONDITIONAL_BRANCH);
        let succeeded = node_states
            .get(source)
            .is_some_and(|s| s.status == NodeStatus::Succeeded);
        if !is_branch || !succeeded {
            continue;
        }
        let Some(decision) = ctx.branch_decision(source) else {
            continue;
        };

        match (&decision.target_id, edge.when_guard()) {
            (Some(target), _) if target == &edge.target => selected = true,
            (Some(_), _) => rejected = true,
            (None, Some(when)) if when == decision.result => selected = true,
            (None, Some(_)) => rejected = true,
            (None, None) => {}
        }
    }

    rejected && !selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowpilot_types::workflow::{Edge, Node};
    use serde_json::json;

    fn branch_params(input_key: &str, operator: BranchOperator, right: Value) -> BranchParams {
        BranchParams {
            input_key: Some(input_key.into()),
            operator,
            right: Some(right),
            true_target: Some("yes".into()),
            false_target: Some("no".into()),
            ..Default::default()
        }
    }

    #[test]
    fn truthiness() {
        for v in [json!(null), json!(false), json!(0), json!(""), json!(0.0)] {
            assert!(!compare(BranchOperator::Truthy, &v, &Value::Null), "{v} should be falsy");
            assert!(compare(BranchOperator::Falsy, &v, &Value::Null));
        }
        for v in [json!(true), json!(1), json!("x"), json!([]), json!({})] {
            assert!(compare(BranchOperator::Truthy, &v, &Value::Null), "{v} should be truthy");
        }
    }

    #[test]
    fn equality_coerces_scalars() {
        assert!(compare(BranchOperator::Eq, &json!("5"), &json!(5)));
        assert!(compare(BranchOperator::Eq, &json!(true), &json!(1)));
        assert!(compare(BranchOperator::Eq, &json!({"a": 1}), &json!({"a": 1})));
        assert!(compare(BranchOperator::Ne, &json!("a"), &json!("b")));
        assert!(!compare(BranchOperator::Eq, &json!(null), &json!(0)));
    }

    #[test]
    fn numeric_comparisons_cast() {
        assert!(compare(BranchOperator::Gt, &json!("10"), &json!(9)));
        assert!(compare(BranchOperator::Gte, &json!(3), &json!("3")));
        assert!(compare(BranchOperator::Lt, &json!(-1), &json!(null)));
        assert!(compare(BranchOperator::Lte, &json!(2.5), &json!(2.5)));
        assert!(!compare(BranchOperator::Gt, &json!("abc"), &json!(1)));
        assert!(!compare(BranchOperator::Lt, &json!("abc"), &json!(1)));
    }

    #[test]
    fn contains_and_in() {
        assert!(compare(BranchOperator::Contains, &json!([1, 2, 3]), &json!(2)));
        assert!(compare(BranchOperator::Contains, &json!("hello world"), &json!("world")));
        assert!(!compare(BranchOperator::Contains, &json!(42), &json!(4)));
        assert!(compare(BranchOperator::In, &json!("b"), &json!(["a", "b"])));
        assert!(!compare(BranchOperator::In, &json!("b"), &json!("abc")));
    }

    #[test]
    fn evaluate_records_decision() {
        let mut ctx = ExecutionContext::new();
        ctx.set("amount", json!(120));
        let params = BranchParams {
            output_key: Some("isLarge".into()),
            ..branch_params("amount", BranchOperator::Gt, json!(100))
        };

        let out = evaluate("b", &params, &mut ctx).unwrap();
        assert_eq!(out.as_deref(), Some("isLarge"));
        assert_eq!(ctx.get("isLarge"), Some(&json!(true)));
        let decision = ctx.branch_decision("b").unwrap();
        assert!(decision.result);
        assert_eq!(decision.target_id.as_deref(), Some("yes"));
    }

    #[test]
    fn literal_left_operand() {
        let mut ctx = ExecutionContext::new();
        let params = BranchParams {
            left: Some(json!("")),
            true_target: Some("yes".into()),
            false_target: Some("no".into()),
            ..Default::default()
        };
        evaluate("b", &params, &mut ctx).unwrap();
        assert_eq!(ctx.branch_decision("b").unwrap().target_id.as_deref(), Some("no"));
    }

    // -----------------------------------------------------------------------
    // Skip rule
    // -----------------------------------------------------------------------

    fn fixture(edges: Vec<Edge>) -> WorkflowDefinition {
        WorkflowDefinition {
            nodes: vec![
                Node::new("b", CONDITIONAL_BRANCH, json!({})),
                Node::new("b2", CONDITIONAL_BRANCH, json!({})),
                Node::new("plain", "start", json!({})),
                Node::new("yes", "start", json!({})),
                Node::new("no", "start", json!({})),
            ],
            edges,
            ..Default::default()
        }
    }

    fn succeeded(ids: &[&str]) -> BTreeMap<String, NodeState> {
        ids.iter()
            .map(|id| {
                (
                    id.to_string(),
                    NodeState {
                        status: NodeStatus::Succeeded,
                        ..Default::default()
                    },
                )
            })
            .collect()
    }

    fn decide(ctx: &mut ExecutionContext, id: &str, result: bool, target: Option<&str>) {
        ctx.record_branch_decision(
            id,
            BranchDecision {
                result,
                target_id: target.map(String::from),
                evaluated_at: Utc::now(),
            },
        );
    }

    #[test]
    fn target_id_selects_and_rejects() {
        let def = fixture(vec![Edge::new("e1", "b", "yes"), Edge::new("e2", "b", "no")]);
        let graph = WorkflowGraph::build(&def);
        let states = succeeded(&["b"]);
        let mut ctx = ExecutionContext::new();
        decide(&mut ctx, "b", true, Some("yes"));

        assert!(!should_skip("yes", &graph, &def, &states, &ctx));
        assert!(should_skip("no", &graph, &def, &states, &ctx));
    }

    #[test]
    fn when_guard_used_without_target() {
        let def = fixture(vec![
            Edge::new("e1", "b", "yes").when(true),
            Edge::new("e2", "b", "no").when(false),
        ]);
        let graph = WorkflowGraph::build(&def);
        let states = succeeded(&["b"]);
        let mut ctx = ExecutionContext::new();
        decide(&mut ctx, "b", false, None);

        assert!(should_skip("yes", &graph, &def, &states, &ctx));
        assert!(!should_skip("no", &graph, &def, &states, &ctx));
    }

    #[test]
    fn any_selection_wins_over_rejection() {
        let def = fixture(vec![Edge::new("e1", "b", "yes"), Edge::new("e2", "b2", "yes")]);
        let graph = WorkflowGraph::build(&def);
        let states = succeeded(&["b", "b2"]);
        let mut ctx = ExecutionContext::new();
        decide(&mut ctx, "b", true, Some("yes"));
        decide(&mut ctx, "b2", false, Some("no"));

        assert!(!should_skip("yes", &graph, &def, &states, &ctx));
    }

    #[test]
    fn ignores_unfinished_and_non_branch_sources() {
        let def = fixture(vec![Edge::new("e1", "b", "no"), Edge::new("e2", "plain", "no")]);
        let graph = WorkflowGraph::build(&def);
        let mut ctx = ExecutionContext::new();
        decide(&mut ctx, "b", true, Some("yes"));

        // Branch has not succeeded: its decision does not count yet.
        assert!(!should_skip("no", &graph, &def, &BTreeMap::new(), &ctx));
        // Non-branch predecessor never rejects.
        assert!(!should_skip("plain", &graph, &def, &succeeded(&["plain"]), &ctx));
    }
}
