//! `loop_iterate`, `parallel_execute`, and the shared inline task executor.
//!
//! Inline tasks are miniature nodes without graph position. Loops run them
//! sequentially per item; parallel nodes run them concurrently, each against a
//! private fork of the context that is merged back in declaration order once
//! every task has settled. Inline tasks are never retried.

use std::time::Duration;

use flowpilot_types::workflow::{
    ApprovalParams, DATA_IMPORT_CSV, HTTP_REQUEST, INTEGRATION_REQUEST, InlineTask, LoopParams,
    MANUAL_APPROVAL, Node, ParallelParams, SET_VARIABLE, SUBMIT_GUARD, TRANSFORM_LLM,
    VALIDATE_RECORD,
};
use futures_util::future::join_all;
use serde_json::{Value, json};

use super::context::{ExecutionContext, LoopMetadata};
use super::dispatcher::{DispatchEnv, HandlerError, HandlerResult, NodeDispatcher};

/// Task types an inline task may use. `manual_approval` is additionally
/// allowed in test mode when it auto-approves.
const INLINE_TASK_TYPES: &[&str] = &[
    HTTP_REQUEST,
    INTEGRATION_REQUEST,
    SET_VARIABLE,
    TRANSFORM_LLM,
    VALIDATE_RECORD,
    SUBMIT_GUARD,
    DATA_IMPORT_CSV,
];

fn default_output_key(node: &Node) -> String {
    format!("{}_output", node.id)
}

// ---------------------------------------------------------------------------
// Inline task executor
// ---------------------------------------------------------------------------

fn check_inline_type(task: &InlineTask, env: &DispatchEnv) -> Result<(), HandlerError> {
    if INLINE_TASK_TYPES.contains(&task.task_type.as_str()) {
        return Ok(());
    }
    if task.task_type == MANUAL_APPROVAL && env.test_mode {
        let params: ApprovalParams =
            serde_json::from_value(Value::Object(task.params.clone())).unwrap_or_default();
        if params.auto_approve != Some(false) {
            return Ok(());
        }
    }
    Err(HandlerError::UnsupportedInlineTask(task.task_type.clone()))
}

/// Run one inline task through the dispatcher.
pub async fn execute_inline(
    dispatcher: &NodeDispatcher,
    task: &InlineTask,
    ctx: &mut ExecutionContext,
    env: &DispatchEnv,
) -> HandlerResult {
    check_inline_type(task, env)?;
    let node = task.to_node();
    dispatcher.dispatch(&node, ctx, env).await
}

fn task_summary(task: &InlineTask, result: &HandlerResult) -> Value {
    match result {
        Ok(output_key) => json!({
            "taskId": task.id,
            "taskType": task.task_type,
            "status": "succeeded",
            "outputKey": output_key,
        }),
        Err(e) => json!({
            "taskId": task.id,
            "taskType": task.task_type,
            "status": "failed",
            "error": e.to_string(),
        }),
    }
}

// ---------------------------------------------------------------------------
// loop_iterate
// ---------------------------------------------------------------------------

pub async fn run_loop(
    dispatcher: &NodeDispatcher,
    node: &Node,
    params: LoopParams,
    ctx: &mut ExecutionContext,
    env: &DispatchEnv,
) -> HandlerResult {
    let items = match ctx.get(&params.input_key) {
        Some(Value::Array(items)) => items.clone(),
        _ => {
            return Err(HandlerError::failed(format!(
                "loop input '{}' is not an array",
                params.input_key
            )));
        }
    };
    let output_key = params.output_key.clone().unwrap_or_else(|| default_output_key(node));

    ctx.loops.insert(
        node.id.clone(),
        LoopMetadata {
            count: items.len(),
            item_key: params.item_key.clone(),
            index_key: params.index_key.clone(),
            output_key: output_key.clone(),
        },
    );

    if params.tasks.is_empty() {
        let last_index = items.len().checked_sub(1);
        ctx.set(params.item_key.clone(), items.last().cloned().unwrap_or(Value::Null));
        ctx.set(params.index_key.clone(), last_index.map_or(Value::Null, |i| json!(i)));
        ctx.set(output_key.clone(), Value::Array(items));
        return Ok(Some(output_key));
    }

    let mut summaries = Vec::with_capacity(items.len());

    for (index, item) in items.into_iter().enumerate() {
        ctx.set(params.item_key.clone(), item);
        ctx.set(params.index_key.clone(), json!(index));

        let mut tasks = Vec::with_capacity(params.tasks.len());
        let mut failure = None;

        for task in &params.tasks {
            let result = execute_inline(dispatcher, task, ctx, env).await;
            tasks.push(task_summary(task, &result));
            if let Err(e) = result {
                failure = Some((task.id.clone(), e));
                break;
            }
        }

        let status = if failure.is_some() { "failed" } else { "succeeded" };
        summaries.push(json!({ "index": index, "status": status, "tasks": tasks }));

        if let Some((task_id, error)) = failure {
            if !params.allow_partial {
                ctx.set(output_key.clone(), Value::Array(summaries));
                return Err(HandlerError::failed(format!(
                    "loop item {index}: task '{task_id}' failed: {error}"
                )));
            }
            tracing::debug!(
                node_id = node.id.as_str(),
                index,
                task_id = task_id.as_str(),
                "loop item failed, continuing"
            );
        }
    }

    ctx.set(output_key.clone(), Value::Array(summaries));
    Ok(Some(output_key))
}

// ---------------------------------------------------------------------------
// parallel_execute
// ---------------------------------------------------------------------------

pub async fn run_parallel(
    dispatcher: &NodeDispatcher,
    node: &Node,
    params: ParallelParams,
    ctx: &mut ExecutionContext,
    env: &DispatchEnv,
) -> HandlerResult {
    if params.tasks.is_empty() {
        return Err(HandlerError::failed("parallel_execute requires at least one task"));
    }

    let task_timeout = params
        .task_timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(env.parallel_task_timeout);
    let output_key = params.output_key.clone().unwrap_or_else(|| default_output_key(node));
    let base = ctx.variables.clone();

    let runs: Vec<_> = params
        .tasks
        .iter()
        .map(|task| {
            let mut child = ctx.fork();
            async move {
                let result = match tokio::time::timeout(
                    task_timeout,
                    execute_inline(dispatcher, task, &mut child, env),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(HandlerError::Timeout(task_timeout.as_millis() as u64)),
                };
                (task, result, child)
            }
        })
        .collect();

    let settled = join_all(runs).await;

    let mut summaries = Vec::with_capacity(settled.len());
    let mut failed_ids = Vec::new();
    for (task, result, child) in settled {
        summaries.push(task_summary(task, &result));
        if result.is_err() {
            failed_ids.push(task.id.clone());
        }
        ctx.absorb(&base, child, result.is_ok());
    }

    ctx.set(output_key.clone(), Value::Array(summaries));

    if !failed_ids.is_empty() {
        if !params.allow_partial {
            return Err(HandlerError::failed(format!(
                "parallel tasks failed: {}",
                failed_ids.join(", ")
            )));
        }
        tracing::debug!(
            node_id = node.id.as_str(),
            failed = failed_ids.len(),
            "parallel_execute completed with partial failures"
        );
    }

    Ok(Some(output_key))
}
