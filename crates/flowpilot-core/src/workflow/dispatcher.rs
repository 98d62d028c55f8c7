//! Node dispatcher: maps `node.type` to a handler.
//!
//! Control-flow types (`start`, `set_variable`, `conditional_branch`,
//! `loop_iterate`, `parallel_execute`, `manual_approval`) are handled here in
//! the core. Every other type is looked up in an injectable [`ActionRegistry`];
//! an unregistered type is a no-op so new node types degrade gracefully.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use flowpilot_types::workflow::{
    ExecutionDefaults, LOOP_ITERATE, Node, NodeKind, PARALLEL_EXECUTE,
};
use futures_util::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::context::ExecutionContext;
use super::interpolate::{Interpolator, PassthroughInterpolator};
use super::{approval, branch, control};

// ---------------------------------------------------------------------------
// HandlerError
// ---------------------------------------------------------------------------

/// Outcome of a failed handler invocation.
///
/// `ApprovalRequired` is a control signal, not a failure: the retry controller
/// never retries it and the state machine pauses the run on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("approval required for node '{node_id}'")]
    ApprovalRequired { node_id: String },

    #[error("approval rejected for node '{node_id}'")]
    ApprovalRejected { node_id: String },

    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("unsupported inline task type '{0}'")]
    UnsupportedInlineTask(String),

    #[error("{0}")]
    InvalidParams(String),

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn is_approval_required(&self) -> bool {
        matches!(self, Self::ApprovalRequired { .. })
    }

    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::ApprovalRequired { .. } | Self::ApprovalRejected { .. })
    }
}

/// What a handler returns: the context key it wrote, if any.
pub type HandlerResult = Result<Option<String>, HandlerError>;

// ---------------------------------------------------------------------------
// DispatchEnv
// ---------------------------------------------------------------------------

/// Per-run values every handler may consult.
#[derive(Debug, Clone)]
pub struct DispatchEnv {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub test_mode: bool,
    pub defaults: ExecutionDefaults,
    /// Fallback `taskTimeoutMs` for `parallel_execute`.
    pub parallel_task_timeout: Duration,
}

impl DispatchEnv {
    pub fn new(run_id: Uuid, workflow_id: impl Into<String>, test_mode: bool) -> Self {
        Self {
            run_id,
            workflow_id: workflow_id.into(),
            test_mode,
            defaults: ExecutionDefaults::default(),
            parallel_task_timeout: Duration::from_millis(15_000),
        }
    }
}

// ---------------------------------------------------------------------------
// ActionHandler
// ---------------------------------------------------------------------------

/// State captured by a handler after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureCapture {
    pub kind: String,
    pub data: Value,
}

/// Pluggable handler for a non-control-flow node type.
///
/// Object-safe so handlers can be registered as `Arc<dyn ActionHandler>`.
pub trait ActionHandler: Send + Sync {
    /// Run the node. May mutate the context; returns the key it wrote.
    fn execute<'a>(
        &'a self,
        node: &'a Node,
        ctx: &'a mut ExecutionContext,
        env: &'a DispatchEnv,
    ) -> BoxFuture<'a, HandlerResult>;

    /// Capture failure state (e.g. a screenshot) after a failed attempt.
    fn capture_failure<'a>(
        &'a self,
        _node: &'a Node,
        _env: &'a DispatchEnv,
    ) -> BoxFuture<'a, Option<FailureCapture>> {
        Box::pin(async { None })
    }

    /// Release per-run resources (sessions, connections). Called once when a
    /// run leaves the state machine, whatever the outcome.
    fn release<'a>(&'a self, _run_id: Uuid) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }
}

// ---------------------------------------------------------------------------
// ActionRegistry
// ---------------------------------------------------------------------------

/// Node type -> action handler.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, node_type: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(node_type.into(), handler);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, node_type: impl Into<String>, handler: Arc<dyn ActionHandler>) -> Self {
        self.register(node_type, handler);
        self
    }

    pub fn get(&self, node_type: &str) -> Option<&Arc<dyn ActionHandler>> {
        self.handlers.get(node_type)
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.handlers.contains_key(node_type)
    }

    pub fn node_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Each registered handler once, even if it serves several types.
    fn unique_handlers(&self) -> Vec<&Arc<dyn ActionHandler>> {
        let mut unique: Vec<&Arc<dyn ActionHandler>> = Vec::new();
        for handler in self.handlers.values() {
            if !unique.iter().any(|h| Arc::ptr_eq(h, handler)) {
                unique.push(handler);
            }
        }
        unique
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("ActionRegistry").field("types", &types).finish()
    }
}

// ---------------------------------------------------------------------------
// NodeDispatcher
// ---------------------------------------------------------------------------

/// Resolves a node's placeholders and runs the handler for its type.
pub struct NodeDispatcher {
    actions: ActionRegistry,
    interpolator: Arc<dyn Interpolator>,
}

impl NodeDispatcher {
    pub fn new(actions: ActionRegistry) -> Self {
        Self {
            actions,
            interpolator: Arc::new(PassthroughInterpolator),
        }
    }

    pub fn with_interpolator(mut self, interpolator: Arc<dyn Interpolator>) -> Self {
        self.interpolator = interpolator;
        self
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    /// Run one node.
    ///
    /// Boxed because `loop_iterate` / `parallel_execute` re-enter the
    /// dispatcher for their inline tasks.
    pub fn dispatch<'a>(
        &'a self,
        node: &'a Node,
        ctx: &'a mut ExecutionContext,
        env: &'a DispatchEnv,
    ) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            let node = self.interpolate(node, ctx)?;
            let kind = node
                .kind()
                .map_err(|e| HandlerError::InvalidParams(e.to_string()))?;

            match kind {
                NodeKind::Start => Ok(None),
                NodeKind::SetVariable(params) => {
                    ctx.set(params.key.clone(), params.value);
                    Ok(Some(params.key))
                }
                NodeKind::ConditionalBranch(params) => branch::evaluate(&node.id, &params, ctx),
                NodeKind::LoopIterate(params) => {
                    control::run_loop(self, &node, params, ctx, env).await
                }
                NodeKind::ParallelExecute(params) => {
                    control::run_parallel(self, &node, params, ctx, env).await
                }
                NodeKind::ManualApproval(params) => approval::gate(&node.id, &params, ctx, env),
                NodeKind::Action => match self.actions.get(&node.node_type) {
                    Some(handler) => handler.execute(&node, ctx, env).await,
                    None => {
                        tracing::debug!(
                            node_id = node.id.as_str(),
                            node_type = node.node_type.as_str(),
                            "no handler registered, treating as no-op"
                        );
                        Ok(None)
                    }
                },
            }
        })
    }

    /// Ask the node's action handler for failure state, if it has one.
    pub async fn capture_failure(&self, node: &Node, env: &DispatchEnv) -> Option<FailureCapture> {
        let handler = self.actions.get(&node.node_type)?;
        handler.capture_failure(node, env).await
    }

    /// Release per-run resources held by every registered handler.
    pub async fn release(&self, run_id: Uuid) {
        for handler in self.actions.unique_handlers() {
            handler.release(run_id).await;
        }
    }

    /// Resolve placeholders in node data. Inline task lists are left alone;
    /// each task is resolved when it runs, against the context at that time.
    fn interpolate(&self, node: &Node, ctx: &ExecutionContext) -> Result<Node, HandlerError> {
        let mut data = node.data.clone();
        let tasks = match node.node_type.as_str() {
            LOOP_ITERATE | PARALLEL_EXECUTE => data.remove("tasks"),
            _ => None,
        };

        let resolved = self
            .interpolator
            .resolve(&Value::Object(data), ctx)
            .map_err(|e| HandlerError::failed(e.to_string()))?;
        let Value::Object(mut data) = resolved else {
            return Err(HandlerError::failed(format!(
                "interpolation of node '{}' did not produce an object",
                node.id
            )));
        };
        if let Some(tasks) = tasks {
            data.insert("tasks".to_string(), tasks);
        }

        Ok(Node {
            id: node.id.clone(),
            node_type: node.node_type.clone(),
            data,
        })
    }
}

impl std::fmt::Debug for NodeDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeDispatcher")
            .field("actions", &self.actions)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::interpolate::InterpolateError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        releases: AtomicUsize,
    }

    impl ActionHandler for Counting {
        fn execute<'a>(
            &'a self,
            node: &'a Node,
            ctx: &'a mut ExecutionContext,
            _env: &'a DispatchEnv,
        ) -> BoxFuture<'a, HandlerResult> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                ctx.set("echo", node.data.get("msg").cloned().unwrap_or(Value::Null));
                Ok(Some("echo".to_string()))
            })
        }

        fn release<'a>(&'a self, _run_id: Uuid) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                self.releases.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    /// Replaces the string "{{name}}" with the `name` variable.
    struct NameOnly;

    impl Interpolator for NameOnly {
        fn resolve(&self, template: &Value, ctx: &ExecutionContext) -> Result<Value, InterpolateError> {
            let mut out = template.clone();
            if let Value::Object(map) = &mut out {
                for value in map.values_mut() {
                    if *value == "{{name}}" {
                        *value = ctx.get("name").cloned().unwrap_or(Value::Null);
                    }
                }
            }
            Ok(out)
        }
    }

    fn env() -> DispatchEnv {
        DispatchEnv::new(Uuid::now_v7(), "wf", false)
    }

    #[tokio::test]
    async fn set_variable_writes_key() {
        let dispatcher = NodeDispatcher::new(ActionRegistry::new());
        let mut ctx = ExecutionContext::new();
        let node = Node::new("v", "set_variable", json!({ "key": "result", "value": "ok" }));

        let out = dispatcher.dispatch(&node, &mut ctx, &env()).await.unwrap();
        assert_eq!(out.as_deref(), Some("result"));
        assert_eq!(ctx.get("result"), Some(&json!("ok")));
    }

    #[tokio::test]
    async fn unregistered_type_is_noop() {
        let dispatcher = NodeDispatcher::new(ActionRegistry::new());
        let mut ctx = ExecutionContext::new();
        let node = Node::new("x", "browser_navigate", json!({ "url": "https://example.com" }));

        let out = dispatcher.dispatch(&node, &mut ctx, &env()).await.unwrap();
        assert!(out.is_none());
        assert!(ctx.variables.is_empty());
    }

    #[tokio::test]
    async fn registered_action_runs_with_interpolated_data() {
        let handler = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        });
        let registry = ActionRegistry::new()
            .with("echo", handler.clone())
            .with("echo_alias", handler.clone());
        let dispatcher = NodeDispatcher::new(registry).with_interpolator(Arc::new(NameOnly));

        let mut ctx = ExecutionContext::new();
        ctx.set("name", json!("Ada"));
        let node = Node::new("e", "echo", json!({ "msg": "{{name}}" }));

        dispatcher.dispatch(&node, &mut ctx, &env()).await.unwrap();
        assert_eq!(ctx.get("echo"), Some(&json!("Ada")));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        dispatcher.release(Uuid::now_v7()).await;
        assert_eq!(handler.releases.load(Ordering::SeqCst), 1, "shared handler released once");
    }

    #[tokio::test]
    async fn invalid_params_fail_the_node() {
        let dispatcher = NodeDispatcher::new(ActionRegistry::new());
        let mut ctx = ExecutionContext::new();
        let node = Node::new("v", "set_variable", json!({}));

        let err = dispatcher.dispatch(&node, &mut ctx, &env()).await.unwrap_err();
        assert!(matches!(err, HandlerError::InvalidParams(_)));
    }

    #[test]
    fn retryability() {
        assert!(HandlerError::failed("x").is_retryable());
        assert!(HandlerError::Timeout(10).is_retryable());
        assert!(!HandlerError::ApprovalRequired { node_id: "a".into() }.is_retryable());
        assert!(!HandlerError::ApprovalRejected { node_id: "a".into() }.is_retryable());
    }
}
