//! Run state machine: pass-based scheduling with per-transition persistence.
//!
//! The `Engine` drives one run at a time per run id. Each pass walks the
//! definition in topological order and runs every node whose predecessors
//! have all settled, one node at a time. Every node transition is persisted
//! before the next one starts, so a crash or approval pause never loses a
//! completed node.
//!
//! # Execution flow
//!
//! 1. Register with the active-run registry (refused while shutting down).
//! 2. Load the run and resolve its definition snapshot.
//! 3. Seed the context (persisted context, then input) and queued node states.
//! 4. Mark the run `RUNNING`, persist, emit `run.started`.
//! 5. Scan passes until nothing is pending, an approval pauses the run, the
//!    global timeout fires, or a pass makes no progress.
//! 6. Persist the terminal status and emit `run.succeeded` / `run.failed`.
//! 7. Release handler resources and deregister.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flowpilot_types::config::EngineConfig;
use flowpilot_types::error::RepositoryError;
use flowpilot_types::event::{FailedNode, LifecycleEvent};
use flowpilot_types::run::{LogLevel, NodeState, NodeStatus, Run, RunLogEntry, RunStatus};
use flowpilot_types::workflow::{Node, WorkflowDefinition};
use tokio::time::Instant;
use uuid::Uuid;

use crate::event::notifier::{self, LifecycleNotifier, NoopNotifier};
use crate::repository::run::{DefinitionResolver, RunRepository};

use super::branch;
use super::context::ExecutionContext;
use super::definition::DefinitionError;
use super::dispatcher::{DispatchEnv, NodeDispatcher};
use super::graph::{WorkflowGraph, find_cycle, topological_order};
use super::registry::{ActiveRunRegistry, DrainReport, RegistryError};
use super::resume::build_resume_run;
use super::retry::{NodeFailure, RetryController, RetryPolicy};

/// Error recorded on every node left pending by a pass that made no progress.
pub const UNRESOLVABLE_MESSAGE: &str = "unresolvable dependency or cycle: node never became ready";

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("shutting down, not accepting new runs")]
    ShuttingDown,

    #[error("run {0} is already executing")]
    AlreadyActive(Uuid),

    #[error("run {run_id} is {status}; only FAILED runs can be resumed")]
    NotResumable { run_id: Uuid, status: RunStatus },

    #[error("run {run_id} already finished with status {status}")]
    RunFinished { run_id: Uuid, status: RunStatus },

    #[error("invalid persisted context: {0}")]
    Context(#[from] serde_json::Error),
}

impl From<RegistryError> for EngineError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::ShuttingDown => Self::ShuttingDown,
            RegistryError::AlreadyActive(id) => Self::AlreadyActive(id),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Generic over the run store and the definition resolver; both are usually
/// the same infra object behind two `Arc`s.
pub struct Engine<R: RunRepository, D: DefinitionResolver> {
    repo: Arc<R>,
    definitions: Arc<D>,
    dispatcher: Arc<NodeDispatcher>,
    notifier: Arc<dyn LifecycleNotifier>,
    registry: ActiveRunRegistry,
    config: EngineConfig,
}

impl<R: RunRepository, D: DefinitionResolver> Clone for Engine<R, D> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
            definitions: Arc::clone(&self.definitions),
            dispatcher: Arc::clone(&self.dispatcher),
            notifier: Arc::clone(&self.notifier),
            registry: self.registry.clone(),
            config: self.config.clone(),
        }
    }
}

/// How a scheduling loop ended without pausing.
enum PassOutcome {
    Settled,
    GlobalTimeout(Duration),
    Unresolvable,
}

impl<R: RunRepository, D: DefinitionResolver> Engine<R, D> {
    pub fn new(
        repo: Arc<R>,
        definitions: Arc<D>,
        dispatcher: Arc<NodeDispatcher>,
        config: EngineConfig,
    ) -> Self {
        Self {
            repo,
            definitions,
            dispatcher,
            notifier: Arc::new(NoopNotifier),
            registry: ActiveRunRegistry::new(),
            config,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn LifecycleNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Share a registry with other engine handles in the same process.
    pub fn with_registry(mut self, registry: ActiveRunRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn repo(&self) -> &Arc<R> {
        &self.repo
    }

    pub fn registry(&self) -> &ActiveRunRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn active_run_count(&self) -> usize {
        self.registry.count()
    }

    pub fn begin_shutdown(&self) {
        tracing::info!(active = self.registry.count(), "engine shutting down");
        self.registry.begin_shutdown();
    }

    pub async fn wait_for_active_runs(&self, timeout: Duration) -> DrainReport {
        self.registry
            .wait_for_drain(timeout, self.config.drain_poll_interval())
            .await
    }

    /// Drive a run until it finishes or pauses for approval.
    ///
    /// Re-invoking on a `WAITING_APPROVAL` run continues from the paused node.
    /// A run that is already terminal is returned as-is.
    pub async fn start_or_resume(&self, run_id: Uuid) -> Result<RunStatus, EngineError> {
        let _guard = self.registry.register(run_id)?;

        let result = self.drive(run_id).await;
        self.dispatcher.release(run_id).await;

        if let Err(e) = &result {
            tracing::error!(run_id = %run_id, error = %e, "run aborted");
            self.mark_aborted(run_id, e).await;
        }
        result
    }

    /// Record an approval decision for `node_id` and re-enter the run.
    pub async fn approve(
        &self,
        run_id: Uuid,
        node_id: &str,
        approved: bool,
    ) -> Result<RunStatus, EngineError> {
        if self.registry.is_active(&run_id) {
            return Err(EngineError::AlreadyActive(run_id));
        }
        let mut run = self.load(run_id).await?;
        if run.status.is_terminal() {
            return Err(EngineError::RunFinished {
                run_id,
                status: run.status,
            });
        }

        let mut ctx = ExecutionContext::from_json(&run.context)?;
        ctx.set_approval(node_id, approved);

        let verdict = if approved { "approved" } else { "rejected" };
        run.logs.push(RunLogEntry::node(
            LogLevel::Info,
            node_id,
            "approval",
            format!("approval {verdict}"),
        ));
        tracing::info!(run_id = %run_id, node_id, approved, "approval recorded");
        self.persist(&mut run, &ctx).await?;

        self.start_or_resume(run_id).await
    }

    /// Build and store a new run that continues a failed one.
    ///
    /// Succeeded nodes carry over and will not run again; every other node is
    /// reset to `queued`. The source run is left untouched.
    pub async fn create_resume_run(&self, source_run_id: Uuid) -> Result<Run, EngineError> {
        let source = self.load(source_run_id).await?;
        if source.status != RunStatus::Failed {
            return Err(EngineError::NotResumable {
                run_id: source_run_id,
                status: source.status,
            });
        }

        let mut run = build_resume_run(&source, Uuid::now_v7());
        run.logs.push(RunLogEntry::run(
            LogLevel::Info,
            "resume",
            format!("resumed from run {source_run_id}"),
        ));
        self.repo.create_or_update_run(&run).await?;

        tracing::info!(
            run_id = %run.id,
            source_run_id = %source_run_id,
            checkpoint = run.checkpoint_node_id.as_deref().unwrap_or("-"),
            "resume run created"
        );
        Ok(run)
    }

    // -----------------------------------------------------------------------
    // State machine
    // -----------------------------------------------------------------------

    async fn drive(&self, run_id: Uuid) -> Result<RunStatus, EngineError> {
        let mut run = self.load(run_id).await?;
        if run.status.is_terminal() {
            tracing::debug!(run_id = %run_id, status = %run.status, "run already finished");
            return Ok(run.status);
        }

        let definition = self.definitions.resolve(&run).await?;

        let mut ctx = ExecutionContext::from_json(&run.context)?
            .with_network_log_capacity(self.config.network_log_capacity);
        ctx.merge_input(&run.input);

        for node in &definition.nodes {
            run.node_states
                .entry(node.id.clone())
                .or_insert_with(NodeState::queued);
        }

        run.status = RunStatus::Running;
        run.error = None;
        run.logs
            .push(RunLogEntry::run(LogLevel::Info, "run_started", "run started"));
        self.persist(&mut run, &ctx).await?;
        self.emit(LifecycleEvent::RunStarted {
            run_id,
            workflow_id: run.workflow_id.clone(),
        });

        tracing::info!(
            run_id = %run_id,
            workflow_id = run.workflow_id.as_str(),
            nodes = definition.nodes.len(),
            test_mode = run.test_mode,
            "run started"
        );

        let env = DispatchEnv {
            run_id,
            workflow_id: run.workflow_id.clone(),
            test_mode: run.test_mode,
            defaults: definition.execution,
            parallel_task_timeout: self.config.parallel_task_timeout(),
        };

        let outcome = match self.run_passes(&mut run, &mut ctx, &definition, &env).await? {
            Some(outcome) => outcome,
            None => return Ok(RunStatus::WaitingApproval),
        };

        self.finish(&mut run, &ctx, &definition, outcome).await
    }

    /// Scan passes until the run settles. `None` means the run paused for approval.
    async fn run_passes(
        &self,
        run: &mut Run,
        ctx: &mut ExecutionContext,
        definition: &WorkflowDefinition,
        env: &DispatchEnv,
    ) -> Result<Option<PassOutcome>, EngineError> {
        let graph = WorkflowGraph::build(definition);
        let global_timeout = Duration::from_millis(
            definition
                .execution
                .global_timeout_ms
                .unwrap_or(self.config.default_global_timeout_ms),
        );
        let started = Instant::now();
        let mut pass = 0u32;

        loop {
            let pending = definition
                .nodes
                .iter()
                .filter(|n| !run.node_status(&n.id).is_some_and(NodeStatus::is_terminal))
                .count();
            if pending == 0 {
                return Ok(Some(PassOutcome::Settled));
            }

            pass += 1;
            tracing::debug!(run_id = %run.id, pass, pending, "scheduler pass");

            let mut progressed = false;
            for node_id in topological_order(definition) {
                let Some(node) = definition.node(node_id) else {
                    continue;
                };
                if run.node_status(node_id).is_some_and(NodeStatus::is_terminal) {
                    continue;
                }

                let predecessors = graph.predecessors_of(node_id);
                let waiting = predecessors.iter().any(|p| {
                    !run.node_status(p).is_some_and(NodeStatus::is_terminal)
                });
                if waiting {
                    continue;
                }

                let upstream_broken = predecessors.iter().any(|p| {
                    matches!(
                        run.node_status(p),
                        Some(NodeStatus::Failed | NodeStatus::Skipped)
                    )
                });
                let reason = if upstream_broken {
                    Some("upstream node failed or was skipped")
                } else if branch::should_skip(node_id, &graph, definition, &run.node_states, ctx) {
                    Some("branch not selected")
                } else {
                    None
                };

                progressed = true;
                if let Some(reason) = reason {
                    self.skip_node(run, ctx, node_id, reason).await?;
                    continue;
                }

                // Checked between nodes only; a running handler is bounded by its own timeout.
                if started.elapsed() > global_timeout {
                    return Ok(Some(PassOutcome::GlobalTimeout(global_timeout)));
                }
                if !self.execute_node(run, ctx, node, env).await? {
                    return Ok(None);
                }
            }

            if !progressed {
                return Ok(Some(PassOutcome::Unresolvable));
            }
        }
    }

    async fn skip_node(
        &self,
        run: &mut Run,
        ctx: &ExecutionContext,
        node_id: &str,
        reason: &str,
    ) -> Result<(), EngineError> {
        let state = run.node_states.entry(node_id.to_string()).or_default();
        state.status = NodeStatus::Skipped;
        state.finished_at = Some(Utc::now());
        run.logs
            .push(RunLogEntry::node(LogLevel::Info, node_id, "skipped", reason));

        tracing::debug!(run_id = %run.id, node_id, reason, "node skipped");
        self.persist(run, ctx).await
    }

    /// Run one node through the retry controller. Returns `false` when the
    /// run paused for approval.
    async fn execute_node(
        &self,
        run: &mut Run,
        ctx: &mut ExecutionContext,
        node: &Node,
        env: &DispatchEnv,
    ) -> Result<bool, EngineError> {
        let node_id = node.id.as_str();
        let started_at = Utc::now();
        {
            let state = run.node_states.entry(node.id.clone()).or_default();
            state.status = NodeStatus::Running;
            state.started_at = Some(started_at);
            state.finished_at = None;
            state.error = None;
        }
        run.logs.push(RunLogEntry::node(
            LogLevel::Info,
            node_id,
            "start",
            format!("{} started", node.node_type),
        ));
        self.persist(run, ctx).await?;

        tracing::debug!(
            run_id = %run.id,
            node_id,
            node_type = node.node_type.as_str(),
            "node started"
        );

        let policy = RetryPolicy::resolve(node.options(), &env.defaults, &self.config);
        let clock = Instant::now();
        let report = RetryController::new(policy)
            .execute(self.dispatcher.as_ref(), node, ctx, env)
            .await;
        let duration_ms = clock.elapsed().as_millis() as u64;

        for failure in &report.failures {
            if let Some(backoff) = failure.backoff {
                run.logs.push(RunLogEntry::node(
                    LogLevel::Warn,
                    node_id,
                    "retry",
                    format!(
                        "attempt {} failed: {}; retrying in {}ms",
                        failure.attempt,
                        failure.error,
                        backoff.as_millis()
                    ),
                ));
            }
        }
        run.artifacts.extend(report.artifacts);

        let state = run.node_states.entry(node.id.clone()).or_default();
        match report.outcome {
            Ok(success) => {
                state.status = NodeStatus::Succeeded;
                state.attempts = success.attempts;
                state.output_key = success.output_key;
                state.finished_at = Some(Utc::now());
                state.duration_ms = Some(duration_ms);
                run.checkpoint_node_id = Some(node.id.clone());
                run.logs.push(RunLogEntry::node(
                    LogLevel::Info,
                    node_id,
                    "succeeded",
                    format!("succeeded after {} attempt(s)", success.attempts),
                ));
                self.persist(run, ctx).await?;

                tracing::debug!(run_id = %run.id, node_id, attempts = success.attempts, "checkpoint advanced");
                Ok(true)
            }
            Err(NodeFailure::ApprovalPending) => {
                state.reset();
                run.status = RunStatus::WaitingApproval;
                run.logs.push(RunLogEntry::node(
                    LogLevel::Info,
                    node_id,
                    "waiting_approval",
                    "waiting for approval",
                ));
                self.persist(run, ctx).await?;
                self.emit(LifecycleEvent::RunWaitingApproval {
                    run_id: run.id,
                    workflow_id: run.workflow_id.clone(),
                    node_id: node.id.clone(),
                });

                tracing::info!(run_id = %run.id, node_id, "run paused for approval");
                Ok(false)
            }
            Err(failure @ NodeFailure::RetryExhausted { attempts, .. }) => {
                let message = failure.to_string();
                state.status = NodeStatus::Failed;
                state.attempts = attempts;
                state.error = Some(message.clone());
                state.finished_at = Some(Utc::now());
                state.duration_ms = Some(duration_ms);
                run.logs
                    .push(RunLogEntry::node(LogLevel::Error, node_id, "failed", message));
                self.persist(run, ctx).await?;

                tracing::debug!(run_id = %run.id, node_id, attempts, "node failed");
                Ok(true)
            }
        }
    }

    async fn finish(
        &self,
        run: &mut Run,
        ctx: &ExecutionContext,
        definition: &WorkflowDefinition,
        outcome: PassOutcome,
    ) -> Result<RunStatus, EngineError> {
        let mut run_error = None;

        match outcome {
            PassOutcome::Settled => {}
            PassOutcome::GlobalTimeout(limit) => {
                let message = format!("global timeout of {}ms exceeded", limit.as_millis());
                tracing::warn!(run_id = %run.id, "{message}");
                // Pending nodes stay queued; each gets a log entry saying why it never ran.
                for node_id in topological_order(definition) {
                    if run.node_status(node_id).is_some_and(NodeStatus::is_terminal) {
                        continue;
                    }
                    run.logs.push(RunLogEntry::node(
                        LogLevel::Warn,
                        node_id,
                        "timeout",
                        "not started: run aborted by global timeout",
                    ));
                }
                run.logs
                    .push(RunLogEntry::run(LogLevel::Error, "timeout", message.clone()));
                run_error = Some(message);
            }
            PassOutcome::Unresolvable => {
                let cycle = find_cycle(definition);
                tracing::warn!(
                    run_id = %run.id,
                    cycle_node = cycle.as_deref().unwrap_or("-"),
                    "scheduler pass made no progress, failing pending nodes"
                );
                let now = Utc::now();
                for node_id in topological_order(definition) {
                    let Some(state) = run.node_states.get_mut(node_id) else {
                        continue;
                    };
                    if state.status.is_terminal() {
                        continue;
                    }
                    state.status = NodeStatus::Failed;
                    state.error = Some(UNRESOLVABLE_MESSAGE.to_string());
                    state.finished_at = Some(now);
                    run.logs.push(RunLogEntry::node(
                        LogLevel::Error,
                        node_id,
                        "failed",
                        UNRESOLVABLE_MESSAGE,
                    ));
                }
            }
        }

        let failed_nodes: Vec<FailedNode> = run
            .node_states
            .iter()
            .filter(|(_, s)| s.status == NodeStatus::Failed)
            .map(|(id, s)| FailedNode {
                node_id: id.clone(),
                error: s.error.clone(),
            })
            .collect();

        if run_error.is_none() && !failed_nodes.is_empty() {
            let ids: Vec<&str> = failed_nodes.iter().map(|f| f.node_id.as_str()).collect();
            run_error = Some(format!("failed nodes: {}", ids.join(", ")));
        }

        let status = if run_error.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        run.status = status;
        run.error = run_error.clone();
        run.logs.push(RunLogEntry::run(
            if status == RunStatus::Failed { LogLevel::Error } else { LogLevel::Info },
            "run_finished",
            format!("run finished with status {status}"),
        ));
        self.persist(run, ctx).await?;

        let event = match status {
            RunStatus::Succeeded => LifecycleEvent::RunSucceeded {
                run_id: run.id,
                workflow_id: run.workflow_id.clone(),
            },
            _ => LifecycleEvent::RunFailed {
                run_id: run.id,
                workflow_id: run.workflow_id.clone(),
                error: run_error,
                failed_nodes,
            },
        };
        self.emit(event);

        tracing::info!(run_id = %run.id, status = %status, "run finished");
        Ok(status)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Mark a run `FAILED` after `drive` returned an error, so pollers see it
    /// finish. Best effort: a second failure here is only logged.
    async fn mark_aborted(&self, run_id: Uuid, error: &EngineError) {
        let mut run = match self.repo.get_run(&run_id).await {
            Ok(Some(run)) => run,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "could not reload aborted run");
                return;
            }
        };
        if run.status.is_terminal() {
            return;
        }

        let message = error.to_string();
        run.status = RunStatus::Failed;
        run.error = Some(message.clone());
        run.logs.push(RunLogEntry::run(
            LogLevel::Error,
            "run_finished",
            format!("run aborted: {message}"),
        ));
        run.updated_at = Utc::now();
        if let Err(e) = self.repo.create_or_update_run(&run).await {
            tracing::warn!(run_id = %run_id, error = %e, "could not persist aborted run");
            return;
        }

        self.emit(LifecycleEvent::RunFailed {
            run_id,
            workflow_id: run.workflow_id.clone(),
            error: Some(message),
            failed_nodes: Vec::new(),
        });
    }

    async fn load(&self, run_id: Uuid) -> Result<Run, EngineError> {
        self.repo
            .get_run(&run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))
    }

    /// Store the run with the current context. Durable on return.
    async fn persist(&self, run: &mut Run, ctx: &ExecutionContext) -> Result<(), EngineError> {
        run.context = ctx.to_json();
        run.updated_at = Utc::now();
        self.repo.create_or_update_run(run).await?;
        Ok(())
    }

    fn emit(&self, event: LifecycleEvent) {
        notifier::dispatch(Arc::clone(&self.notifier), event);
    }
}
