//! Per-node retry, timeout, and exponential backoff.
//!
//! `RetryController` drives one node through up to `retry_count + 1`
//! attempts. Each attempt races the handler against a hard timeout. Between
//! failed attempts it sleeps `base * 2^(attempt-1)`. The approval-pause signal
//! is never retried; it comes back immediately as
//! [`NodeFailure::ApprovalPending`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use flowpilot_types::config::EngineConfig;
use flowpilot_types::run::Artifact;
use flowpilot_types::workflow::{ExecutionDefaults, Node, NodeOptions};
use futures_util::future::BoxFuture;
use thiserror::Error;

use super::context::ExecutionContext;
use super::dispatcher::{DispatchEnv, FailureCapture, HandlerError, HandlerResult, NodeDispatcher};

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Resolved retry budget for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_count: u32,
    pub timeout: Duration,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    /// Node override, else workflow default, else engine config.
    pub fn resolve(options: NodeOptions, defaults: &ExecutionDefaults, config: &EngineConfig) -> Self {
        let retry_count = options
            .retry_count
            .or(defaults.default_retries)
            .unwrap_or(config.default_retries);
        let timeout_ms = options
            .timeout_ms
            .or(defaults.default_node_timeout_ms)
            .unwrap_or(config.default_node_timeout_ms);

        Self {
            retry_count,
            timeout: Duration::from_millis(timeout_ms),
            base_backoff: config.retry_base_backoff(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }

    /// Delay after the given failed attempt (1-based): 250, 500, 1000, ...
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        self.base_backoff.saturating_mul(1u32 << shift)
    }
}

// ---------------------------------------------------------------------------
// NodeInvoker
// ---------------------------------------------------------------------------

/// One invocation of a node's handler, as seen by the retry controller.
pub trait NodeInvoker: Send + Sync {
    fn invoke<'a>(
        &'a self,
        node: &'a Node,
        ctx: &'a mut ExecutionContext,
        env: &'a DispatchEnv,
    ) -> BoxFuture<'a, HandlerResult>;

    fn capture_failure<'a>(
        &'a self,
        _node: &'a Node,
        _env: &'a DispatchEnv,
    ) -> BoxFuture<'a, Option<FailureCapture>> {
        Box::pin(async { None })
    }
}

impl NodeInvoker for NodeDispatcher {
    fn invoke<'a>(
        &'a self,
        node: &'a Node,
        ctx: &'a mut ExecutionContext,
        env: &'a DispatchEnv,
    ) -> BoxFuture<'a, HandlerResult> {
        self.dispatch(node, ctx, env)
    }

    fn capture_failure<'a>(
        &'a self,
        node: &'a Node,
        env: &'a DispatchEnv,
    ) -> BoxFuture<'a, Option<FailureCapture>> {
        Box::pin(NodeDispatcher::capture_failure(self, node, env))
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSuccess {
    pub output_key: Option<String>,
    /// Attempts actually used, not the budget.
    pub attempts: u32,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NodeFailure {
    #[error("approval required")]
    ApprovalPending,

    #[error("failed after {attempts} attempt(s): {error}")]
    RetryExhausted { attempts: u32, error: String },
}

/// A failed attempt, reported so the caller can log it.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptFailure {
    pub attempt: u32,
    pub error: String,
    pub at: DateTime<Utc>,
    /// Backoff slept before the next attempt, if there was one.
    pub backoff: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct RetryReport {
    pub outcome: Result<NodeSuccess, NodeFailure>,
    pub failures: Vec<AttemptFailure>,
    pub artifacts: Vec<Artifact>,
}

// ---------------------------------------------------------------------------
// RetryController
// ---------------------------------------------------------------------------

pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub async fn execute(
        &self,
        invoker: &dyn NodeInvoker,
        node: &Node,
        ctx: &mut ExecutionContext,
        env: &DispatchEnv,
    ) -> RetryReport {
        let max_attempts = self.policy.max_attempts();
        let mut failures = Vec::new();
        let mut artifacts = Vec::new();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = match tokio::time::timeout(self.policy.timeout, invoker.invoke(node, ctx, env)).await {
                Ok(result) => result,
                Err(_) => Err(HandlerError::Timeout(self.policy.timeout.as_millis() as u64)),
            };

            let error = match result {
                Ok(output_key) => {
                    return RetryReport {
                        outcome: Ok(NodeSuccess { output_key, attempts: attempt }),
                        failures,
                        artifacts,
                    };
                }
                Err(e) if e.is_approval_required() => {
                    return RetryReport {
                        outcome: Err(NodeFailure::ApprovalPending),
                        failures,
                        artifacts,
                    };
                }
                Err(e) => e,
            };

            if let Some(capture) = invoker.capture_failure(node, env).await {
                artifacts.push(Artifact {
                    node_id: node.id.clone(),
                    kind: capture.kind,
                    attempt,
                    captured_at: Utc::now(),
                    data: capture.data,
                });
            }

            let retry = attempt < max_attempts && error.is_retryable();
            let backoff = retry.then(|| self.policy.backoff_after(attempt));

            tracing::warn!(
                node_id = node.id.as_str(),
                attempt,
                max_attempts,
                error = %error,
                "node attempt failed"
            );

            failures.push(AttemptFailure {
                attempt,
                error: error.to_string(),
                at: Utc::now(),
                backoff,
            });

            match backoff {
                Some(delay) => tokio::time::sleep(delay).await,
                None => {
                    return RetryReport {
                        outcome: Err(NodeFailure::RetryExhausted {
                            attempts: attempt,
                            error: error.to_string(),
                        }),
                        failures,
                        artifacts,
                    };
                }
            }
        }
    }
}
