//! Template interpolation port.
//!
//! Node data may contain `{{key}}` / `{{secret:name}}` placeholders. The engine
//! resolves node data through an [`Interpolator`] right before dispatch but
//! never implements substitution itself; `flowpilot-infra` provides the real
//! implementation.

use serde_json::Value;
use thiserror::Error;

use super::context::ExecutionContext;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InterpolateError {
    #[error("unknown secret '{0}'")]
    UnknownSecret(String),

    #[error("invalid template: {0}")]
    Invalid(String),
}

/// Resolves placeholders in a JSON value against the run context.
pub trait Interpolator: Send + Sync {
    fn resolve(&self, template: &Value, ctx: &ExecutionContext) -> Result<Value, InterpolateError>;
}

/// Returns templates unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughInterpolator;

impl Interpolator for PassthroughInterpolator {
    fn resolve(&self, template: &Value, _ctx: &ExecutionContext) -> Result<Value, InterpolateError> {
        Ok(template.clone())
    }
}
