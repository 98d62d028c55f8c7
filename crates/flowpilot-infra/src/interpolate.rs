//! `{{key}}` / `{{secret:NAME}}` template interpolation.
//!
//! Strings anywhere in a node's data are scanned for placeholders:
//!
//! - `{{key}}` resolves against the run context (dotted paths allowed).
//!   Unknown keys are left verbatim so literal braces survive.
//! - `{{secret:NAME}}` resolves from `FLOWPILOT_SECRET_NAME`, then `NAME`,
//!   in the process environment. An unknown secret is an error.
//!
//! A string that is exactly one placeholder takes the JSON type of the
//! resolved value; otherwise values are spliced in as text.

use std::collections::HashMap;

use flowpilot_core::workflow::context::ExecutionContext;
use flowpilot_core::workflow::interpolate::{InterpolateError, Interpolator};
use serde_json::Value;

const SECRET_PREFIX: &str = "secret:";
const SECRET_ENV_PREFIX: &str = "FLOWPILOT_SECRET_";

#[derive(Debug, Clone, Default)]
pub struct TemplateInterpolator {
    /// Checked before the environment.
    overrides: HashMap<String, String>,
}

impl TemplateInterpolator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a secret value that shadows the environment.
    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(name.into(), value.into());
        self
    }

    fn secret(&self, name: &str) -> Result<String, InterpolateError> {
        if let Some(value) = self.overrides.get(name) {
            return Ok(value.clone());
        }
        std::env::var(format!("{SECRET_ENV_PREFIX}{name}"))
            .or_else(|_| std::env::var(name))
            .map_err(|_| InterpolateError::UnknownSecret(name.to_string()))
    }

    /// `Ok(None)` means the placeholder is unknown and stays verbatim.
    fn lookup(&self, expr: &str, ctx: &ExecutionContext) -> Result<Option<Value>, InterpolateError> {
        if let Some(name) = expr.strip_prefix(SECRET_PREFIX) {
            let name = name.trim();
            if name.is_empty() {
                return Err(InterpolateError::Invalid("empty secret name".to_string()));
            }
            return self.secret(name).map(|s| Some(Value::String(s)));
        }
        Ok(ctx.get(expr).cloned())
    }

    fn resolve_str(&self, s: &str, ctx: &ExecutionContext) -> Result<Value, InterpolateError> {
        if let Some(expr) = whole_placeholder(s) {
            return Ok(self
                .lookup(expr, ctx)?
                .unwrap_or_else(|| Value::String(s.to_string())));
        }

        let mut out = String::with_capacity(s.len());
        let mut rest = s;
        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start + 2..].find("}}") else {
                break;
            };
            let end = start + 2 + len;
            let expr = rest[start + 2..end].trim();

            out.push_str(&rest[..start]);
            match self.lookup(expr, ctx)? {
                Some(Value::String(v)) => out.push_str(&v),
                Some(v) => out.push_str(&v.to_string()),
                None => out.push_str(&rest[start..end + 2]),
            }
            rest = &rest[end + 2..];
        }
        out.push_str(rest);
        Ok(Value::String(out))
    }
}

/// The trimmed expression when `s` is a single `{{...}}` and nothing else.
fn whole_placeholder(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

impl Interpolator for TemplateInterpolator {
    fn resolve(&self, template: &Value, ctx: &ExecutionContext) -> Result<Value, InterpolateError> {
        match template {
            Value::String(s) if s.contains("{{") => self.resolve_str(s, ctx),
            Value::Array(items) => items
                .iter()
                .map(|v| self.resolve(v, ctx))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.resolve(v, ctx)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }
}
