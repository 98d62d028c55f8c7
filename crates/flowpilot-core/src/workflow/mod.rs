//! Workflow engine core: graph indexing, scheduling, and run execution.
//!
//! - `graph` -- adjacency indices, deterministic topological order, cycle diagnostics
//! - `context` -- typed execution context persisted with every run
//! - `definition` -- definition snapshot selection and static validation
//! - `retry` -- per-node retry/timeout/backoff controller
//! - `dispatcher` -- node type to handler mapping and the action handler registry
//! - `branch` -- conditional branch evaluation and skip propagation
//! - `control` -- `loop_iterate` / `parallel_execute` and the inline task executor
//! - `approval` -- the manual approval gate
//! - `interpolate` -- template interpolation port
//! - `resume` -- derived resume-run construction
//! - `registry` -- active-run bookkeeping and shutdown drain
//! - `engine` -- the run state machine

pub mod approval;
pub mod branch;
pub mod context;
pub mod control;
pub mod definition;
pub mod dispatcher;
pub mod engine;
pub mod graph;
pub mod interpolate;
pub mod registry;
pub mod resume;
pub mod retry;
