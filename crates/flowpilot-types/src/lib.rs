//! Shared domain types for Flowpilot.
//!
//! This crate has no business logic. It defines the serde-serializable shapes
//! that flow between the engine (`flowpilot-core`), the storage adapters
//! (`flowpilot-infra`), and the CLI host (`flowpilot-api`).

pub mod config;
pub mod error;
pub mod event;
pub mod run;
pub mod workflow;
