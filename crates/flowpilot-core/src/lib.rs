//! Workflow execution engine and repository trait definitions for Flowpilot.
//!
//! This crate defines the "ports" (repository, resolver, notifier, action
//! handler traits) that the infrastructure layer implements. It depends only
//! on `flowpilot-types` -- never on `flowpilot-infra` or any database/IO crate.

pub mod event;
pub mod repository;
pub mod workflow;
