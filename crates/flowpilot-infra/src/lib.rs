//! Infrastructure layer for Flowpilot.
//!
//! Contains implementations of the ports defined in `flowpilot-core`: SQLite
//! and in-memory run stores, configuration and data-directory resolution, the
//! template interpolator, and the built-in HTTP and desktop-agent action
//! handlers.

pub mod action;
pub mod config;
pub mod filesystem;
pub mod interpolate;
pub mod memory;
pub mod sqlite;
