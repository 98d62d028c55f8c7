//! Lifecycle event distribution.
//!
//! - `bus` -- broadcast channel for in-process subscribers
//! - `notifier` -- the notifier port the engine emits through, best-effort

pub mod bus;
pub mod notifier;
