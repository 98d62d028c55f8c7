//! Repository trait definitions (ports).
//!
//! Each submodule defines an async trait that the infrastructure layer
//! implements. Traits use RPITIT (native async fn in traits, Rust 2024).

pub mod run;
