//! SQLite storage layer.
//!
//! Run and workflow documents backed by SQLite with WAL mode and split
//! read/write connection pools.

pub mod pool;
pub mod run;
