//! Run persistence and definition resolution traits.
//!
//! The engine consumes two storage ports: `RunRepository` for the run
//! documents it drives, and `DefinitionResolver` for the immutable definition
//! snapshot a run executes. `flowpilot-infra` implements both for SQLite and
//! for an in-memory store.

use flowpilot_types::error::RepositoryError;
use flowpilot_types::run::Run;
use flowpilot_types::workflow::WorkflowDefinition;
use uuid::Uuid;

use crate::workflow::definition::DefinitionError;

/// Repository trait for run persistence.
///
/// `create_or_update_run` must be durable when it returns: the scheduler relies
/// on every node transition being stored before the next one begins. Writes
/// are last-write-wins; only one state machine drives a run id at a time.
pub trait RunRepository: Send + Sync {
    /// Insert or fully replace a run.
    fn create_or_update_run(
        &self,
        run: &Run,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a run by id.
    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Run>, RepositoryError>> + Send;
}

/// Selects the definition snapshot a run executes.
pub trait DefinitionResolver: Send + Sync {
    fn resolve(
        &self,
        run: &Run,
    ) -> impl std::future::Future<Output = Result<WorkflowDefinition, DefinitionError>> + Send;
}
