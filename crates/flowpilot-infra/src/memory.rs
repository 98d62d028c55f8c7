//! In-memory run store.
//!
//! Implements both `RunRepository` and `DefinitionResolver` over `DashMap`s.
//! Used by tests and by hosts that do not need runs to outlive the process.

use dashmap::DashMap;
use flowpilot_core::repository::run::{DefinitionResolver, RunRepository};
use flowpilot_core::workflow::definition::{DefinitionError, select_definition};
use flowpilot_types::error::RepositoryError;
use flowpilot_types::run::Run;
use flowpilot_types::workflow::{WorkflowDefinition, WorkflowRecord};
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: DashMap<Uuid, Run>,
    workflows: DashMap<String, WorkflowRecord>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a workflow record.
    pub fn save_workflow(&self, record: WorkflowRecord) {
        self.workflows.insert(record.id.clone(), record);
    }

    pub fn get_workflow(&self, workflow_id: &str) -> Option<WorkflowRecord> {
        self.workflows.get(workflow_id).map(|r| r.clone())
    }

    /// All stored runs, oldest first.
    pub fn list_runs(&self) -> Vec<Run> {
        let mut runs: Vec<Run> = self.runs.iter().map(|r| r.value().clone()).collect();
        runs.sort_by_key(|r| r.created_at);
        runs
    }
}

impl RunRepository for InMemoryRunStore {
    async fn create_or_update_run(&self, run: &Run) -> Result<(), RepositoryError> {
        self.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<Run>, RepositoryError> {
        Ok(self.runs.get(run_id).map(|r| r.clone()))
    }
}

impl DefinitionResolver for InMemoryRunStore {
    async fn resolve(&self, run: &Run) -> Result<WorkflowDefinition, DefinitionError> {
        let record = self
            .workflows
            .get(&run.workflow_id)
            .ok_or_else(|| DefinitionError::WorkflowNotFound(run.workflow_id.clone()))?;
        select_definition(&record, run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowpilot_types::workflow::Node;
    use serde_json::json;

    fn definition(node_type: &str) -> WorkflowDefinition {
        WorkflowDefinition {
            nodes: vec![Node::new("n", node_type, json!({}))],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn run_round_trip() {
        let store = InMemoryRunStore::new();
        let run = Run::new("wf", json!({ "a": 1 }), false);

        store.create_or_update_run(&run).await.unwrap();
        let loaded = store.get_run(&run.id).await.unwrap().unwrap();

        assert_eq!(loaded, run);
        assert!(store.get_run(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resolve_follows_mode_chain() {
        let store = InMemoryRunStore::new();
        store.save_workflow(WorkflowRecord {
            id: "wf".into(),
            draft: Some(definition("draft")),
            published: Some(definition("published")),
            ..Default::default()
        });

        let test_run = Run::new("wf", json!({}), true);
        let live_run = Run::new("wf", json!({}), false);

        assert_eq!(store.resolve(&test_run).await.unwrap().nodes[0].node_type, "draft");
        assert_eq!(store.resolve(&live_run).await.unwrap().nodes[0].node_type, "published");
    }

    #[tokio::test]
    async fn resolve_unknown_workflow() {
        let store = InMemoryRunStore::new();
        let err = store.resolve(&Run::new("missing", json!({}), false)).await.unwrap_err();
        assert!(matches!(err, DefinitionError::WorkflowNotFound(id) if id == "missing"));
    }
}
