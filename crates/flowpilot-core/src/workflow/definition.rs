//! Definition snapshot selection and static validation.

use std::collections::HashSet;

use flowpilot_types::error::RepositoryError;
use flowpilot_types::run::Run;
use flowpilot_types::workflow::{WorkflowDefinition, WorkflowRecord};
use thiserror::Error;

use super::graph::find_cycle;

/// Errors from definition resolution.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("workflow '{0}' not found")]
    WorkflowNotFound(String),

    #[error("workflow '{0}' has no draft, definition, or published version")]
    NoDefinition(String),

    #[error("workflow '{workflow_id}' has no version {version}")]
    VersionNotFound { workflow_id: String, version: u32 },

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Pick the definition a run executes from a stored workflow record.
///
/// A pinned `workflow_version` must exist. Otherwise test-mode runs prefer
/// `draft -> definition -> published` and normal runs prefer
/// `published -> definition -> draft`.
pub fn select_definition(
    record: &WorkflowRecord,
    run: &Run,
) -> Result<WorkflowDefinition, DefinitionError> {
    if let Some(version) = run.workflow_version {
        return record
            .versions
            .get(&version)
            .cloned()
            .ok_or_else(|| DefinitionError::VersionNotFound {
                workflow_id: record.id.clone(),
                version,
            });
    }

    let chain = if run.test_mode {
        [&record.draft, &record.definition, &record.published]
    } else {
        [&record.published, &record.definition, &record.draft]
    };

    chain
        .into_iter()
        .find_map(|d| d.clone())
        .ok_or_else(|| DefinitionError::NoDefinition(record.id.clone()))
}

/// Problems found by [`validate_definition`]. None of these stop a run from
/// starting; the scheduler tolerates all of them.
pub fn validate_definition(definition: &WorkflowDefinition) -> Vec<String> {
    let mut issues = Vec::new();
    let mut seen = HashSet::new();

    for node in &definition.nodes {
        if !seen.insert(node.id.as_str()) {
            issues.push(format!("duplicate node id '{}'", node.id));
        }
        if let Err(e) = node.kind() {
            issues.push(e.to_string());
        }
    }

    for edge in &definition.edges {
        for endpoint in [&edge.source, &edge.target] {
            if !seen.contains(endpoint.as_str()) {
                issues.push(format!("edge '{}' references unknown node '{endpoint}'", edge.id));
            }
        }
    }

    if let Some(node) = find_cycle(definition) {
        issues.push(format!("cycle detected involving node '{node}'"));
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowpilot_types::workflow::{Edge, Node};
    use serde_json::json;

    fn def_with(node_id: &str) -> WorkflowDefinition {
        WorkflowDefinition {
            nodes: vec![Node::new(node_id, "start", json!({}))],
            ..Default::default()
        }
    }

    fn record() -> WorkflowRecord {
        WorkflowRecord {
            id: "wf".into(),
            name: "wf".into(),
            draft: Some(def_with("draft")),
            definition: Some(def_with("definition")),
            published: Some(def_with("published")),
            versions: [(3, def_with("v3"))].into_iter().collect(),
        }
    }

    fn first_node(def: WorkflowDefinition) -> String {
        def.nodes[0].id.clone()
    }

    #[test]
    fn test_mode_prefers_draft() {
        let run = Run::new("wf", json!({}), true);
        assert_eq!(first_node(select_definition(&record(), &run).unwrap()), "draft");
    }

    #[test]
    fn normal_mode_prefers_published() {
        let run = Run::new("wf", json!({}), false);
        assert_eq!(first_node(select_definition(&record(), &run).unwrap()), "published");
    }

    #[test]
    fn fallback_chain_uses_definition() {
        let mut rec = record();
        rec.published = None;
        let run = Run::new("wf", json!({}), false);
        assert_eq!(first_node(select_definition(&rec, &run).unwrap()), "definition");

        rec.definition = None;
        assert_eq!(first_node(select_definition(&rec, &run).unwrap()), "draft");
    }

    #[test]
    fn pinned_version_wins() {
        let mut run = Run::new("wf", json!({}), true);
        run.workflow_version = Some(3);
        assert_eq!(first_node(select_definition(&record(), &run).unwrap()), "v3");

        run.workflow_version = Some(9);
        let err = select_definition(&record(), &run).unwrap_err();
        assert!(matches!(err, DefinitionError::VersionNotFound { version: 9, .. }));
    }

    #[test]
    fn empty_record_is_an_error() {
        let rec = WorkflowRecord {
            id: "wf".into(),
            ..Default::default()
        };
        let run = Run::new("wf", json!({}), false);
        assert!(matches!(
            select_definition(&rec, &run),
            Err(DefinitionError::NoDefinition(_))
        ));
    }

    #[test]
    fn validation_reports_problems() {
        let def = WorkflowDefinition {
            nodes: vec![
                Node::new("a", "start", json!({})),
                Node::new("a", "set_variable", json!({})),
                Node::new("b", "start", json!({})),
            ],
            edges: vec![
                Edge::new("e1", "a", "b"),
                Edge::new("e2", "b", "a"),
                Edge::new("e3", "b", "ghost"),
            ],
            ..Default::default()
        };
        let issues = validate_definition(&def);
        assert!(issues.iter().any(|i| i.contains("duplicate node id 'a'")));
        assert!(issues.iter().any(|i| i.contains("invalid parameters")));
        assert!(issues.iter().any(|i| i.contains("unknown node 'ghost'")));
        assert!(issues.iter().any(|i| i.contains("cycle detected")));
    }
}
