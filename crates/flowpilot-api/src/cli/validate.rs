//! Workflow file loading and the `validate` command.

use std::path::Path;

use anyhow::{Context, Result};
use console::style;
use serde::Deserialize;

use flowpilot_core::workflow::definition::validate_definition;
use flowpilot_core::workflow::graph::topological_order;
use flowpilot_types::workflow::{WorkflowDefinition, WorkflowRecord};

/// On-disk workflow file: a definition plus optional identity.
///
/// ```json
/// { "id": "orders", "name": "Order sync", "nodes": [...], "edges": [...] }
/// ```
#[derive(Debug, Deserialize)]
pub struct WorkflowFile {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub definition: WorkflowDefinition,
}

impl WorkflowFile {
    /// Record with the definition stored as both draft and published, so test
    /// and production runs execute the same graph. The id defaults to the
    /// file stem.
    pub fn into_record(self, path: &Path) -> WorkflowRecord {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workflow".to_string());
        let id = self.id.unwrap_or(stem);
        WorkflowRecord {
            name: self.name.unwrap_or_else(|| id.clone()),
            id,
            draft: Some(self.definition.clone()),
            definition: None,
            published: Some(self.definition),
            versions: Default::default(),
        }
    }
}

pub fn load_workflow_file(path: &Path) -> Result<WorkflowFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read workflow file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse workflow file {}", path.display()))
}

/// Returns `true` when no issues were found.
pub fn handle_validate(path: &Path, json: bool) -> Result<bool> {
    let file = load_workflow_file(path)?;
    let definition = &file.definition;
    let issues = validate_definition(definition);
    let order = topological_order(definition);

    if json {
        let out = serde_json::json!({
            "valid": issues.is_empty(),
            "nodes": definition.nodes.len(),
            "edges": definition.edges.len(),
            "order": order,
            "issues": issues,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(issues.is_empty());
    }

    println!();
    if issues.is_empty() {
        println!(
            "  {} {} is valid ({} nodes, {} edges)",
            style("*").green().bold(),
            style(path.display()).cyan(),
            definition.nodes.len(),
            definition.edges.len()
        );
        println!("  Order: {}", style(order.join(" -> ")).dim());
    } else {
        println!(
            "  {} {} has {} issue(s):",
            style("!").red().bold(),
            style(path.display()).cyan(),
            issues.len()
        );
        for issue in &issues {
            println!("    - {issue}");
        }
    }
    println!();

    Ok(issues.is_empty())
}
