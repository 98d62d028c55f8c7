//! Run commands: run, approve, resume, status and list.

use std::future::Future;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use flowpilot_core::repository::run::{DefinitionResolver, RunRepository};
use flowpilot_core::workflow::engine::EngineError;
use flowpilot_types::event::LifecycleEvent;
use flowpilot_types::run::{NodeStatus, Run, RunStatus};

use super::validate::load_workflow_file;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn handle_run(
    state: &AppState,
    file: &Path,
    input: Option<&str>,
    test_mode: bool,
    json: bool,
) -> Result<RunStatus> {
    let record = load_workflow_file(file)?.into_record(file);
    let input = parse_input(input)?;

    state
        .store
        .save_workflow(&record)
        .await
        .map_err(|e| anyhow!("Failed to save workflow: {e}"))?;

    let run = Run::new(&record.id, input, test_mode);
    state
        .store
        .create_or_update_run(&run)
        .await
        .map_err(|e| anyhow!("Failed to create run: {e}"))?;
    tracing::info!(run_id = %run.id, workflow_id = record.id.as_str(), test_mode, "run created");

    let engine = state.engine.clone();
    let run_id = run.id;
    let status = supervise(state, json, async move { engine.start_or_resume(run_id).await }).await?;

    print_run(state, run_id, json).await?;
    Ok(status)
}

fn parse_input(input: Option<&str>) -> Result<Value> {
    let Some(raw) = input else {
        return Ok(Value::Object(Default::default()));
    };
    let value: Value = serde_json::from_str(raw).context("--input must be valid JSON")?;
    if !value.is_object() {
        bail!("--input must be a JSON object");
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// Approve / Resume
// ---------------------------------------------------------------------------

pub async fn handle_approve(
    state: &AppState,
    run_id: Uuid,
    node_id: &str,
    approved: bool,
    json: bool,
) -> Result<RunStatus> {
    let engine = state.engine.clone();
    let node = node_id.to_string();
    let status = supervise(state, json, async move {
        engine.approve(run_id, &node, approved).await
    })
    .await?;

    print_run(state, run_id, json).await?;
    Ok(status)
}

pub async fn handle_resume(state: &AppState, run_id: Uuid, json: bool) -> Result<RunStatus> {
    let resumed = state.engine.create_resume_run(run_id).await?;
    if !json {
        println!();
        println!(
            "  {} Resuming {} as {}",
            style("*").green().bold(),
            style(short_id(&run_id)).cyan(),
            style(short_id(&resumed.id)).cyan()
        );
        if let Some(checkpoint) = &resumed.checkpoint_node_id {
            println!("  Checkpoint: {}", style(checkpoint).dim());
        }
    }

    let engine = state.engine.clone();
    let new_id = resumed.id;
    let status = supervise(state, json, async move { engine.start_or_resume(new_id).await }).await?;

    print_run(state, new_id, json).await?;
    Ok(status)
}

/// Drive a run to its next stable state. On Ctrl+C/SIGTERM, stop accepting
/// new runs and wait up to `drain_timeout_ms` for in-flight ones.
async fn supervise<F>(state: &AppState, json: bool, drive: F) -> Result<RunStatus>
where
    F: Future<Output = Result<RunStatus, EngineError>> + Send + 'static,
{
    let printer = (!json).then(|| spawn_event_printer(state.events.subscribe()));
    let mut task = tokio::spawn(drive);

    let result = tokio::select! {
        joined = &mut task => joined.context("run task panicked")?.map_err(anyhow::Error::from),
        _ = crate::shutdown_signal() => {
            state.engine.begin_shutdown();
            if !json {
                println!("\n  {} Shutting down, waiting for active runs...", style("!").yellow().bold());
            }
            let report = state.engine.wait_for_active_runs(state.config.drain_timeout()).await;
            if json {
                println!(
                    "{}",
                    serde_json::json!({ "drained": report.drained, "remaining": report.remaining })
                );
            } else if report.drained {
                println!("  All runs drained.");
            } else {
                println!("  {} run(s) still active at exit.", style(report.remaining).red());
            }

            if report.drained {
                task.await.context("run task panicked")?.map_err(anyhow::Error::from)
            } else {
                task.abort();
                Err(anyhow!("shutdown with {} run(s) still active", report.remaining))
            }
        }
    };

    if let Some(printer) = printer {
        tokio::task::yield_now().await;
        printer.abort();
    }
    result
}

fn spawn_event_printer(mut events: broadcast::Receiver<LifecycleEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("  {} {}", style("->").dim(), style(event.name()).dim());
        }
    })
}

// ---------------------------------------------------------------------------
// Status / List
// ---------------------------------------------------------------------------

pub async fn handle_status(state: &AppState, run_id: Uuid, json: bool) -> Result<()> {
    print_run(state, run_id, json).await
}

pub async fn handle_list(state: &AppState, limit: u32, json: bool) -> Result<()> {
    let runs = state
        .store
        .list_runs(limit)
        .await
        .map_err(|e| anyhow!("Failed to list runs: {e}"))?;

    if json {
        let out: Vec<Value> = runs
            .iter()
            .map(|r| {
                serde_json::json!({
                    "id": r.id,
                    "workflowId": r.workflow_id,
                    "status": r.status,
                    "testMode": r.test_mode,
                    "createdAt": r.created_at,
                    "updatedAt": r.updated_at,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No runs in {}", style(state.data_dir.display()).dim());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Created"),
            Cell::new("Updated"),
        ]);

    for r in &runs {
        table.add_row(vec![
            Cell::new(short_id(&r.id)),
            Cell::new(&r.workflow_id),
            run_status_cell(r.status),
            Cell::new(r.created_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(r.updated_at.format("%Y-%m-%d %H:%M:%S").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

async fn print_run(state: &AppState, run_id: Uuid, json: bool) -> Result<()> {
    let run = state
        .store
        .get_run(&run_id)
        .await
        .map_err(|e| anyhow!("Failed to get run: {e}"))?
        .ok_or_else(|| anyhow!("Run '{run_id}' not found"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(());
    }

    // Show nodes in definition order when the definition still resolves.
    let nodes: Vec<(String, String)> = match state.store.resolve(&run).await {
        Ok(definition) => definition
            .nodes
            .iter()
            .map(|n| (n.id.clone(), n.node_type.clone()))
            .collect(),
        Err(e) => {
            tracing::debug!(run_id = %run_id, error = %e, "definition unavailable for status view");
            run.node_states
                .keys()
                .map(|id| (id.clone(), "-".to_string()))
                .collect()
        }
    };

    println!();
    println!(
        "  Run {} ({}) {}",
        style(run.id).cyan(),
        run.workflow_id,
        style_run_status(run.status)
    );
    if let Some(source) = run.resume_from_run_id {
        println!("  Resumed from: {}", style(source).dim());
    }
    if let Some(error) = &run.error {
        println!("  Error: {}", style(error).red());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Node").fg(Color::Cyan),
            Cell::new("Type"),
            Cell::new("Status"),
            Cell::new("Attempts"),
            Cell::new("Duration"),
            Cell::new("Error"),
        ]);

    for (id, node_type) in &nodes {
        let node_state = run.node_states.get(id);
        let status = node_state.map(|s| s.status).unwrap_or_default();
        table.add_row(vec![
            Cell::new(id),
            Cell::new(node_type),
            node_status_cell(status),
            Cell::new(node_state.map(|s| s.attempts).unwrap_or(0)),
            Cell::new(
                node_state
                    .and_then(|s| s.duration_ms)
                    .map(format_duration_ms)
                    .unwrap_or_else(|| "-".to_string()),
            ),
            Cell::new(node_state.and_then(|s| s.error.as_deref()).unwrap_or("")),
        ]);
    }

    println!("{table}");

    if run.status == RunStatus::WaitingApproval {
        if let Some(node_id) = waiting_node(&run) {
            println!(
                "  Waiting for approval. Continue with: {}",
                style(format!("flowpilot approve {} {node_id}", run.id)).yellow()
            );
        }
    } else if run.status == RunStatus::Failed {
        println!(
            "  Continue from the last checkpoint with: {}",
            style(format!("flowpilot resume {}", run.id)).yellow()
        );
    }
    println!();

    Ok(())
}

/// Node of the most recent `waiting_approval` log entry.
fn waiting_node(run: &Run) -> Option<&str> {
    run.logs
        .iter()
        .rev()
        .find(|l| l.event == "waiting_approval")
        .and_then(|l| l.node_id.as_deref())
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

fn short_id(id: &Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

fn format_duration_ms(ms: u64) -> String {
    if ms < 1_000 {
        format!("{ms}ms")
    } else {
        format!("{:.1}s", ms as f64 / 1_000.0)
    }
}

fn style_run_status(status: RunStatus) -> console::StyledObject<&'static str> {
    let text = status.as_str();
    match status {
        RunStatus::Succeeded => style(text).green().bold(),
        RunStatus::Failed => style(text).red().bold(),
        RunStatus::WaitingApproval => style(text).magenta().bold(),
        RunStatus::Running => style(text).blue(),
        RunStatus::Pending => style(text).yellow(),
    }
}

fn run_status_cell(status: RunStatus) -> Cell {
    let cell = Cell::new(status.as_str());
    match status {
        RunStatus::Pending => cell.fg(Color::Yellow),
        RunStatus::Running => cell.fg(Color::Blue),
        RunStatus::WaitingApproval => cell.fg(Color::Magenta),
        RunStatus::Succeeded => cell.fg(Color::Green),
        RunStatus::Failed => cell.fg(Color::Red),
    }
}

fn node_status_cell(status: NodeStatus) -> Cell {
    let cell = Cell::new(status.as_str());
    match status {
        NodeStatus::Queued => cell.fg(Color::Yellow),
        NodeStatus::Running => cell.fg(Color::Blue),
        NodeStatus::Succeeded => cell.fg(Color::Green),
        NodeStatus::Failed => cell.fg(Color::Red),
        NodeStatus::Skipped => cell.fg(Color::DarkGrey),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowpilot_types::run::{LogLevel, RunLogEntry};
    use serde_json::json;

    #[test]
    fn input_defaults_to_empty_object() {
        assert_eq!(parse_input(None).unwrap(), json!({}));
        assert_eq!(parse_input(Some(r#"{"a":1}"#)).unwrap(), json!({ "a": 1 }));
    }

    #[test]
    fn input_must_be_object() {
        assert!(parse_input(Some("[1,2]")).is_err());
        assert!(parse_input(Some("{oops")).is_err());
    }

    #[test]
    fn durations() {
        assert_eq!(format_duration_ms(42), "42ms");
        assert_eq!(format_duration_ms(1_500), "1.5s");
    }

    #[test]
    fn waiting_node_uses_latest_entry() {
        let mut run = Run::new("wf", json!({}), false);
        run.logs.push(RunLogEntry::node(LogLevel::Info, "first", "waiting_approval", "waiting for approval"));
        run.logs.push(RunLogEntry::node(LogLevel::Info, "first", "approval", "approval approved"));
        run.logs.push(RunLogEntry::node(LogLevel::Info, "second", "waiting_approval", "waiting for approval"));
        assert_eq!(waiting_node(&run), Some("second"));
    }
}
