//! CLI command definitions for the `flowpilot` binary.

pub mod run;
pub mod validate;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

/// Run workflow graphs with retries, approvals and resumable checkpoints.
#[derive(Parser)]
#[command(name = "flowpilot", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all log output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit log lines as JSON.
    #[arg(long, global = true, env = "FLOWPILOT_LOG_JSON")]
    pub log_json: bool,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true, env = "FLOWPILOT_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Register a workflow file and execute a new run of it.
    Run {
        /// Path to the workflow JSON file.
        file: PathBuf,

        /// JSON object merged into the run context.
        #[arg(long)]
        input: Option<String>,

        /// Execute the draft definition and auto-approve approval gates.
        #[arg(long)]
        test_mode: bool,
    },

    /// Record an approval decision and continue the run.
    Approve {
        run_id: Uuid,

        /// Node id of the approval gate.
        node_id: String,

        /// Reject instead of approve.
        #[arg(long)]
        reject: bool,
    },

    /// Continue a failed run from its last checkpoint as a new run.
    Resume { run_id: Uuid },

    /// Show a run and its node states.
    Status { run_id: Uuid },

    /// List recent runs.
    #[command(alias = "ls")]
    List {
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Check a workflow file for structural problems.
    Validate { file: PathBuf },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_global_flags() {
        let cli = Cli::try_parse_from([
            "flowpilot",
            "run",
            "wf.json",
            "--input",
            r#"{"a":1}"#,
            "--test-mode",
            "--json",
            "-vv",
        ])
        .unwrap();

        assert!(cli.json);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Run {
                file,
                input,
                test_mode,
            } => {
                assert_eq!(file, PathBuf::from("wf.json"));
                assert_eq!(input.as_deref(), Some(r#"{"a":1}"#));
                assert!(test_mode);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn approve_parses_uuid_and_reject() {
        let id = Uuid::now_v7();
        let cli = Cli::try_parse_from(["flowpilot", "approve", &id.to_string(), "gate", "--reject"]).unwrap();
        match cli.command {
            Commands::Approve {
                run_id,
                node_id,
                reject,
            } => {
                assert_eq!(run_id, id);
                assert_eq!(node_id, "gate");
                assert!(reject);
            }
            _ => panic!("expected approve"),
        }
    }

    #[test]
    fn invalid_run_id_rejected() {
        assert!(Cli::try_parse_from(["flowpilot", "status", "not-a-uuid"]).is_err());
    }

    #[test]
    fn list_alias() {
        let cli = Cli::try_parse_from(["flowpilot", "ls"]).unwrap();
        assert!(matches!(cli.command, Commands::List { limit: 20 }));
    }
}
