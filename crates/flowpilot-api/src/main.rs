//! Flowpilot CLI entry point.
//!
//! Binary name: `flowpilot`
//!
//! Parses CLI arguments, initializes tracing, the database and the engine,
//! then dispatches to the command handler.

mod cli;
mod state;

use std::process::ExitCode;

use clap::Parser;
use flowpilot_observe::{LogFormat, TracingOptions, init_tracing, shutdown_tracing};
use flowpilot_types::run::RunStatus;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,flowpilot=debug",
        _ => "trace",
    };
    let format = if cli.log_json { LogFormat::Json } else { LogFormat::Pretty };
    init_tracing(&TracingOptions::new(filter).with_format(format).with_otel(cli.otel))
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    // Validation is purely static and needs no database
    if let Commands::Validate { file } = &cli.command {
        let ok = cli::validate::handle_validate(file, cli.json)?;
        shutdown_tracing();
        return Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE });
    }

    let state = AppState::init().await?;

    let status = match cli.command {
        Commands::Run {
            file,
            input,
            test_mode,
        } => Some(cli::run::handle_run(&state, &file, input.as_deref(), test_mode, cli.json).await?),
        Commands::Approve {
            run_id,
            node_id,
            reject,
        } => Some(cli::run::handle_approve(&state, run_id, &node_id, !reject, cli.json).await?),
        Commands::Resume { run_id } => Some(cli::run::handle_resume(&state, run_id, cli.json).await?),
        Commands::Status { run_id } => {
            cli::run::handle_status(&state, run_id, cli.json).await?;
            None
        }
        Commands::List { limit } => {
            cli::run::handle_list(&state, limit, cli.json).await?;
            None
        }
        Commands::Validate { .. } => unreachable!("handled above"),
    };

    state.close().await;
    shutdown_tracing();

    Ok(match status {
        Some(RunStatus::Failed) => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    })
}

/// Wait for Ctrl+C or SIGTERM.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
