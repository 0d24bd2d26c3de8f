//! meow CLI entry point.
//!
//! Binary name: `meow`
//!
//! Parses CLI arguments, initializes tracing, then dispatches to the
//! appropriate command handler. `run` and `resume` host the orchestrator
//! for the lifetime of the command.

mod cli;
mod orchestrator;

use clap::Parser;
use clap_complete::generate;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use orchestrator::canonical_project_root;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.otel {
        meow_observe::tracing_setup::init_tracing(true)
            .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;
    } else {
        let filter = match cli.verbose {
            0 if cli.quiet => "error",
            0 => "warn",
            1 => "info,meow=debug",
            _ => "trace",
        };
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(filter))
            .with_target(false)
            .init();
    }

    // Shell completions don't need project state.
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "meow", &mut std::io::stdout());
        return Ok(());
    }

    let project_root = canonical_project_root(&cli.project_root);

    let exit_code = match cli.command {
        Commands::Run { template, vars } => {
            cli::workflow::handle_run(&project_root, &template, &vars, cli.json).await?
        }
        Commands::Resume => cli::workflow::handle_resume(&project_root, cli.json).await?,
        Commands::List { status } => {
            cli::workflow::handle_list(&project_root, status.as_deref(), cli.json).await?;
            0
        }
        Commands::Status { id } => {
            cli::workflow::handle_status(&project_root, &id, cli.json).await?;
            0
        }
        Commands::Cancel { id } => {
            cli::workflow::handle_cancel(&project_root, &id, cli.json).await?;
            0
        }
        Commands::Approve {
            workflow,
            gate,
            deny,
            notes,
        } => {
            cli::workflow::handle_approve(
                &project_root,
                &workflow,
                &gate,
                !deny,
                notes.as_deref(),
                cli.json,
            )
            .await?;
            0
        }
        Commands::Completions { .. } => unreachable!("handled above"),
    };

    if cli.otel {
        meow_observe::tracing_setup::shutdown_tracing();
    }

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
