//! CLI argument definitions for the `meow` binary.

pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Workflow orchestration for terminal-hosted coding agents.
#[derive(Parser)]
#[command(name = "meow", version, about)]
pub struct Cli {
    /// Project root (holds the .meow directory).
    #[arg(long, global = true, default_value = ".")]
    pub project_root: PathBuf,

    /// Emit machine-readable JSON instead of tables.
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Bridge tracing spans to OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Submit a template and drive the resulting workflow to completion.
    Run {
        /// Template reference: lib/<name>, a module path, or
        /// <path>#<workflow>.
        template: String,

        /// Workflow variables as key=value pairs (values parsed as JSON
        /// when possible).
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
    },

    /// Resume orchestration after a crash or restart.
    Resume,

    /// List workflows.
    List {
        /// Filter by status (pending, running, done, failed, cancelled).
        #[arg(long)]
        status: Option<String>,
    },

    /// Show one workflow's steps and agents.
    Status {
        /// Workflow identifier.
        id: String,
    },

    /// Cancel a workflow.
    Cancel {
        /// Workflow identifier.
        id: String,
    },

    /// Respond to an approval gate.
    Approve {
        /// Workflow identifier.
        workflow: String,

        /// Gate step identifier.
        gate: String,

        /// Deny instead of approving.
        #[arg(long)]
        deny: bool,

        /// Free-form reviewer notes.
        #[arg(long)]
        notes: Option<String>,
    },

    /// Generate shell completions.
    Completions {
        /// Target shell.
        shell: clap_complete::Shell,
    },
}
