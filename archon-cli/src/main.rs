//! speckit-archon: silent Archon integration for spec-driven workflows.
//!
//! # Usage
//!
//! ```text
//! speckit-archon emit <init|docs|tasks|status> <feature_dir> [--mode push|pull]
//! speckit-archon probe [<dir>] [--explain]
//! speckit-archon store get|set|meta-get|meta-set|list ...
//! speckit-archon queue list|requeue ...
//! speckit-archon daemon start|run-once|stop|status|logs
//! ```
//!
//! `emit` and `probe` are called from workflow scripts: they print nothing and
//! exit 0 whatever happens. Everything else is operator tooling.

mod commands;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use archon_core::{FeatureId, Settings};
use commands::{
    daemon::DaemonCommand, emit::EmitArgs, probe::ProbeArgs, queue::QueueCommand,
    store::StoreCommand,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "speckit-archon",
    version,
    about = "Fire-and-forget sync between feature artifacts and Archon",
    long_about = None,
)]
struct Cli {
    /// Workspace to operate on (defaults to the current directory).
    #[arg(long, global = true, value_name = "DIR")]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Queue a sync request for a feature. Silent; always exits 0.
    Emit(EmitArgs),

    /// Check whether the integration is usable. Silent unless --explain.
    Probe(ProbeArgs),

    /// Inspect or edit the local id mapping store.
    Store {
        #[command(subcommand)]
        command: StoreCommand,
    },

    /// Inspect pending, in-flight and dead-lettered requests.
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },

    /// Run or control the consumer daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

// ---------------------------------------------------------------------------
// Shared argument helpers
// ---------------------------------------------------------------------------

pub(crate) fn parse_feature(raw: &str) -> std::result::Result<FeatureId, String> {
    FeatureId::parse(raw).map_err(|e| e.to_string())
}

pub(crate) fn workspace_settings(workspace: Option<&Path>) -> Result<Settings> {
    let start = match workspace {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir().context("could not determine current directory")?,
    };
    Settings::resolve(&start)
        .with_context(|| format!("failed to load Archon settings for {}", start.display()))
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    let workspace = cli.workspace.as_deref();
    match cli.command {
        Commands::Emit(args) => {
            args.run();
            Ok(())
        }
        Commands::Probe(args) => {
            args.run(workspace);
            Ok(())
        }
        Commands::Store { command } => {
            commands::store::run(command, &workspace_settings(workspace)?)
        }
        Commands::Queue { command } => {
            commands::queue::run(command, &workspace_settings(workspace)?)
        }
        Commands::Daemon { command } => {
            commands::daemon::run(command, workspace_settings(workspace)?)
        }
    }
}
