//! Changeline CLI - schema migrations from a JSON changelog

use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod output;

use commands::{drop_all, locks, logs, rollback, status, update, validate, GlobalArgs};

/// Changeline - changelog-driven schema migrations
#[derive(Parser)]
#[command(name = "changeline", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending changesets
    Update {
        /// Comma-separated contexts to run (default: all)
        #[arg(long)]
        contexts: Option<String>,
        /// Comma-separated labels to run (default: all)
        #[arg(long)]
        labels: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the SQL that update would run, without running it
    UpdateSql {
        #[arg(long)]
        contexts: Option<String>,
        #[arg(long)]
        labels: Option<String>,
    },

    /// Show applied and pending changesets
    Status {
        #[arg(long)]
        contexts: Option<String>,
        #[arg(long)]
        labels: Option<String>,
        /// List every applied changeset
        #[arg(long, short)]
        verbose: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check the changelog for checksum drift and SQL syntax problems
    Validate {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Roll back every changeset applied after TARGET
    Rollback {
        /// Changeset to roll back to: id, id::author or path::id::author
        target: String,
        /// Skip confirmation prompt
        #[arg(long, short)]
        force: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Roll back the last COUNT applied changesets
    RollbackCount {
        count: usize,
        /// Skip confirmation prompt
        #[arg(long, short)]
        force: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Drop every view, table and sequence in the target schema
    DropAll {
        /// Skip confirmation prompt
        #[arg(long, short)]
        force: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show who holds the migration lock
    Locks {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Forcibly release the migration lock
    ReleaseLocks {
        /// Skip confirmation prompt
        #[arg(long, short)]
        force: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// View and manage the event log
    Logs {
        #[command(subcommand)]
        command: logs::LogsCommands,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let result = run(cli);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            output::error(&format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let global = cli.global;
    match cli.command {
        Commands::Update { contexts, labels, json } => {
            update::run(&global, contexts.as_deref(), labels.as_deref(), json)
        }
        Commands::UpdateSql { contexts, labels } => {
            update::run_sql(&global, contexts.as_deref(), labels.as_deref())
        }
        Commands::Status { contexts, labels, verbose, json } => {
            status::run(&global, contexts.as_deref(), labels.as_deref(), verbose, json)
        }
        Commands::Validate { json } => validate::run(&global, json),
        Commands::Rollback { target, force, json } => rollback::run(&global, &target, force, json),
        Commands::RollbackCount { count, force, json } => {
            rollback::run_count(&global, count, force, json)
        }
        Commands::DropAll { force, json } => drop_all::run(&global, force, json),
        Commands::Locks { json } => locks::run(&global, json),
        Commands::ReleaseLocks { force, json } => locks::run_release(&global, force, json),
        Commands::Logs { command } => logs::run(&global, command),
    }
}
