//! Logs command - what changeline did, by command and by deployment

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use clap::Subcommand;
use colored::Colorize;

use changeline_core::{EntryPoint, EventLogService, LogFilter};

use super::{confirm, GlobalArgs};
use crate::output;

#[derive(Subcommand)]
pub enum LogsCommands {
    /// Show logged events, newest first
    List {
        #[arg(short, long, default_value = "50")]
        limit: usize,
        /// Only events of this command (update, rollback, drop-all, ...)
        #[arg(long)]
        command: Option<String>,
        /// Only events of this deployment id
        #[arg(long)]
        deployment: Option<String>,
        /// Only failures
        #[arg(long)]
        errors: bool,
        #[arg(long)]
        json: bool,
    },
    /// One line per deployment: what ran and how it ended
    Deployments {
        #[arg(short, long, default_value = "20")]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Remove events older than a number of days
    Prune {
        #[arg(long, default_value = "90")]
        days: u32,
        #[arg(long, short)]
        force: bool,
        #[arg(long)]
        json: bool,
    },
    /// Event and failure counts per command
    Stats {
        #[arg(long)]
        json: bool,
    },
}

fn when(timestamp_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| format!("@{}", timestamp_ms))
}

pub fn run(global: &GlobalArgs, command: LogsCommands) -> Result<()> {
    let events = EventLogService::new(&global.log_dir, EntryPoint::Cli, env!("CARGO_PKG_VERSION"))?;

    match command {
        LogsCommands::List {
            limit,
            command,
            deployment,
            errors,
            json,
        } => {
            let mut filter = LogFilter::latest(limit);
            if let Some(command) = command {
                filter = filter.command(command);
            }
            if let Some(deployment) = deployment {
                filter = filter.deployment(deployment);
            }
            if errors {
                filter = filter.errors_only();
            }
            let entries = events.find(&filter)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                output::info("No matching events");
            } else {
                let mut table = output::create_table();
                table.set_header(vec!["When", "Command", "Event", "Deployment", "Via"]);
                for entry in &entries {
                    let event = match &entry.error_message {
                        Some(_) => entry.event.red().to_string(),
                        None => entry.event.clone(),
                    };
                    table.add_row(vec![
                        when(entry.timestamp),
                        entry.command.clone().unwrap_or_else(|| "-".to_string()),
                        event,
                        entry.deployment_id.clone().unwrap_or_else(|| "-".to_string()),
                        entry.entry_point.clone(),
                    ]);
                }
                println!("{}", table);

                for failed in entries.iter().filter(|e| e.error_message.is_some()) {
                    println!(
                        "{} {}: {}",
                        when(failed.timestamp).dimmed(),
                        failed.event.red(),
                        failed.error_message.as_deref().unwrap_or_default()
                    );
                    if let Some(details) = &failed.error_details {
                        println!("    {}", details.dimmed());
                    }
                }
            }
        }
        LogsCommands::Deployments { limit, json } => {
            let deployments = events.deployments(limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&deployments)?);
            } else if deployments.is_empty() {
                output::info("No deployments logged yet");
            } else {
                let mut table = output::create_table();
                table.set_header(vec!["Deployment", "Command", "Outcome", "Last Event", "When"]);
                for d in &deployments {
                    let outcome = if d.errors == 0 {
                        "ok".green().to_string()
                    } else {
                        format!("{} error(s)", d.errors).red().to_string()
                    };
                    table.add_row(vec![
                        d.deployment_id.clone(),
                        d.command.clone().unwrap_or_else(|| "-".to_string()),
                        outcome,
                        d.last_event.clone(),
                        when(d.last_seen),
                    ]);
                }
                println!("{}", table);
            }
        }
        LogsCommands::Prune { days, force, json } => {
            let cutoff = Utc::now() - Duration::days(i64::from(days));
            let prompt = format!("Remove events logged before {}?", cutoff.format("%Y-%m-%d"));
            if !confirm(&prompt, force, json)? {
                println!("Cancelled.");
                return Ok(());
            }

            let removed = events.prune_before(cutoff.timestamp_millis())?;
            if json {
                println!("{}", serde_json::json!({ "removed": removed, "cutoff": cutoff }));
            } else {
                output::success(&format!("Removed {} events", removed));
            }
        }
        LogsCommands::Stats { json } => {
            let per_command = events.command_stats()?;
            let total = events.count()?;
            let path = events.db_path().display().to_string();

            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "events": total,
                        "commands": per_command,
                        "path": path,
                    })
                );
            } else {
                println!("{} events in {}", total.to_string().bold(), path);
                if !per_command.is_empty() {
                    let mut table = output::create_table();
                    table.set_header(vec!["Command", "Events", "Failures", "Last Run"]);
                    for stats in &per_command {
                        table.add_row(vec![
                            stats.command.clone(),
                            stats.events.to_string(),
                            stats.errors.to_string(),
                            when(stats.last_seen),
                        ]);
                    }
                    println!("{}", table);
                }
            }
        }
    }

    Ok(())
}
