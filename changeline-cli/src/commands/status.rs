//! Status command - show applied and pending changesets

use anyhow::Result;
use colored::Colorize;

use super::{load_config, open_facade, selection, GlobalArgs};
use crate::output;

pub fn run(
    global: &GlobalArgs,
    contexts: Option<&str>,
    labels: Option<&str>,
    verbose: bool,
    json: bool,
) -> Result<()> {
    let config = load_config(global)?;
    let contexts = selection(contexts, config.contexts());
    let labels = selection(labels, config.labels());
    let mut facade = open_facade(global, &config)?;
    let status = facade.status(&contexts, &labels)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("{}", "Migration Status".bold());
    println!();

    let mut table = output::create_table();
    table.add_row(vec!["Changelog", config.change_log.as_str()]);
    table.add_row(vec!["Applied", &status.applied.len().to_string()]);
    table.add_row(vec!["Pending", &status.pending.len().to_string()]);
    println!("{}", table);
    println!();

    if verbose && !status.applied.is_empty() {
        let mut applied = output::create_table();
        applied.set_header(vec!["#", "Changeset", "Type", "Executed", "Deployment"]);
        for entry in &status.applied {
            applied.add_row(vec![
                entry.order_executed.to_string(),
                entry.changeset.to_string(),
                entry.exec_type.to_string(),
                entry.date_executed.format("%Y-%m-%d %H:%M:%S").to_string(),
                entry.deployment_id.clone(),
            ]);
        }
        println!("{}", applied);
        println!();
    }

    if status.is_up_to_date() {
        output::success("Database is up to date");
    } else {
        println!("{}", "Pending Changesets".bold());
        for pending in &status.pending {
            println!(
                "  • {} {} {}",
                pending.changeset,
                format!("({:?})", pending.reason).dimmed(),
                pending.description
            );
        }
    }

    if !status.unknown.is_empty() {
        println!();
        output::warning("Applied changesets missing from the changelog:");
        for id in &status.unknown {
            println!("  • {}", id);
        }
    }

    Ok(())
}
