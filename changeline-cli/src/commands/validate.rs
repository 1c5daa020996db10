//! Validate command - checksum drift and SQL syntax checks

use anyhow::{bail, Result};
use colored::Colorize;

use super::{load_config, open_facade, GlobalArgs};
use crate::output;

pub fn run(global: &GlobalArgs, json: bool) -> Result<()> {
    let config = load_config(global)?;
    let mut facade = open_facade(global, &config)?;
    let report = facade.validate()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Checked {} changesets", report.changesets);

        if !report.checksum_errors.is_empty() {
            println!();
            println!("{}", "Checksum Errors".red().bold());
            for err in &report.checksum_errors {
                println!("  • {}", err);
            }
        }
        if !report.syntax_warnings.is_empty() {
            println!();
            println!("{}", "Syntax Warnings".yellow().bold());
            for warning in &report.syntax_warnings {
                println!("  • {}", warning);
            }
        }
        if !report.missing_rollback.is_empty() {
            println!();
            println!("{}", "No Automatic Rollback".bold());
            for id in &report.missing_rollback {
                println!("  • {}", id);
            }
        }

        if report.is_valid() {
            println!();
            output::success("Changelog is valid");
        }
    }

    if !report.is_valid() {
        bail!(
            "{} changesets were modified after they were applied",
            report.checksum_errors.len()
        );
    }
    Ok(())
}
