//! Update commands - apply pending changesets or print their SQL

use anyhow::{bail, Result};
use colored::Colorize;

use changeline_core::{LogEvent, OutcomeStatus};

use super::{get_logger, load_config, log_event, open_facade, selection, GlobalArgs};
use crate::output;

pub fn run(global: &GlobalArgs, contexts: Option<&str>, labels: Option<&str>, json: bool) -> Result<()> {
    let config = load_config(global)?;
    let contexts = selection(contexts, config.contexts());
    let labels = selection(labels, config.labels());
    let logger = get_logger(global);
    let mut facade = open_facade(global, &config)?;

    log_event(&logger, LogEvent::new("update_started").with_command("update"));

    let report = match facade.update(&contexts, &labels) {
        Ok(report) => report,
        Err(e) => {
            let mut event = LogEvent::new("update_failed")
                .with_command("update")
                .with_error(e.to_string());
            if let Some(report) = e.report() {
                event = event.with_deployment(&report.deployment_id);
                if json {
                    println!("{}", serde_json::to_string_pretty(report)?);
                } else {
                    output::print_report(report);
                }
            }
            log_event(&logger, event);
            return Err(e.into());
        }
    };

    let mut event = LogEvent::new("update_completed")
        .with_command("update")
        .with_deployment(&report.deployment_id);
    if let Some(error) = &report.first_error {
        event = event.with_error(error);
    }
    log_event(&logger, event);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if report.outcomes.is_empty() && !report.cancelled {
        output::success("Database is up to date");
    } else {
        output::print_report(&report);
        println!(
            "{} applied, {} marked ran, {} skipped, {} failed (deployment {})",
            report.applied_count().to_string().bold(),
            report.count(OutcomeStatus::MarkRan),
            report.count(OutcomeStatus::Skipped),
            report.count(OutcomeStatus::Failed),
            report.deployment_id
        );
        if report.cancelled {
            output::warning("Update was cancelled before all changesets ran");
        }
    }

    if let Some(error) = &report.first_error {
        bail!("Update finished with failures: {}", error);
    }
    Ok(())
}

pub fn run_sql(global: &GlobalArgs, contexts: Option<&str>, labels: Option<&str>) -> Result<()> {
    let config = load_config(global)?;
    let contexts = selection(contexts, config.contexts());
    let labels = selection(labels, config.labels());
    let mut facade = open_facade(global, &config)?;

    let sql = facade.update_sql(&contexts, &labels)?;
    if sql.is_empty() {
        output::info("-- Nothing to update");
    } else {
        print!("{}", sql);
    }
    Ok(())
}
