//! Rollback commands - undo applied changesets

use anyhow::Result;

use changeline_core::{ChangeSetRef, ExecutionReport, LogEvent, OutcomeStatus};

use super::{confirm, get_logger, load_config, log_event, open_facade, GlobalArgs};
use crate::output;

pub fn run(global: &GlobalArgs, target: &str, force: bool, json: bool) -> Result<()> {
    let target = ChangeSetRef::parse(target);
    if !confirm(
        &format!("Roll back every changeset applied after {}?", target),
        force,
        json,
    )? {
        println!("Cancelled.");
        return Ok(());
    }

    let config = load_config(global)?;
    let logger = get_logger(global);
    let mut facade = open_facade(global, &config)?;
    let result = facade.rollback(&target);
    finish(&logger, "rollback", result, json)
}

pub fn run_count(global: &GlobalArgs, count: usize, force: bool, json: bool) -> Result<()> {
    if !confirm(
        &format!("Roll back the last {} changesets?", count),
        force,
        json,
    )? {
        println!("Cancelled.");
        return Ok(());
    }

    let config = load_config(global)?;
    let logger = get_logger(global);
    let mut facade = open_facade(global, &config)?;
    let result = facade.rollback_count(count);
    finish(&logger, "rollback-count", result, json)
}

fn finish(
    logger: &Option<changeline_core::EventLogService>,
    command: &str,
    result: changeline_core::Result<ExecutionReport>,
    json: bool,
) -> Result<()> {
    match result {
        Ok(report) => {
            log_event(
                logger,
                LogEvent::new("rollback_completed")
                    .with_command(command)
                    .with_deployment(&report.deployment_id),
            );
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if report.outcomes.is_empty() {
                output::info("Nothing to roll back");
            } else {
                output::print_report(&report);
                output::success(&format!(
                    "Rolled back {} changesets",
                    report.count(OutcomeStatus::RolledBack)
                ));
            }
            Ok(())
        }
        Err(e) => {
            let mut event = LogEvent::new("rollback_failed")
                .with_command(command)
                .with_error(e.to_string());
            if let Some(report) = e.report() {
                event = event.with_deployment(&report.deployment_id);
                if !json {
                    output::print_report(report);
                }
            }
            log_event(logger, event);
            Err(e.into())
        }
    }
}
